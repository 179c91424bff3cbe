// [[file:../fleet.note::51c7e0a2][51c7e0a2]]
//! Create the machines of a cluster and wait until they run.
// 51c7e0a2 ends here

// [[file:../fleet.note::0db3f6e9][0db3f6e9]]
use crate::base::{for_each_bounded, Backoff};
use crate::bootstrap::{render_hosts, Service};
use crate::common::*;
use crate::compute::{wait_operation, ComputeApi, Instance, InstanceRequest, RouteRequest};
use crate::config::ExternalIp;
use crate::naming::{Naming, Role};
use crate::storage::ObjectUri;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
// 0db3f6e9 ends here

// [[file:../fleet.note::c0a5e7f4][c0a5e7f4]]
/// What to create.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub num_workers: usize,
    pub image: String,
    pub machine_type: String,
    pub external_ip: ExternalIp,
    /// Custom command run on every machine after set-up.
    pub command: Option<String>,
    pub tmp_storage: ObjectUri,
    /// Login user and public key installed on every machine.
    pub ssh_user: String,
    pub public_key: String,
    pub scopes: Vec<String>,
}

/// One machine of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub role: Role,
    pub index: Option<usize>,
    /// Has an external address.
    pub external: bool,
    pub metadata: BTreeMap<String, String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

impl Machine {
    fn from_instance(naming: &Naming, instance: &Instance) -> Option<Self> {
        let (role, index) = naming.parse(&instance.name)?;
        Some(Self {
            name: instance.name.clone(),
            role,
            index,
            external: instance.external_ip().is_some(),
            metadata: BTreeMap::new(),
            internal_ip: instance.internal_ip().map(|x| x.to_string()),
            external_ip: instance.external_ip().map(|x| x.to_string()),
        })
    }

    fn update(&mut self, instance: &Instance) {
        self.external = instance.external_ip().is_some();
        self.internal_ip = instance.internal_ip().map(|x| x.to_string());
        self.external_ip = instance.external_ip().map(|x| x.to_string());
    }
}

/// The running machines of a cluster, controller first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub controller: Machine,
    pub workers: Vec<Machine>,
}

impl Cluster {
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        std::iter::once(&self.controller).chain(self.workers.iter())
    }

    pub fn names(&self) -> Vec<String> {
        self.machines().map(|m| m.name.clone()).collect()
    }

    /// The cluster hosts file. Machines without an internal address are left
    /// out.
    pub fn hosts(&self) -> String {
        render_hosts(
            self.machines()
                .filter_map(|m| Some((m.name.as_str(), m.internal_ip.as_deref()?))),
        )
    }

    /// Reconstruct the running cluster of `naming` from the live machine
    /// list. Return None if its controller does not run.
    pub async fn discover(api: &dyn ComputeApi, naming: &Naming) -> Result<Option<Self>> {
        let instances = api.list_instances(&naming.filter_expression()).await?;
        let mut controller = None;
        let mut workers = vec![];
        for instance in instances.iter().filter(|x| x.is_running()) {
            let Some(machine) = Machine::from_instance(naming, instance) else {
                continue;
            };
            match machine.role {
                Role::Controller => controller = Some(machine),
                Role::Worker => workers.push(machine),
            }
        }
        workers.sort_by_key(|m| m.index);
        Ok(controller.map(|controller| Self { controller, workers }))
    }
}

/// Outcome of provisioning: the machines that run, and the ones that did
/// not start with the reason.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub cluster: Cluster,
    /// machine -> reason
    pub failed: BTreeMap<String, String>,
}

impl ProvisionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
// c0a5e7f4 ends here

// [[file:../fleet.note::7f3a9c68][7f3a9c68]]
/// Creates the machines of one cluster.
#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn ComputeApi>,
    naming: Naming,
    concurrency: usize,
    /// polling schedule of API operations
    operation: Backoff,
    /// polling schedule of machine start
    start: Backoff,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(
        api: Arc<dyn ComputeApi>,
        naming: Naming,
        concurrency: usize,
        operation: Backoff,
        start: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            naming,
            concurrency,
            operation,
            start,
            cancel,
        }
    }

    /// The machines to create for `spec`, controller first.
    pub fn plan(&self, spec: &ClusterSpec) -> Vec<(Machine, InstanceRequest)> {
        let controller = self.naming.controller();
        let controller_only = spec.external_ip == ExternalIp::Controller;
        let roles = std::iter::once((Role::Controller, None)).chain((0..spec.num_workers).map(|i| (Role::Worker, Some(i))));
        roles
            .map(|(role, index)| {
                let name = match index {
                    Some(i) => self.naming.worker(i),
                    None => controller.clone(),
                };
                let external = role == Role::Controller || !controller_only;
                let services = Service::enabled_for(role).iter().map(|s| s.daemon()).join(",");
                let mut metadata = BTreeMap::new();
                metadata.insert("hadoop-role".to_string(), role.to_string());
                metadata.insert("hadoop-services".to_string(), services);
                metadata.insert("hadoop-num-workers".to_string(), spec.num_workers.to_string());
                metadata.insert("hadoop-controller".to_string(), controller.clone());
                metadata.insert("hadoop-tmp-storage".to_string(), spec.tmp_storage.to_string());
                metadata.insert("hadoop-external-ip".to_string(), external.to_string());
                if let Some(command) = &spec.command {
                    metadata.insert("hadoop-command".to_string(), command.clone());
                }
                metadata.insert("sshKeys".to_string(), format!("{}:{}", spec.ssh_user, spec.public_key));

                let tags = if external { vec![] } else { vec![self.naming.no_ip_tag()] };
                let request = InstanceRequest {
                    name: name.clone(),
                    machine_type: spec.machine_type.clone(),
                    image: spec.image.clone(),
                    metadata: metadata.clone(),
                    external_ip: external,
                    can_ip_forward: role == Role::Controller && controller_only,
                    tags,
                    scopes: spec.scopes.clone(),
                };
                let machine = Machine {
                    name,
                    role,
                    index,
                    external,
                    metadata,
                    internal_ip: None,
                    external_ip: None,
                };
                (machine, request)
            })
            .collect()
    }

    fn validate(spec: &ClusterSpec) -> Result<()> {
        if spec.image.is_empty() {
            return Err(ClusterError::validation("image", "must not be empty"));
        }
        if spec.machine_type.is_empty() {
            return Err(ClusterError::validation("machine type", "must not be empty"));
        }
        if spec.public_key.is_empty() {
            return Err(ClusterError::validation("public key", "must not be empty"));
        }
        Ok(())
    }

    /// Fail if any machine of this cluster already exists.
    async fn check_collision(&self) -> Result<()> {
        let existing = self
            .api
            .list_instances(&self.naming.filter_expression())
            .await?
            .into_iter()
            .map(|x| x.name)
            .filter(|name| self.naming.owns(name))
            .sorted()
            .collect_vec();
        if existing.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::NameCollision(existing))
        }
    }

    /// Issue every create request and wait for its operation. Return the
    /// failures by machine name.
    async fn create_all(&self, requests: Vec<InstanceRequest>) -> BTreeMap<String, String> {
        let names = requests.iter().map(|r| r.name.clone()).collect_vec();
        let results = for_each_bounded(requests, self.concurrency, |request| {
            let this = self.clone();
            async move {
                info!("create machine {}", request.name);
                let op = this.api.create_instance(&request).await?;
                wait_operation(this.api.as_ref(), op, &this.operation, &this.cancel).await?;
                Ok::<_, ClusterError>(())
            }
        })
        .await;
        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, r)| {
                let e = r.err()?;
                error!("failed to create {name}: {e}");
                Some((name, e.to_string()))
            })
            .collect()
    }

    /// Poll the live machine list until every machine of `pending` runs.
    /// Machines that never get there are returned with their last status.
    async fn wait_running(&self, pending: &[String]) -> Result<(BTreeMap<String, Instance>, BTreeMap<String, String>)> {
        let last_seen: Mutex<BTreeMap<String, Instance>> = Mutex::default();
        let filter = self.naming.filter_expression();
        let waited = self
            .start
            .wait_until("machines to start", &self.cancel, || async {
                let instances = self.api.list_instances(&filter).await?;
                let mut seen = last_seen.lock().unwrap_or_else(|e| e.into_inner());
                for instance in instances.into_iter().filter(|x| pending.contains(&x.name)) {
                    seen.insert(instance.name.clone(), instance);
                }
                let waiting = pending
                    .iter()
                    .filter(|name| !seen.get(*name).map(|x| x.is_running()).unwrap_or(false))
                    .map(|name| format!("{name}: {}", seen.get(name).map(|x| x.status.as_str()).unwrap_or("not listed")))
                    .collect_vec();
                if waiting.is_empty() {
                    Ok(Some(()))
                } else {
                    info!("waiting for machines to start: {}", waiting.join(", "));
                    Ok(None)
                }
            })
            .await;

        match waited {
            Ok(()) | Err(ClusterError::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }
        let seen = last_seen.into_inner().unwrap_or_default();
        let failed = pending
            .iter()
            .filter(|name| !seen.get(*name).map(|x| x.is_running()).unwrap_or(false))
            .map(|name| {
                let status = seen.get(name).map(|x| x.status.as_str()).unwrap_or("not listed");
                (name.clone(), format!("did not reach RUNNING, last status {status}"))
            })
            .collect();
        Ok((seen, failed))
    }

    /// Send the traffic of workers without an external address through the
    /// controller.
    async fn add_nat_route(&self) -> Result<()> {
        let request = RouteRequest {
            name: self.naming.route_name(),
            next_hop_instance: self.naming.controller(),
            dest_range: "0.0.0.0/0".into(),
            tags: vec![self.naming.no_ip_tag()],
            priority: 800,
        };
        info!("add route {}", request.name);
        let op = self.api.insert_route(&request).await?;
        wait_operation(self.api.as_ref(), op, &self.operation, &self.cancel).await?;
        Ok(())
    }

    /// Check `spec` and make sure no machine of this cluster exists yet.
    /// Nothing is created.
    pub async fn preflight(&self, spec: &ClusterSpec) -> Result<()> {
        Self::validate(spec)?;
        self.check_collision().await
    }

    /// Create the controller and `spec.num_workers` workers and wait until
    /// they run. Failed workers are reported, a failed controller fails the
    /// whole provisioning.
    pub async fn provision(&self, spec: &ClusterSpec) -> Result<ProvisionReport> {
        self.preflight(spec).await?;
        self.launch(spec).await
    }

    /// The part of [`Self::provision`] after the preflight. Machines may
    /// have been created when this fails.
    pub async fn launch(&self, spec: &ClusterSpec) -> Result<ProvisionReport> {
        let planned = self.plan(spec);
        let controller = self.naming.controller();
        let (machines, requests): (Vec<_>, Vec<_>) = planned.into_iter().unzip();
        let mut failed = self.create_all(requests).await;
        if self.cancel.is_cancelled() {
            return Err(ClusterError::Cancelled("creating machines".into()));
        }
        if failed.contains_key(&controller) {
            return Err(ClusterError::Provision { failed });
        }

        let pending = machines
            .iter()
            .map(|m| m.name.clone())
            .filter(|name| !failed.contains_key(name))
            .collect_vec();
        let (seen, not_running) = self.wait_running(&pending).await?;
        failed.extend(not_running);
        if failed.contains_key(&controller) {
            return Err(ClusterError::Provision { failed });
        }

        if spec.external_ip == ExternalIp::Controller {
            self.add_nat_route().await?;
        }

        let mut running = machines
            .into_iter()
            .filter(|m| !failed.contains_key(&m.name))
            .filter_map(|mut m| {
                m.update(seen.get(&m.name)?);
                Some(m)
            });
        let controller = running
            .next()
            .ok_or_else(|| ClusterError::Provision { failed: failed.clone() })?;
        let cluster = Cluster {
            controller,
            workers: running.collect(),
        };
        for (name, reason) in &failed {
            warn!("machine {name} did not start: {reason}");
        }
        info!("{} of {} machines are running", cluster.workers.len() + 1, spec.num_workers + 1);

        Ok(ProvisionReport { cluster, failed })
    }
}
// 7f3a9c68 ends here

// [[file:../fleet.note::e92b4d17][e92b4d17]]
#[cfg(test)]
fn test_spec(external_ip: ExternalIp) -> ClusterSpec {
    ClusterSpec {
        num_workers: 2,
        image: "image".into(),
        machine_type: "n1-highcpu-4".into(),
        external_ip,
        command: None,
        tmp_storage: ObjectUri::parse("gs://b/mapreduce/tmp").unwrap(),
        ssh_user: "hadoop".into(),
        public_key: "ssh-rsa AAAA hadoop".into(),
        scopes: vec![],
    }
}

#[test]
fn test_plan_machines() {
    use crate::compute::{ApiError, Operation};

    struct NoApi;

    #[async_trait::async_trait]
    impl ComputeApi for NoApi {
        async fn create_instance(&self, _: &InstanceRequest) -> Result<Operation, ApiError> {
            unimplemented!()
        }
        async fn get_instance(&self, _: &str) -> Result<Option<Instance>, ApiError> {
            unimplemented!()
        }
        async fn list_instances(&self, _: &str) -> Result<Vec<Instance>, ApiError> {
            unimplemented!()
        }
        async fn delete_instance(&self, _: &str) -> Result<Operation, ApiError> {
            unimplemented!()
        }
        async fn get_operation(&self, _: &Operation) -> Result<Operation, ApiError> {
            unimplemented!()
        }
        async fn insert_route(&self, _: &RouteRequest) -> Result<Operation, ApiError> {
            unimplemented!()
        }
        async fn delete_route(&self, _: &str) -> Result<Operation, ApiError> {
            unimplemented!()
        }
    }

    let backoff = Backoff::new(std::time::Duration::from_millis(1), std::time::Duration::from_secs(1));
    let naming = Naming::new("ab").unwrap();
    let provisioner = Provisioner::new(Arc::new(NoApi), naming, 4, backoff, backoff, CancellationToken::new());

    let planned = provisioner.plan(&test_spec(ExternalIp::All));
    let names = planned.iter().map(|(m, _)| m.name.as_str()).collect_vec();
    assert_eq!(names, ["ab-hm", "ab-hw-000", "ab-hw-001"]);
    assert!(planned.iter().all(|(_, r)| r.external_ip && !r.can_ip_forward && r.tags.is_empty()));
    let (_, worker) = &planned[1];
    assert_eq!(worker.metadata["hadoop-role"], "worker");
    assert_eq!(worker.metadata["hadoop-services"], "datanode,tasktracker");
    assert_eq!(worker.metadata["hadoop-controller"], "ab-hm");
    assert_eq!(worker.metadata["sshKeys"], "hadoop:ssh-rsa AAAA hadoop");

    let planned = provisioner.plan(&test_spec(ExternalIp::Controller));
    let (_, controller) = &planned[0];
    assert!(controller.external_ip && controller.can_ip_forward);
    let (_, worker) = &planned[2];
    assert!(!worker.external_ip && !worker.can_ip_forward);
    assert_eq!(worker.tags, ["ab-hw-no-ip"]);
}
// e92b4d17 ends here
