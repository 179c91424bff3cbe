// [[file:../fleet.note::6d0b8f4e][6d0b8f4e]]
//! The context of one cluster and its end-to-end flows.
// 6d0b8f4e ends here

// [[file:../fleet.note::95e1c7a0][95e1c7a0]]
use crate::base::Backoff;
use crate::bootstrap::{BootstrapFiles, BootstrapParams, Bootstrapper, NodePlan, Service, TrustMaterial, NODE_BOOTSTRAP_NAME, NODE_BOOTSTRAP_SCRIPT};
use crate::common::*;
use crate::compute::{ComputeApi, GceApi};
use crate::config::{FleetConfig, ShortfallPolicy};
use crate::fleetfs::{FleetFs, HadoopFs};
use crate::gateway::{GcloudShell, RemoteShell};
use crate::job::{new_job_name, plan_job, stage_program, InputFormat, JobEngine, JobSpec, HadoopStreaming, UserJob};
use crate::naming::Naming;
use crate::provision::{Cluster, ClusterSpec, Provisioner};
use crate::storage::{Gsutil, ObjectStore};
use crate::teardown::{teardown, TeardownReport};
use crate::transfer::{Transfer, TransferReport, COPY_MAPPERS};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
// 95e1c7a0 ends here

// [[file:../fleet.note::2c9f5a13][2c9f5a13]]
/// The external systems a fleet talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn ComputeApi>,
    pub shell: Arc<dyn RemoteShell>,
    pub store: Arc<dyn ObjectStore>,
    pub fs: Arc<dyn FleetFs>,
    pub engine: Arc<dyn JobEngine>,
}

/// Configuration, naming and collaborators of one cluster, passed explicitly
/// to every operation.
#[derive(Clone)]
pub struct Fleet {
    config: FleetConfig,
    naming: Naming,
    services: Collaborators,
    cancel: CancellationToken,
}

impl Fleet {
    pub fn new(config: FleetConfig, services: Collaborators, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let naming = Naming::new(&config.prefix)?;
        Ok(Self {
            config,
            naming,
            services,
            cancel,
        })
    }

    /// Connect to the production collaborators: Compute Engine, gcloud ssh,
    /// gsutil and Hadoop on the controller.
    pub async fn connect(config: FleetConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let naming = Naming::new(&config.prefix)?;
        let token = match &config.access_token {
            Some(token) => token.clone(),
            None => GceApi::access_token_from_gcloud(&config.gcloud).await?,
        };
        let api = GceApi::connect(&config.api_endpoint, &config.project, &config.zone, &token)?;
        let shell: Arc<dyn RemoteShell> = Arc::new(GcloudShell::new(&config.gcloud, &config.project, &config.zone));
        let controller = naming.controller();
        let fs = HadoopFs::new(shell.clone(), &controller, config.hadoop.clone());
        let engine = HadoopStreaming::new(shell.clone(), &controller, config.hadoop.clone(), config.timeouts.job());
        let services = Collaborators {
            api: Arc::new(api),
            shell,
            store: Arc::new(Gsutil::new(&config.gsutil)),
            fs: Arc::new(fs),
            engine: Arc::new(engine),
        };
        Self::new(config, services, cancel)
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    fn provisioner(&self) -> Provisioner {
        let timeouts = &self.config.timeouts;
        Provisioner::new(
            self.services.api.clone(),
            self.naming.clone(),
            self.config.concurrency,
            self.config.backoff(timeouts.operation()),
            self.config.backoff(timeouts.instance_start()),
            self.cancel.clone(),
        )
    }

    fn bootstrapper(&self) -> Bootstrapper {
        let timeouts = &self.config.timeouts;
        Bootstrapper::new(
            self.services.shell.clone(),
            self.config.backoff(timeouts.operation()),
            self.config.retries,
            self.config.backoff(timeouts.service_ready()),
            self.config.concurrency,
            self.cancel.clone(),
        )
    }

    fn transfer(&self) -> Result<Transfer> {
        Ok(Transfer::new(
            self.services.store.clone(),
            self.services.fs.clone(),
            self.services.engine.clone(),
            self.config.hadoop.clone(),
            self.config.program_dir()?,
            self.cancel.clone(),
        ))
    }

    fn operation_backoff(&self) -> Backoff {
        self.config.backoff(self.config.timeouts.operation())
    }
}
// 2c9f5a13 ends here

// [[file:../fleet.note::8a4c61e7][8a4c61e7]]
impl Fleet {
    /// Prepare the project and bucket: upload the programs machines fetch
    /// and check the bucket is reachable. Run once per project and bucket.
    pub async fn setup(&self) -> Result<()> {
        let tmp = self.config.tmp_storage()?;
        info!("set up temporary storage {tmp}");
        self.services
            .store
            .put(NODE_BOOTSTRAP_SCRIPT.as_bytes(), &tmp.join(NODE_BOOTSTRAP_NAME))
            .await?;
        self.upload_copy_mappers().await?;
        let objects = self.services.store.list(&tmp).await?;
        if !objects.iter().any(|x| x.file_name() == NODE_BOOTSTRAP_NAME) {
            return Err(ClusterError::transfer(
                tmp.join(NODE_BOOTSTRAP_NAME).as_str(),
                "not found after upload",
            ));
        }
        info!("environment is ready in project {}", self.config.project);
        Ok(())
    }

    async fn upload_copy_mappers(&self) -> Result<()> {
        let dir = self.config.program_dir()?;
        for (name, content) in COPY_MAPPERS {
            self.services.store.put(content.as_bytes(), &dir.join(name)).await?;
        }
        Ok(())
    }

    /// Start a cluster of one controller and `num_workers` workers with a
    /// freshly generated key pair.
    pub async fn start(&self, num_workers: usize) -> Result<Cluster> {
        let trust = TrustMaterial::generate(&self.config.hadoop.user).await?;
        self.start_with(num_workers, trust).await
    }

    /// Start a cluster using `trust` for ssh between machines.
    pub async fn start_with(&self, num_workers: usize, trust: TrustMaterial) -> Result<Cluster> {
        let spec = ClusterSpec {
            num_workers,
            image: self.config.image.clone(),
            machine_type: self.config.machine_type.clone(),
            external_ip: self.config.external_ip,
            command: self.config.command.clone(),
            tmp_storage: self.config.tmp_storage()?,
            ssh_user: self.config.hadoop.user.clone(),
            public_key: trust.public_key().to_string(),
            scopes: self.config.scopes.clone(),
        };
        info!("start cluster {:?} with {num_workers} workers", self.naming.prefix());

        let provisioner = self.provisioner();
        provisioner.preflight(&spec).await?;
        let report = match provisioner.launch(&spec).await {
            Ok(report) => report,
            // creates already issued are kept on interrupt
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                self.roll_back(&e).await;
                return Err(e);
            }
        };
        if !report.is_complete() {
            let shortfall = match self.config.on_shortfall {
                ShortfallPolicy::Abort => Err(ClusterError::Provision { failed: report.failed.clone() }),
                ShortfallPolicy::Proceed => self.check_viable(&report.cluster, num_workers),
            };
            if let Err(e) = shortfall {
                self.roll_back(&e).await;
                return Err(e);
            }
        }

        let cluster = report.cluster;
        let files = Arc::new(BootstrapFiles::prepare(trust, &cluster.hosts())?);
        let workers = cluster.workers.iter().map(|m| m.name.clone()).collect_vec();
        let nodes = cluster
            .machines()
            .map(|m| NodePlan {
                machine: m.name.clone(),
                params: BootstrapParams {
                    machine: m.name.clone(),
                    role: m.role,
                    controller: cluster.controller.name.clone(),
                    workers: workers.clone(),
                    hadoop_user: self.config.hadoop.user.clone(),
                    hadoop_home: self.config.hadoop.home.clone(),
                    tmp_storage: spec.tmp_storage.to_string(),
                    services: Service::enabled_for(m.role).to_vec(),
                    command: self.config.command.clone(),
                },
            })
            .collect_vec();
        let report = self.bootstrapper().bootstrap(nodes, files).await;

        let cluster = match report.error() {
            None => cluster,
            Some(e) if report.failed.contains_key(&cluster.controller.name) => return Err(e),
            Some(e) => match self.config.on_shortfall {
                ShortfallPolicy::Abort => return Err(e),
                ShortfallPolicy::Proceed => {
                    warn!("continue without machines: {e}");
                    let cluster = Cluster {
                        workers: cluster
                            .workers
                            .into_iter()
                            .filter(|m| !report.failed.contains_key(&m.name))
                            .collect(),
                        ..cluster
                    };
                    self.check_viable(&cluster, num_workers)?;
                    cluster
                }
            },
        };

        if let Some(ip) = cluster.controller.external_ip.as_deref() {
            info!("");
            info!("HDFS Console  http://{ip}:50070/");
            info!("MapReduce Console  http://{ip}:50030/");
            info!("");
        }
        Ok(cluster)
    }

    /// Delete the machines of a start that failed with `cause`.
    async fn roll_back(&self, cause: &ClusterError) {
        warn!("rolling back partially started cluster: {cause}");
        if let Err(e) = self.shutdown().await {
            error!("rollback failed: {e}");
        }
    }

    /// A degraded cluster is usable with its controller and at least one
    /// worker.
    fn check_viable(&self, cluster: &Cluster, num_workers: usize) -> Result<()> {
        if num_workers > 0 && cluster.workers.is_empty() {
            return Err(ClusterError::validation(
                format!("cluster {:?}", self.naming.prefix()),
                "no worker is ready",
            ));
        }
        Ok(())
    }

    /// Readiness barrier before jobs: the running cluster of this prefix,
    /// with its controller and at least one worker.
    pub async fn probe(&self) -> Result<Cluster> {
        let cluster = Cluster::discover(self.services.api.as_ref(), &self.naming)
            .await?
            .ok_or_else(|| ClusterError::validation(
                format!("cluster {:?}", self.naming.prefix()),
                format!("controller {} is not running", self.naming.controller()),
            ))?;
        self.check_viable(&cluster, 1)?;
        Ok(cluster)
    }

    /// Run `job` on the running cluster: copy its input into the fleet, run
    /// it, and copy its results out.
    pub async fn mapreduce(&self, job: &UserJob) -> Result<TransferReport> {
        let cluster = self.probe().await?;
        info!("run job on {} with {} workers", cluster.controller.name, cluster.workers.len());
        self.upload_copy_mappers().await?;

        let store = self.services.store.as_ref();
        let program_dir = self.config.program_dir()?;
        let job_name = new_job_name("job");
        let stage1 = stage_program(store, &job.mapper, &program_dir, &job_name).await?;
        let stage2 = stage_program(store, &job.reducer, &program_dir, &job_name).await?;

        let width = job.mapper_count.max(job.reducer_count).max(1);
        let work_dir = format!("/mapreduce/{job_name}");
        let input = format!("{work_dir}/inputs");
        let output = format!("{work_dir}/outputs");
        let transfer = self.transfer()?;

        let done = async {
            transfer.copy_into_fleet(&job.input, &input, width).await?;
            let spec = JobSpec {
                name: job_name.clone(),
                stage1,
                stage1_width: job.mapper_count,
                stage2,
                stage2_width: job.reducer_count,
                input: input.clone(),
                output: output.clone(),
                input_format: InputFormat::Text,
            };
            let command = plan_job(&spec, &self.config.hadoop)?;
            self.services.engine.submit(&command, &self.cancel).await?;
            transfer.copy_out_of_fleet(&output, &job.output, width).await
        }
        .await;

        if let Err(e) = self.services.fs.remove(&work_dir).await {
            warn!("failed to remove {work_dir}: {e}");
        }
        let report = done?;
        info!("job {job_name} results are in {}", job.output);
        Ok(report)
    }

    /// Start a cluster, run `job` on it, and tear it down afterwards when
    /// `shutdown` is set, whatever the job outcome.
    pub async fn run(&self, num_workers: usize, job: &UserJob, shutdown: bool) -> Result<TransferReport> {
        let result = async {
            self.start(num_workers).await?;
            self.mapreduce(job).await
        }
        .await;
        if shutdown {
            match (self.shutdown().await, &result) {
                (Err(e), Err(_)) => error!("shutdown after failed job: {e}"),
                (Err(e), Ok(_)) => return Err(e),
                (Ok(_), _) => {}
            }
        }
        result
    }

    /// Delete every machine of this cluster.
    pub async fn shutdown(&self) -> Result<TeardownReport> {
        info!("shut down cluster {:?}", self.naming.prefix());
        teardown(
            self.services.api.clone(),
            &self.naming,
            self.config.concurrency,
            self.operation_backoff(),
            self.cancel.clone(),
        )
        .await
    }
}
// 8a4c61e7 ends here
