// [[file:../../fleet.note::5c1e9a07][5c1e9a07]]
//! In-memory collaborators for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gosh_fleet::base::Backoff;
use gosh_fleet::compute::*;
use gosh_fleet::config::{FleetConfig, Timeouts};
use gosh_fleet::fleetfs::{FleetFs, FsEntry};
use gosh_fleet::gateway::{GatewayError, RemoteShell, RunMode};
use gosh_fleet::job::{JobEngine, SubmissionCommand};
use gosh_fleet::storage::{ObjectStore, ObjectUri};
use gosh_fleet::transfer::{Manifest, FLEET_TO_STORE_MAPPER, STORE_TO_FLEET_MAPPER};
use gosh_fleet::{ClusterError, Collaborators, Result};
// 5c1e9a07 ends here

// [[file:../../fleet.note::0f4b72d3][0f4b72d3]]
pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(5), Duration::from_millis(200))
}

pub fn test_config(prefix: &str) -> FleetConfig {
    FleetConfig {
        project: "project-hoge".into(),
        bucket: "bucket-fuga".into(),
        prefix: prefix.into(),
        concurrency: 4,
        retries: 2,
        timeouts: Timeouts {
            poll_interval: 0.005,
            max_poll_interval: 0.02,
            instance_start: 0.2,
            operation: 0.2,
            service_ready: 0.2,
            job: 1.0,
        },
        ..Default::default()
    }
}

fn done(name: String) -> Operation {
    Operation {
        name,
        status: "DONE".into(),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
pub struct ComputeState {
    pub instances: BTreeMap<String, Instance>,
    pub routes: BTreeSet<String>,
    /// create requests fail for these machines
    pub fail_create: BTreeSet<String>,
    /// these machines never leave STAGING
    pub stuck: BTreeSet<String>,
    /// route inserts are refused
    pub fail_route: bool,
    pub requests: Vec<InstanceRequest>,
    pub deleted: Vec<String>,
}

/// A compute API keeping machines in memory. The list filter is ignored,
/// so callers must do their own name checks.
#[derive(Debug, Default)]
pub struct FakeCompute {
    pub state: Mutex<ComputeState>,
    ops: AtomicUsize,
}

impl FakeCompute {
    fn next_op(&self) -> String {
        format!("operation-{}", self.ops.fetch_add(1, Ordering::SeqCst))
    }

    /// Add a running machine created by someone else.
    pub fn add_running(&self, name: &str) {
        let instance = running_instance(name, "10.0.0.99", None);
        self.state.lock().unwrap().instances.insert(name.into(), instance);
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().instances.keys().cloned().collect()
    }
}

fn running_instance(name: &str, ip: &str, nat: Option<String>) -> Instance {
    Instance {
        name: name.into(),
        status: RUNNING.into(),
        network_interfaces: vec![NetworkInterface {
            network_ip: Some(ip.into()),
            access_configs: nat.map(|nat_ip| AccessConfig { nat_ip: Some(nat_ip) }).into_iter().collect(),
        }],
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Operation, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if state.fail_create.contains(&request.name) {
            return Err(ApiError::new(Some(403), format!("quota exceeded for {}", request.name)));
        }
        let n = state.instances.len() + 2;
        let nat = request.external_ip.then(|| format!("203.0.113.{n}"));
        let mut instance = running_instance(&request.name, &format!("10.0.0.{n}"), nat);
        if state.stuck.contains(&request.name) {
            instance.status = "STAGING".into();
        }
        state.instances.insert(request.name.clone(), instance);
        Ok(done(self.next_op()))
    }

    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ApiError> {
        Ok(self.state.lock().unwrap().instances.get(name).cloned())
    }

    async fn list_instances(&self, _filter: &str) -> Result<Vec<Instance>, ApiError> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }

    async fn delete_instance(&self, name: &str) -> Result<Operation, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.instances.remove(name).is_none() {
            return Err(ApiError::new(Some(404), format!("{name} was not found")));
        }
        state.deleted.push(name.into());
        Ok(done(self.next_op()))
    }

    async fn get_operation(&self, op: &Operation) -> Result<Operation, ApiError> {
        Ok(done(op.name.clone()))
    }

    async fn insert_route(&self, request: &RouteRequest) -> Result<Operation, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_route {
            return Err(ApiError::new(Some(403), format!("route quota exceeded for {}", request.name)));
        }
        state.routes.insert(request.name.clone());
        Ok(done(self.next_op()))
    }

    async fn delete_route(&self, name: &str) -> Result<Operation, ApiError> {
        if !self.state.lock().unwrap().routes.remove(name) {
            return Err(ApiError::new(Some(404), format!("route {name} was not found")));
        }
        Ok(done(self.next_op()))
    }
}
// 0f4b72d3 ends here

// [[file:../../fleet.note::a8e13c56][a8e13c56]]
/// A remote shell answering every command with success, except the node
/// set-up on machines listed in `fail_setup` and commands matching
/// `statuses`.
#[derive(Debug, Default)]
pub struct FakeShell {
    pub fail_setup: BTreeSet<String>,
    /// commands containing a key exit with its status
    pub statuses: BTreeMap<String, i32>,
    /// printed by every command run through `output`
    pub stdout: String,
    pub commands: Mutex<Vec<(String, String)>>,
    pub pushed: Mutex<Vec<(String, String)>>,
}

impl FakeShell {
    pub fn failing_setup(machines: &[&str]) -> Self {
        Self {
            fail_setup: machines.iter().map(|x| x.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn commands_on(&self, machine: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == machine)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn with_status(pattern: &str, status: i32) -> Self {
        Self {
            statuses: [(pattern.to_string(), status)].into_iter().collect(),
            ..Default::default()
        }
    }

    fn status_of(&self, command: &str) -> i32 {
        self.statuses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, status)| *status)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn push(&self, machine: &str, local: &Path, remote: &str) -> Result<(), GatewayError> {
        if !local.exists() {
            return Err(GatewayError::Push {
                machine: machine.into(),
                path: local.display().to_string(),
                reason: "no such file".into(),
            });
        }
        self.pushed.lock().unwrap().push((machine.into(), remote.into()));
        Ok(())
    }

    async fn run(&self, machine: &str, command: &str, _as_user: Option<&str>, _mode: RunMode) -> Result<i32, GatewayError> {
        self.commands.lock().unwrap().push((machine.into(), command.into()));
        if command.ends_with(" setup") && self.fail_setup.contains(machine) {
            return Ok(1);
        }
        Ok(self.status_of(command))
    }

    async fn output(&self, machine: &str, command: &str, _as_user: Option<&str>) -> Result<String, GatewayError> {
        self.commands.lock().unwrap().push((machine.into(), command.into()));
        match self.status_of(command) {
            0 => Ok(self.stdout.clone()),
            code => Err(GatewayError::Run {
                machine: machine.into(),
                command: command.into(),
                reason: format!("exit status {code}: java.net.ConnectException: Connection refused"),
            }),
        }
    }
}
// a8e13c56 ends here

// [[file:../../fleet.note::7d29b0e4][7d29b0e4]]
/// An object store in memory.
#[derive(Debug, Default)]
pub struct FakeStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeStore {
    pub fn insert(&self, uri: &str, data: &str) {
        self.objects.lock().unwrap().insert(uri.into(), data.as_bytes().to_vec());
    }

    pub fn read(&self, uri: &str) -> Option<String> {
        let objects = self.objects.lock().unwrap();
        objects.get(uri).map(|x| String::from_utf8_lossy(x).into_owned())
    }

    /// (path below `dir`, content) of every object below `dir`.
    pub fn tree(&self, dir: &str) -> BTreeMap<String, String> {
        let stem = format!("{}/", dir.trim_end_matches('/'));
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(k, v)| Some((k.strip_prefix(&stem)?.to_string(), String::from_utf8_lossy(v).into_owned())))
            .collect()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list(&self, dir: &ObjectUri) -> Result<Vec<ObjectUri>> {
        let stem = format!("{dir}/");
        let objects = self.objects.lock().unwrap();
        objects
            .keys()
            .filter(|k| k.starts_with(&stem))
            .map(|k| ObjectUri::parse(k))
            .collect()
    }

    async fn upload(&self, src: &Path, dst: &ObjectUri) -> Result<()> {
        let data = std::fs::read(src)?;
        self.put(&data, dst).await
    }

    async fn put(&self, data: &[u8], dst: &ObjectUri) -> Result<()> {
        self.objects.lock().unwrap().insert(dst.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, src: &ObjectUri) -> Result<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(src.as_str())
            .cloned()
            .ok_or_else(|| ClusterError::transfer(src.as_str(), "no such object"))
    }
}

/// A fleet filesystem in memory, concatenating into `store`.
#[derive(Debug)]
pub struct FakeFs {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// listing fails as with an unreachable namenode
    pub fail_list: AtomicBool,
    store: Arc<FakeStore>,
}

impl FakeFs {
    pub fn new(store: Arc<FakeStore>) -> Self {
        Self {
            files: Mutex::default(),
            fail_list: AtomicBool::new(false),
            store,
        }
    }

    pub fn insert(&self, path: &str, data: &str) {
        self.files.lock().unwrap().insert(path.into(), data.as_bytes().to_vec());
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl FleetFs for FakeFs {
    async fn put(&self, data: &[u8], path: &str) -> Result<()> {
        self.files.lock().unwrap().insert(path.into(), data.to_vec());
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ClusterError::transfer(dir, "listing failed: connection refused"));
        }
        let stem = format!("{}/", dir.trim_end_matches('/'));
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|(k, _)| k.starts_with(&stem))
            .map(|(k, v)| FsEntry {
                path: k.clone(),
                is_dir: false,
                size: v.len() as u64,
            })
            .collect())
    }

    async fn concat_to_store(&self, parts: &[String], dst: &ObjectUri) -> Result<()> {
        let mut data = vec![];
        for part in parts {
            let content = self
                .read(part)
                .ok_or_else(|| ClusterError::transfer(part.as_str(), "no such file"))?;
            data.extend(content);
        }
        self.store.put(&data, dst).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let stem = format!("{}/", path.trim_end_matches('/'));
        self.files
            .lock()
            .unwrap()
            .retain(|k, _| k != path && !k.starts_with(&stem));
        Ok(())
    }
}
// 7d29b0e4 ends here

// [[file:../../fleet.note::e61f08ba][e61f08ba]]
/// A job engine executing streaming commands against the in-memory store
/// and filesystem. Copy mappers copy what their manifest says, any other
/// mapper behaves as identity and writes one part file.
#[derive(Debug)]
pub struct FakeEngine {
    fs: Arc<FakeFs>,
    store: Arc<FakeStore>,
    pub submitted: Mutex<Vec<SubmissionCommand>>,
    /// copy mappers silently skip these sources
    pub lost: Mutex<BTreeSet<String>>,
}

fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    let i = argv.iter().position(|x| x == flag)?;
    argv.get(i + 1).map(|x| x.as_str())
}

impl FakeEngine {
    pub fn new(fs: Arc<FakeFs>, store: Arc<FakeStore>) -> Self {
        Self {
            fs,
            store,
            submitted: Mutex::default(),
            lost: Mutex::default(),
        }
    }

    fn manifest(&self, input: &str) -> Result<Manifest> {
        let data = self
            .fs
            .read(input)
            .ok_or_else(|| ClusterError::transfer(input, "manifest not found"))?;
        Manifest::parse(&String::from_utf8_lossy(&data))
    }
}

#[async_trait]
impl JobEngine for FakeEngine {
    async fn submit(&self, command: &SubmissionCommand, _cancel: &CancellationToken) -> Result<()> {
        self.submitted.lock().unwrap().push(command.clone());
        let job_error = |reason: &str| ClusterError::JobSubmission {
            job: command.job_name.clone(),
            reason: reason.into(),
        };
        // programs must have been staged
        for (uri, _) in &command.fetch {
            self.store.get(uri).await.map_err(|_| job_error("program not staged"))?;
        }
        let argv = &command.argv;
        let input = flag_value(argv, "-input").ok_or_else(|| job_error("no input"))?;
        let output = flag_value(argv, "-output").ok_or_else(|| job_error("no output"))?;
        let mapper = flag_value(argv, "-mapper").ok_or_else(|| job_error("no mapper"))?;

        let lost = self.lost.lock().unwrap().clone();
        match mapper {
            STORE_TO_FLEET_MAPPER => {
                for e in self.manifest(input)?.entries().iter().filter(|e| !lost.contains(&e.source)) {
                    let data = self.store.get(&ObjectUri::parse(&e.source)?).await?;
                    self.fs.put(&data, &e.destination).await?;
                }
            }
            FLEET_TO_STORE_MAPPER => {
                for e in self.manifest(input)?.entries().iter().filter(|e| !lost.contains(&e.source)) {
                    let data = self
                        .fs
                        .read(&e.source)
                        .ok_or_else(|| ClusterError::transfer(e.source.as_str(), "no such file"))?;
                    self.store.put(&data, &ObjectUri::parse(&e.destination)?).await?;
                }
            }
            _ => {
                let mut data = vec![];
                for e in self.fs.list(input).await? {
                    data.extend(self.fs.read(&e.path).unwrap_or_default());
                }
                self.fs.put(&data, &format!("{output}/part-00000")).await?;
                self.fs.put(b"", &format!("{output}/_SUCCESS")).await?;
            }
        }
        Ok(())
    }
}
// e61f08ba ends here

// [[file:../../fleet.note::37c4d5f0][37c4d5f0]]
/// Every collaborator of a fleet, in memory.
pub struct Fakes {
    pub api: Arc<FakeCompute>,
    pub shell: Arc<FakeShell>,
    pub store: Arc<FakeStore>,
    pub fs: Arc<FakeFs>,
    pub engine: Arc<FakeEngine>,
}

impl Fakes {
    pub fn new(shell: FakeShell) -> Self {
        let store = Arc::new(FakeStore::default());
        let fs = Arc::new(FakeFs::new(store.clone()));
        let engine = Arc::new(FakeEngine::new(fs.clone(), store.clone()));
        Self {
            api: Arc::new(FakeCompute::default()),
            shell: Arc::new(shell),
            store,
            fs,
            engine,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            api: self.api.clone(),
            shell: self.shell.clone(),
            store: self.store.clone(),
            fs: self.fs.clone(),
            engine: self.engine.clone(),
        }
    }
}
// 37c4d5f0 ends here
