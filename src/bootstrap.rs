// [[file:../fleet.note::3e7a0c95][3e7a0c95]]
//! Turn running machines into cluster nodes.
//!
//! Machines are bootstrapped concurrently. The steps of one machine are
//! strictly sequential, and a failure on one machine never stops the others.
// 3e7a0c95 ends here

// [[file:../fleet.note::9c2f7d10][9c2f7d10]]
use crate::base::{for_each_bounded, random_name, shell_escape, shell_join, Backoff};
use crate::common::*;
use crate::gateway::{GatewayError, RemoteShell, RunMode};
use crate::naming::Role;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
// 9c2f7d10 ends here

// [[file:../fleet.note::f4a8e2b7][f4a8e2b7]]
/// The node bootstrap program shipped with this crate.
pub const NODE_BOOTSTRAP_SCRIPT: &str = include_str!("../scripts/node-bootstrap.sh");
pub const NODE_BOOTSTRAP_NAME: &str = "node-bootstrap.sh";

/// Daemons of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    StorageCoordinator,
    StorageNode,
    JobCoordinator,
    JobExecutor,
}

impl Service {
    /// Daemon name understood by the node bootstrap program.
    pub fn daemon(&self) -> &'static str {
        match self {
            Self::StorageCoordinator => "namenode",
            Self::StorageNode => "datanode",
            Self::JobCoordinator => "jobtracker",
            Self::JobExecutor => "tasktracker",
        }
    }

    /// Services enabled on machines of `role`.
    pub fn enabled_for(role: Role) -> &'static [Service] {
        match role {
            Role::Controller => &[Self::StorageCoordinator, Self::JobCoordinator],
            Role::Worker => &[Self::StorageNode, Self::JobExecutor],
        }
    }
}

/// Everything the node bootstrap program needs to know about its machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapParams {
    pub machine: String,
    pub role: Role,
    pub controller: String,
    /// Names of every worker of the cluster.
    pub workers: Vec<String>,
    pub hadoop_user: String,
    pub hadoop_home: String,
    pub tmp_storage: String,
    pub services: Vec<Service>,
    /// Custom command run after set-up.
    pub command: Option<String>,
}

/// Placeholders recognized in parameter templates, written `{{name}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Machine,
    Role,
    Controller,
    Workers,
    HadoopUser,
    HadoopHome,
    TmpStorage,
    Services,
    Command,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        let p = match name {
            "machine" => Self::Machine,
            "role" => Self::Role,
            "controller" => Self::Controller,
            "workers" => Self::Workers,
            "hadoop_user" => Self::HadoopUser,
            "hadoop_home" => Self::HadoopHome,
            "tmp_storage" => Self::TmpStorage,
            "services" => Self::Services,
            "command" => Self::Command,
            _ => return None,
        };
        Some(p)
    }

    fn value(&self, params: &BootstrapParams) -> String {
        match self {
            Self::Machine => params.machine.clone(),
            Self::Role => params.role.to_string(),
            Self::Controller => params.controller.clone(),
            Self::Workers => params.workers.join(" "),
            Self::HadoopUser => params.hadoop_user.clone(),
            Self::HadoopHome => params.hadoop_home.clone(),
            Self::TmpStorage => params.tmp_storage.clone(),
            Self::Services => params.services.iter().map(|s| s.daemon()).join(" "),
            Self::Command => params.command.clone().unwrap_or_default(),
        }
    }
}

/// The parameter file sourced by the node bootstrap program.
pub const PARAMS_TEMPLATE: &str = "\
MACHINE={{machine}}
ROLE={{role}}
CONTROLLER={{controller}}
WORKERS={{workers}}
HADOOP_USER={{hadoop_user}}
HADOOP_HOME={{hadoop_home}}
TMP_STORAGE={{tmp_storage}}
SERVICES={{services}}
CUSTOM_COMMAND={{command}}
";

/// Substitute every placeholder of `template` with the shell-quoted value
/// from `params`. Unknown or unterminated placeholders are errors.
pub fn render(template: &str, params: &BootstrapParams) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| ClusterError::validation("parameter template", "unterminated placeholder"))?;
        let name = after[..end].trim();
        let placeholder = Placeholder::from_name(name)
            .ok_or_else(|| ClusterError::validation("parameter template", format!("unknown placeholder {name:?}")))?;
        out.push_str(&shell_escape(&placeholder.value(params)));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Content of the cluster hosts file: one `ip name name.localdomain` line
/// per machine.
pub fn render_hosts<'a>(machines: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    machines
        .into_iter()
        .map(|(name, ip)| format!("{ip} {name} {name}.localdomain\n"))
        .collect()
}
// f4a8e2b7 ends here

// [[file:../fleet.note::2a6b9d48][2a6b9d48]]
/// Key pair letting the hadoop user ssh between machines without prompts.
/// Files live in a local temporary directory removed on drop.
#[derive(Debug)]
pub struct TrustMaterial {
    dir: tempfile::TempDir,
    public_key: String,
}

impl TrustMaterial {
    /// Generate a fresh RSA key pair with `ssh-keygen`.
    pub async fn generate(user: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let key = dir.path().join("id_rsa");
        let out = tokio::process::Command::new("ssh-keygen")
            .args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-C", user, "-f"])
            .arg(&key)
            .kill_on_drop(true)
            .output()
            .await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ClusterError::validation("ssh key pair", format!("ssh-keygen failed: {}", stderr.trim())));
        }
        let public_key = tokio::fs::read_to_string(dir.path().join("id_rsa.pub")).await?.trim().to_string();
        Ok(Self { dir, public_key })
    }

    /// Use an existing key pair.
    pub fn from_pair(private_key: &str, public_key: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("id_rsa"), private_key)?;
        std::fs::write(dir.path().join("id_rsa.pub"), public_key)?;
        Ok(Self {
            dir,
            public_key: public_key.trim().to_string(),
        })
    }

    pub fn private_key_file(&self) -> PathBuf {
        self.dir.path().join("id_rsa")
    }

    pub fn public_key_file(&self) -> PathBuf {
        self.dir.path().join("id_rsa.pub")
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

/// Local files pushed to every machine.
#[derive(Debug)]
pub struct BootstrapFiles {
    dir: tempfile::TempDir,
    trust: TrustMaterial,
}

impl BootstrapFiles {
    /// Write the bootstrap program and the hosts file next to `trust`.
    pub fn prepare(trust: TrustMaterial, hosts: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(NODE_BOOTSTRAP_NAME), NODE_BOOTSTRAP_SCRIPT)?;
        std::fs::write(dir.path().join("hosts"), hosts)?;
        Ok(Self { dir, trust })
    }

    fn script(&self) -> PathBuf {
        self.dir.path().join(NODE_BOOTSTRAP_NAME)
    }

    fn hosts(&self) -> PathBuf {
        self.dir.path().join("hosts")
    }

    /// Write the parameter file of `machine`.
    fn write_params(&self, machine: &str, txt: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(format!("{machine}.params"));
        std::fs::write(&path, txt)?;
        Ok(path)
    }
}
// 2a6b9d48 ends here

// [[file:../fleet.note::c16e0f3b][c16e0f3b]]
/// Outcome of bootstrapping a set of machines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub ready: Vec<String>,
    /// machine -> reasons
    pub failed: BTreeMap<String, Vec<String>>,
}

impl BootstrapReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The error naming every failed machine, if any failed.
    pub fn error(&self) -> Option<ClusterError> {
        if self.failed.is_empty() {
            return None;
        }
        let failed = self
            .failed
            .iter()
            .map(|(m, reasons)| (m.clone(), reasons.join(", ")))
            .collect();
        Some(ClusterError::Bootstrap { failed })
    }
}

/// A machine to bootstrap.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub machine: String,
    pub params: BootstrapParams,
}

/// Drives the node bootstrap program on every machine.
#[derive(Clone)]
pub struct Bootstrapper {
    shell: Arc<dyn RemoteShell>,
    /// retry schedule of idempotent pushes
    retry: Backoff,
    retries: usize,
    /// polling schedule of service readiness
    readiness: Backoff,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Bootstrapper {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        retry: Backoff,
        retries: usize,
        readiness: Backoff,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shell,
            retry,
            retries,
            readiness,
            concurrency,
            cancel,
        }
    }

    /// Bootstrap every node of `nodes` with at most `concurrency` machines
    /// in flight.
    pub async fn bootstrap(&self, nodes: Vec<NodePlan>, files: Arc<BootstrapFiles>) -> BootstrapReport {
        let names = nodes.iter().map(|n| n.machine.clone()).collect_vec();
        let results = for_each_bounded(nodes, self.concurrency, |node| {
            let this = self.clone();
            let files = files.clone();
            async move { this.bootstrap_node(&node, &files).await }
        })
        .await;

        let mut report = BootstrapReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.ready.push(name),
                Err(reasons) => {
                    error!("bootstrap of {name} failed: {}", reasons.join(", "));
                    report.failed.insert(name, reasons);
                }
            }
        }
        report
    }

    async fn run(&self, machine: &str, command: &str, mode: RunMode) -> Result<i32> {
        Ok(self.shell.run(machine, command, None, mode).await?)
    }

    /// Run `command` to completion, requiring exit status 0.
    async fn run_ok(&self, machine: &str, what: &str, command: &str) -> Result<()> {
        match self.run(machine, command, RunMode::Wait).await? {
            0 => Ok(()),
            code => Err(GatewayError::Run {
                machine: machine.into(),
                command: what.into(),
                reason: format!("exit status {code}"),
            }
            .into()),
        }
    }

    /// Push `files` into a fresh scratch directory on `machine`. Each call
    /// uses a new directory, so it may be repeated.
    async fn push_files(&self, machine: &str, files: &[(&Path, &str)]) -> Result<String> {
        let scratch = format!("/tmp/gosh-fleet-{}", random_name(8));
        self.run_ok(machine, "scratch directory", &format!("install -d -m 1777 {}", shell_escape(&scratch)))
            .await?;
        for (local, name) in files {
            self.shell.push(machine, local, &format!("{scratch}/{name}")).await?;
        }
        Ok(scratch)
    }

    async fn bootstrap_node(&self, node: &NodePlan, files: &BootstrapFiles) -> std::result::Result<(), Vec<String>> {
        let machine = node.machine.as_str();
        let fail = |step: &str, e: ClusterError| vec![format!("{step}: {e}")];
        info!("bootstrap {machine} as {}", node.params.role);

        // sshd may lag behind the RUNNING status
        self.readiness
            .wait_until(&format!("ssh on {machine}"), &self.cancel, || async {
                Ok(self.run(machine, "true", RunMode::Wait).await.ok().filter(|code| *code == 0))
            })
            .await
            .map_err(|e| fail("ssh", e))?;

        // 1. trust material and 2. program, parameters and hosts
        let txt = render(PARAMS_TEMPLATE, &node.params).map_err(|e| fail("render parameters", e))?;
        let params = files.write_params(machine, &txt).map_err(|e| fail("render parameters", e))?;
        let private_key = files.trust.private_key_file();
        let public_key = files.trust.public_key_file();
        let script = files.script();
        let hosts = files.hosts();
        let payload = [
            (private_key.as_path(), "id_rsa"),
            (public_key.as_path(), "id_rsa.pub"),
            (script.as_path(), NODE_BOOTSTRAP_NAME),
            (params.as_path(), "params"),
            (hosts.as_path(), "hosts"),
        ];
        let scratch = self
            .retry
            .retry(&format!("push bootstrap files to {machine}"), self.retries, &self.cancel, || {
                self.push_files(machine, &payload)
            })
            .await
            .map_err(|e| fail("push", e))?;

        // 3. set-up, then format once on the controller
        let program = format!("{scratch}/{NODE_BOOTSTRAP_NAME}");
        let invoke = |args: &[&str]| format!("bash {}", shell_join(std::iter::once(program.as_str()).chain(args.iter().copied())));
        self.run_ok(machine, "setup", &invoke(&["setup"]))
            .await
            .map_err(|e| fail("setup", e))?;
        if node.params.role == Role::Controller {
            self.run_ok(machine, "format", &invoke(&["format"]))
                .await
                .map_err(|e| fail("format", e))?;
        }

        // 4. start services independently, then wait for each
        let mut reasons = vec![];
        let mut started = vec![];
        for service in &node.params.services {
            let daemon = service.daemon();
            match self.run(machine, &invoke(&["start", daemon]), RunMode::Detach).await {
                Ok(0) => started.push(daemon),
                Ok(code) => reasons.push(format!("start {daemon}: exit status {code}")),
                Err(e) => reasons.push(format!("start {daemon}: {e}")),
            }
        }
        for daemon in started {
            let what = format!("{daemon} on {machine}");
            let check = invoke(&["check", daemon]);
            let ready = self
                .readiness
                .wait_until(&what, &self.cancel, || async {
                    let code = self.run(machine, &check, RunMode::Wait).await?;
                    Ok((code == 0).then_some(()))
                })
                .await;
            match ready {
                Ok(()) => debug!("{what} is ready"),
                Err(e) => reasons.push(format!("{daemon}: {e}")),
            }
        }

        if reasons.is_empty() {
            info!("{machine} is ready");
            Ok(())
        } else {
            Err(reasons)
        }
    }
}
// c16e0f3b ends here

// [[file:../fleet.note::8e5d3a71][8e5d3a71]]
#[cfg(test)]
fn test_params(role: Role) -> BootstrapParams {
    BootstrapParams {
        machine: "ab-hm".into(),
        role,
        controller: "ab-hm".into(),
        workers: vec!["ab-hw-000".into(), "ab-hw-001".into()],
        hadoop_user: "hadoop".into(),
        hadoop_home: "/home/hadoop/hadoop".into(),
        tmp_storage: "gs://b/mapreduce/tmp".into(),
        services: Service::enabled_for(role).to_vec(),
        command: Some("echo 'hi there'".into()),
    }
}

#[test]
fn test_render_params() {
    let txt = render(PARAMS_TEMPLATE, &test_params(Role::Controller)).unwrap();
    assert!(txt.contains("MACHINE=ab-hm\n"));
    assert!(txt.contains("ROLE=controller\n"));
    assert!(txt.contains("WORKERS='ab-hw-000 ab-hw-001'\n"));
    assert!(txt.contains("SERVICES='namenode jobtracker'\n"));
    assert!(txt.contains("CUSTOM_COMMAND='echo '\\''hi there'\\'''\n"));

    let params = BootstrapParams {
        command: None,
        ..test_params(Role::Worker)
    };
    let txt = render(PARAMS_TEMPLATE, &params).unwrap();
    assert!(txt.contains("SERVICES='datanode tasktracker'\n"));
    assert!(txt.contains("CUSTOM_COMMAND=''\n"));
}

#[test]
fn test_render_rejects_bad_templates() {
    let params = test_params(Role::Worker);
    assert_eq!(render("no placeholders", &params).unwrap(), "no placeholders");
    assert_eq!(render("A={{ role }}", &params).unwrap(), "A=worker");
    assert!(render("A={{rol}}", &params).is_err());
    assert!(render("A={{role", &params).is_err());
}

#[test]
fn test_render_hosts() {
    let hosts = render_hosts([("ab-hm", "10.0.0.2"), ("ab-hw-000", "10.0.0.3")]);
    assert_eq!(hosts, "10.0.0.2 ab-hm ab-hm.localdomain\n10.0.0.3 ab-hw-000 ab-hw-000.localdomain\n");
}
// 8e5d3a71 ends here
