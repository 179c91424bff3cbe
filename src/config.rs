// [[file:../fleet.note::0a43c9d7][0a43c9d7]]
//! Configuration of a fleet, passed explicitly to every operation.
// 0a43c9d7 ends here

// [[file:../fleet.note::5e8a1c20][5e8a1c20]]
use crate::common::*;
use crate::storage::ObjectUri;

use std::path::Path;
use std::time::Duration;
// 5e8a1c20 ends here

// [[file:../fleet.note::c71d4b8e][c71d4b8e]]
/// Which machines get an external address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExternalIp {
    /// Every machine is reachable from outside.
    #[default]
    All,
    /// Only the controller; workers reach the internet through it.
    Controller,
}

/// What to do when some machines did not start or did not bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShortfallPolicy {
    /// Roll back a partially provisioned fleet and refuse to submit jobs
    /// unless every machine is ready.
    #[default]
    Abort,
    /// Continue with the machines that are ready, as long as the controller
    /// and at least one worker are.
    Proceed,
}

/// Bounds of the polling loops, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub poll_interval: f64,
    pub max_poll_interval: f64,
    pub instance_start: f64,
    pub operation: f64,
    pub service_ready: f64,
    pub job: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: 5.0,
            max_poll_interval: 30.0,
            // no situation change for 10 minutes
            instance_start: 600.0,
            operation: 300.0,
            service_ready: 300.0,
            job: 24.0 * 3600.0,
        }
    }
}

fn try_secs(what: &str, x: f64) -> Result<Duration> {
    if x.is_nan() || x < 0.0 {
        return Err(ClusterError::validation(format!("timeout {what}"), format!("{x} is not a number of seconds")));
    }
    Duration::try_from_secs_f64(x).map_err(|e| ClusterError::validation(format!("timeout {what}"), e.to_string()))
}

// validated in FleetConfig::validate
fn secs(x: f64) -> Duration {
    Duration::try_from_secs_f64(x.max(0.0)).unwrap_or(Duration::MAX)
}

impl Timeouts {
    /// Every bound must be a finite, non-negative number of seconds.
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("poll_interval", self.poll_interval),
            ("max_poll_interval", self.max_poll_interval),
            ("instance_start", self.instance_start),
            ("operation", self.operation),
            ("service_ready", self.service_ready),
            ("job", self.job),
        ];
        for (what, x) in bounds {
            try_secs(what, x)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval)
    }

    pub fn max_poll_interval(&self) -> Duration {
        secs(self.max_poll_interval)
    }

    pub fn instance_start(&self) -> Duration {
        secs(self.instance_start)
    }

    pub fn operation(&self) -> Duration {
        secs(self.operation)
    }

    pub fn service_ready(&self) -> Duration {
        secs(self.service_ready)
    }

    pub fn job(&self) -> Duration {
        secs(self.job)
    }
}

/// Locations of Hadoop on the machines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HadoopConfig {
    /// The user owning Hadoop daemons and running jobs.
    pub user: String,
    /// Hadoop installation directory on every machine.
    pub home: String,
    /// Path to the streaming jar on the controller.
    pub streaming_jar: String,
    /// Object store client used on the machines.
    pub gsutil: String,
    /// Directory in the fleet filesystem for manifests and scratch output.
    pub scratch_dir: String,
}

impl Default for HadoopConfig {
    fn default() -> Self {
        Self {
            user: "hadoop".into(),
            home: "/home/hadoop/hadoop".into(),
            streaming_jar: "/home/hadoop/hadoop/contrib/streaming/hadoop-streaming-1.2.1.jar".into(),
            gsutil: "gsutil".into(),
            scratch_dir: "/mapreduce/scratch".into(),
        }
    }
}

impl HadoopConfig {
    /// The `hadoop` command on the machines.
    pub fn hadoop_bin(&self) -> String {
        format!("{}/bin/hadoop", self.home)
    }
}
// c71d4b8e ends here

// [[file:../fleet.note::8d0f36a5][8d0f36a5]]
/// Everything an invocation needs to know about a fleet.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub project: String,
    pub zone: String,
    /// Cloud Storage bucket for temporary files.
    pub bucket: String,
    pub prefix: String,
    pub image: String,
    pub machine_type: String,
    pub external_ip: ExternalIp,
    /// Additional command to run on each machine after set-up.
    pub command: Option<String>,
    pub on_shortfall: ShortfallPolicy,
    /// Upper bound of concurrent remote operations from this process.
    pub concurrency: usize,
    /// Attempts for idempotent remote steps.
    pub retries: usize,
    pub timeouts: Timeouts,
    pub hadoop: HadoopConfig,
    /// Base URL of the Compute Engine REST API.
    pub api_endpoint: String,
    /// OAuth2 access token. Obtained from `gcloud auth print-access-token`
    /// when absent.
    pub access_token: Option<String>,
    pub gcloud: String,
    pub gsutil: String,
    /// Service account scopes granted to the machines.
    pub scopes: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: "us-central1-a".into(),
            bucket: String::new(),
            prefix: String::new(),
            image: "projects/debian-cloud/global/images/family/debian-11".into(),
            machine_type: "n1-highcpu-4".into(),
            external_ip: ExternalIp::default(),
            command: None,
            on_shortfall: ShortfallPolicy::default(),
            concurrency: 8,
            retries: 3,
            timeouts: Timeouts::default(),
            hadoop: HadoopConfig::default(),
            api_endpoint: "https://compute.googleapis.com/compute/v1".into(),
            access_token: None,
            gcloud: "gcloud".into(),
            gsutil: "gsutil".into(),
            scopes: vec!["https://www.googleapis.com/auth/devstorage.full_control".into()],
        }
    }
}

impl FleetConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        serde_json::from_str(&txt)
            .map_err(|e| ClusterError::validation(format!("config file {}", path.display()), e.to_string()))
    }

    /// Check the fields every operation depends on.
    pub fn validate(&self) -> Result<()> {
        crate::naming::validate_prefix(&self.prefix)?;
        if self.project.is_empty() {
            return Err(ClusterError::validation("project", "must not be empty"));
        }
        if self.zone.is_empty() {
            return Err(ClusterError::validation("zone", "must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(ClusterError::validation("concurrency", "must be at least 1"));
        }
        self.timeouts.validate()
    }

    fn bucket_uri(&self) -> Result<ObjectUri> {
        if self.bucket.is_empty() {
            return Err(ClusterError::validation("bucket", "a Cloud Storage bucket is required"));
        }
        ObjectUri::parse(&format!("gs://{}", self.bucket))
    }

    /// `gs://<bucket>/mapreduce`
    pub fn mapreduce_dir(&self) -> Result<ObjectUri> {
        Ok(self.bucket_uri()?.join("mapreduce"))
    }

    /// Temporary storage shared with the machines: `gs://<bucket>/mapreduce/tmp`
    pub fn tmp_storage(&self) -> Result<ObjectUri> {
        Ok(self.mapreduce_dir()?.join("tmp"))
    }

    /// Where local mapper and reducer programs are staged.
    pub fn program_dir(&self) -> Result<ObjectUri> {
        Ok(self.mapreduce_dir()?.join("mapper-reducer"))
    }

    /// The schedule used by polling loops.
    pub fn backoff(&self, timeout: Duration) -> crate::base::Backoff {
        crate::base::Backoff::new(self.timeouts.poll_interval(), timeout)
            .with_growth(1.5, self.timeouts.max_poll_interval())
    }
}
// 8d0f36a5 ends here

// [[file:../fleet.note::a9c3e15f][a9c3e15f]]
#[test]
fn test_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.json");
    std::fs::write(
        &path,
        r#"{"project": "project-hoge", "bucket": "bucket-fuga", "external_ip": "controller",
            "timeouts": {"job": 60}, "hadoop": {"user": "mapred"}}"#,
    )
    .unwrap();
    let config = FleetConfig::from_file(&path).unwrap();
    assert_eq!(config.project, "project-hoge");
    assert_eq!(config.external_ip, ExternalIp::Controller);
    assert_eq!(config.timeouts.job(), Duration::from_secs(60));
    assert_eq!(config.timeouts.instance_start(), Duration::from_secs(600));
    assert_eq!(config.hadoop.user, "mapred");
    assert_eq!(config.hadoop.home, "/home/hadoop/hadoop");
    assert_eq!(config.tmp_storage().unwrap().as_str(), "gs://bucket-fuga/mapreduce/tmp");
    assert!(config.validate().is_ok());

    std::fs::write(&path, r#"{"projet": "typo"}"#).unwrap();
    assert!(FleetConfig::from_file(&path).is_err());
}

#[test]
fn test_config_validate() {
    let mut config = FleetConfig {
        project: "p".into(),
        ..Default::default()
    };
    assert!(config.validate().is_ok());
    assert!(config.tmp_storage().is_err());
    config.prefix = "Bad".into();
    assert!(config.validate().is_err());

    config.prefix = "ab".into();
    config.timeouts.job = f64::INFINITY;
    let e = config.validate().unwrap_err();
    assert!(e.to_string().contains("timeout job"), "{e}");
    // never panics, even unchecked
    assert_eq!(config.timeouts.job(), Duration::MAX);
    config.timeouts.job = 1e300;
    assert!(config.validate().is_err());
    config.timeouts.job = -1.0;
    assert!(config.validate().is_err());
    config.timeouts.job = 60.0;
    assert!(config.validate().is_ok());
}
// a9c3e15f ends here
