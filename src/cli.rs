// [[file:../fleet.note::3a532d42][3a532d42]]
use crate::common::*;
use crate::config::{ExternalIp, FleetConfig, ShortfallPolicy};
use crate::fleet::Fleet;
use crate::job::UserJob;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio_util::sync::CancellationToken;
// 3a532d42 ends here

// [[file:../fleet.note::bdfa3d68][bdfa3d68]]
/// Where the cluster lives and how its machines look. Flags override the
/// configuration file.
#[derive(Args, Debug)]
struct FleetArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cloud project
    #[arg(long, global = true)]
    project: Option<String>,

    /// Cloud Storage bucket for temporary files
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Name prefix of the cluster machines
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[arg(long, global = true)]
    zone: Option<String>,

    /// Machine image
    #[arg(long, global = true)]
    image: Option<String>,

    #[arg(long, global = true)]
    machine_type: Option<String>,

    /// Machines with an external address
    #[arg(long, value_enum, global = true)]
    external_ip: Option<ExternalIp>,

    /// Additional command run on each machine after set-up
    #[arg(long = "command", global = true)]
    custom_command: Option<String>,

    /// What to do when some machines fail to start or bootstrap
    #[arg(long, value_enum, global = true)]
    on_shortfall: Option<ShortfallPolicy>,
}

impl FleetArgs {
    fn load(self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_file(path).with_context(|| format!("read config from {path:?}"))?,
            None => FleetConfig::default(),
        };
        if let Some(v) = self.project {
            config.project = v;
        }
        if let Some(v) = self.bucket {
            config.bucket = v;
        }
        if let Some(v) = self.prefix {
            config.prefix = v;
        }
        if let Some(v) = self.zone {
            config.zone = v;
        }
        if let Some(v) = self.image {
            config.image = v;
        }
        if let Some(v) = self.machine_type {
            config.machine_type = v;
        }
        if let Some(v) = self.external_ip {
            config.external_ip = v;
        }
        if let Some(v) = self.on_shortfall {
            config.on_shortfall = v;
        }
        if self.custom_command.is_some() {
            config.command = self.custom_command;
        }
        config.validate().context("invalid fleet configuration")?;
        Ok(config)
    }
}
// bdfa3d68 ends here

// [[file:../fleet.note::512e88e7][512e88e7]]
/// A job to run on the cluster.
#[derive(Args, Debug)]
struct JobArgs {
    /// Mapper program: local file or gs:// object. Identity when omitted.
    #[arg(long)]
    mapper: Option<String>,

    /// Reducer program: local file or gs:// object. Identity when omitted.
    #[arg(long)]
    reducer: Option<String>,

    /// Number of map tasks
    #[arg(long, default_value_t = 5)]
    mapper_count: usize,

    /// Number of reduce tasks, 0 skips the reducer
    #[arg(long, default_value_t = 1)]
    reducer_count: usize,

    /// Input directory, gs://bucket/path
    #[arg(long)]
    input: String,

    /// Output directory, gs://bucket/path
    #[arg(long)]
    output: String,
}

impl JobArgs {
    fn user_job(&self) -> anyhow::Result<UserJob> {
        let job = UserJob::new(
            self.mapper.as_deref(),
            self.mapper_count,
            self.reducer.as_deref(),
            self.reducer_count,
            &self.input,
            &self.output,
        )?;
        Ok(job)
    }
}

#[derive(Subcommand, Debug)]
enum FleetCommand {
    /// Prepare the project and bucket. Run once.
    Setup,
    /// Start a cluster.
    Start {
        /// Number of workers
        #[arg(default_value_t = 5)]
        num_workers: usize,
    },
    /// Delete every machine of the cluster.
    Shutdown,
    /// Run a job on the running cluster.
    Mapreduce(JobArgs),
    /// Start a cluster and run a job on it.
    Run {
        /// Number of workers
        #[arg(long, default_value_t = 5)]
        num_workers: usize,

        /// Delete the cluster afterwards, whatever the job outcome
        #[arg(long)]
        shutdown: bool,

        #[command(flatten)]
        job: JobArgs,
    },
}
// 512e88e7 ends here

// [[file:../fleet.note::5f9971ad][5f9971ad]]
/// Ephemeral Hadoop clusters on Compute Engine
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(flatten)]
    fleet: FleetArgs,

    #[command(subcommand)]
    command: FleetCommand,
}

fn setup_logger(verbose: &Verbosity<InfoLevel>) {
    let level = verbose.log_level_filter();
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_secs()
        .try_init();
}

pub async fn fleet_enter_main() -> anyhow::Result<()> {
    let args = Cli::parse();
    setup_logger(&args.verbose);

    let config = args.fleet.load()?;
    let cancel = CancellationToken::new();
    crate::signal::cancel_on_signal(cancel.clone());
    let fleet = Fleet::connect(config, cancel.clone())
        .await
        .context("connect to the cloud project")?;

    let result = match args.command {
        FleetCommand::Setup => fleet.setup().await.context("set up environment"),
        FleetCommand::Start { num_workers } => fleet
            .start(num_workers)
            .await
            .map(|cluster| info!("cluster is up: {}", cluster.names().join(" ")))
            .context("start cluster"),
        FleetCommand::Shutdown => fleet
            .shutdown()
            .await
            .map(|report| info!("deleted {} machines", report.deleted.len()))
            .context("shut down cluster"),
        FleetCommand::Mapreduce(job) => {
            let job = job.user_job()?;
            fleet.mapreduce(&job).await.map(|_| ()).context("run job")
        }
        FleetCommand::Run { num_workers, shutdown, job } => {
            let job = job.user_job()?;
            fleet.run(num_workers, &job, shutdown).await.map(|_| ()).context("run job on new cluster")
        }
    };
    if cancel.is_cancelled() {
        return result.context("interrupted by signal");
    }
    // stop the signal listener
    cancel.cancel();
    result
}
// 5f9971ad ends here

// [[file:../fleet.note::0c88e1a4][0c88e1a4]]
#[test]
fn test_cli_overrides_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.json");
    std::fs::write(&path, r#"{"project": "p", "bucket": "b", "prefix": "ab", "zone": "z1"}"#).unwrap();

    let args = Cli::try_parse_from([
        "gosh-fleet",
        "--config",
        path.to_str().unwrap(),
        "--zone",
        "z2",
        "--external-ip",
        "controller",
        "start",
        "3",
    ])
    .unwrap();
    assert!(matches!(args.command, FleetCommand::Start { num_workers: 3 }));
    let config = args.fleet.load().unwrap();
    assert_eq!(config.prefix, "ab");
    assert_eq!(config.zone, "z2");
    assert_eq!(config.external_ip, ExternalIp::Controller);

    let args = Cli::try_parse_from([
        "gosh-fleet",
        "--project",
        "p",
        "mapreduce",
        "--input",
        "gs://b/in/",
        "--output",
        "gs://b/out",
        "--reducer-count",
        "0",
    ])
    .unwrap();
    let FleetCommand::Mapreduce(job) = args.command else {
        panic!("not a mapreduce command");
    };
    let job = job.user_job().unwrap();
    assert_eq!(job.mapper_count, 5);
    assert_eq!(job.reducer_count, 0);
    assert_eq!(job.input.as_str(), "gs://b/in");

    // bad prefix is rejected before any remote call
    let args = Cli::try_parse_from(["gosh-fleet", "--project", "p", "--prefix", "Bad", "shutdown"]).unwrap();
    assert!(args.fleet.load().is_err());
}
// 0c88e1a4 ends here
