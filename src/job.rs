// [[file:../fleet.note::7c1e5d39][7c1e5d39]]
//! Planning and submission of streaming jobs.
//!
//! User jobs and the copy jobs of bulk transfers go through the same
//! `plan_job` path. They differ only in the stage-1 program.
// 7c1e5d39 ends here

// [[file:../fleet.note::e61b0a48][e61b0a48]]
use crate::base::{random_name, shell_escape, shell_join};
use crate::common::*;
use crate::config::HadoopConfig;
use crate::gateway::{RemoteShell, RunMode};
use crate::storage::{ObjectStore, ObjectUri, SCHEME};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
// e61b0a48 ends here

// [[file:../fleet.note::0e7d3f92][0e7d3f92]]
/// In streaming, `cat` works as the identity mapper or reducer.
pub const IDENTITY_PROGRAM: &str = "cat";

const NLINE_INPUT_FORMAT: &str = "org.apache.hadoop.mapred.lib.NLineInputFormat";

/// A mapper or reducer as given by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramRef {
    /// No program: pass records through.
    Identity,
    /// A program on the local machine, staged through the object store.
    Local(PathBuf),
    /// A program already in the object store.
    Remote(ObjectUri),
}

impl ProgramRef {
    /// Interpret an optional program argument. Local programs must exist.
    pub fn parse(program: Option<&str>) -> Result<Self> {
        match program {
            None | Some("") => Ok(Self::Identity),
            Some(s) if s.starts_with(SCHEME) => Ok(Self::Remote(ObjectUri::parse(s)?)),
            Some(s) => {
                let path = Path::new(s);
                if !path.is_file() {
                    return Err(ClusterError::validation(format!("program {s:?}"), "no such file"));
                }
                Ok(Self::Local(path.to_owned()))
            }
        }
    }
}

/// A program resolved for a job: nothing to fetch, or an object fetched
/// onto the controller before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageProgram {
    Identity,
    Staged {
        uri: ObjectUri,
        /// Where the program is fetched to on the controller.
        fleet_path: String,
    },
}

impl StageProgram {
    /// Stage `uri` for job `job_name`.
    pub fn staged(uri: ObjectUri, job_name: &str) -> Self {
        let fleet_path = format!("/tmp/{job_name}/{}", uri.file_name());
        Self::Staged { uri, fleet_path }
    }

    /// Name of the program as the task sees it.
    fn command(&self) -> &str {
        match self {
            Self::Identity => IDENTITY_PROGRAM,
            Self::Staged { uri, .. } => uri.file_name(),
        }
    }
}

/// Resolve `program` for job `job_name`, uploading a local file into
/// `program_dir` of the object store.
pub async fn stage_program(
    store: &dyn ObjectStore,
    program: &ProgramRef,
    program_dir: &ObjectUri,
    job_name: &str,
) -> Result<StageProgram> {
    match program {
        ProgramRef::Identity => Ok(StageProgram::Identity),
        ProgramRef::Remote(uri) => Ok(StageProgram::staged(uri.clone(), job_name)),
        ProgramRef::Local(path) => {
            let file_name = path
                .file_name()
                .and_then(|x| x.to_str())
                .ok_or_else(|| ClusterError::validation(format!("program {}", path.display()), "not a file name"))?;
            let uri = program_dir.join(file_name);
            info!("upload {} to {uri}", path.display());
            store.upload(path, &uri).await?;
            Ok(StageProgram::staged(uri, job_name))
        }
    }
}

/// How the job input is split into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Default text input: splits by size.
    Text,
    /// One input line per task, for manifests of copy jobs.
    LinePerTask,
}

/// A job to run, with input and output in the fleet filesystem.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub stage1: StageProgram,
    pub stage1_width: usize,
    pub stage2: StageProgram,
    /// 0 disables stage 2.
    pub stage2_width: usize,
    pub input: String,
    pub output: String,
    pub input_format: InputFormat,
}

/// Generate a job name unique enough for scratch paths.
pub fn new_job_name(kind: &str) -> String {
    format!("gosh-fleet-{kind}-{}", random_name(6))
}
// 0e7d3f92 ends here

// [[file:../fleet.note::b2a6f3c1][b2a6f3c1]]
/// A fully planned submission: programs to fetch onto the controller, and
/// the engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionCommand {
    pub job_name: String,
    /// (object, path on the controller)
    pub fetch: Vec<(ObjectUri, String)>,
    pub argv: Vec<String>,
}

impl SubmissionCommand {
    /// One shell line: fetch prelude followed by the engine invocation.
    pub fn render(&self, gsutil: &str) -> String {
        let mut steps = vec![];
        if !self.fetch.is_empty() {
            steps.push(format!("mkdir -p {}", shell_escape(&format!("/tmp/{}", self.job_name))));
        }
        for (uri, path) in &self.fetch {
            steps.push(shell_join([gsutil, "cp", uri.as_str(), path.as_str()]));
            steps.push(shell_join(["chmod", "+x", path.as_str()]));
        }
        steps.push(shell_join(&self.argv));
        steps.join(" && ")
    }
}

fn validate_fleet_path(what: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ClusterError::validation(
            format!("{what} {path:?}"),
            "must be an absolute path in the fleet filesystem",
        ));
    }
    Ok(())
}

/// Assemble the streaming job command for `spec`.
pub fn plan_job(spec: &JobSpec, hadoop: &HadoopConfig) -> Result<SubmissionCommand> {
    if spec.name.is_empty() || !spec.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ClusterError::validation(format!("job name {:?}", spec.name), "use letters, digits, - and _"));
    }
    if spec.stage1_width == 0 {
        return Err(ClusterError::validation("mapper count", "must be at least 1"));
    }
    validate_fleet_path("job input", &spec.input)?;
    validate_fleet_path("job output", &spec.output)?;

    let with_stage2 = spec.stage2_width > 0;
    let mut fetch = vec![];
    for program in std::iter::once(&spec.stage1).chain(with_stage2.then_some(&spec.stage2)) {
        if let StageProgram::Staged { uri, fleet_path } = program {
            // programs are shipped into the task directory by base name
            match fetch.iter().find(|(_, p): &&(ObjectUri, String)| p == fleet_path) {
                Some((other, _)) if other != uri => {
                    return Err(ClusterError::validation(
                        format!("programs {other} and {uri}"),
                        "mapper and reducer need distinct file names",
                    ))
                }
                Some(_) => {}
                None => fetch.push((uri.clone(), fleet_path.clone())),
            }
        }
    }

    let mut argv: Vec<String> = vec![hadoop.hadoop_bin(), "jar".into(), hadoop.streaming_jar.clone()];
    let mut define = |key: &str, value: String| {
        argv.push("-D".into());
        argv.push(format!("{key}={value}"));
    };
    define("mapred.job.name", spec.name.clone());
    define("mapred.map.tasks", spec.stage1_width.to_string());
    define("mapred.reduce.tasks", spec.stage2_width.to_string());
    if spec.input_format == InputFormat::LinePerTask {
        define("mapred.line.input.format.linespermap", "1".into());
        argv.push("-inputformat".into());
        argv.push(NLINE_INPUT_FORMAT.into());
    }
    argv.extend(["-input", spec.input.as_str(), "-output", spec.output.as_str()].map(String::from));

    let mut program_args = |flag: &str, program: &StageProgram| {
        argv.push(flag.into());
        argv.push(program.command().into());
        if let StageProgram::Staged { fleet_path, .. } = program {
            argv.push("-file".into());
            argv.push(fleet_path.clone());
        }
    };
    program_args("-mapper", &spec.stage1);
    if with_stage2 {
        program_args("-reducer", &spec.stage2);
    }

    Ok(SubmissionCommand {
        job_name: spec.name.clone(),
        fetch,
        argv,
    })
}
// b2a6f3c1 ends here

// [[file:../fleet.note::5d8e2b07][5d8e2b07]]
/// A job as requested by the user: programs and object store locations.
#[derive(Debug, Clone)]
pub struct UserJob {
    pub mapper: ProgramRef,
    pub mapper_count: usize,
    pub reducer: ProgramRef,
    /// 0 skips the reducer.
    pub reducer_count: usize,
    pub input: ObjectUri,
    pub output: ObjectUri,
}

impl UserJob {
    /// Validate user arguments before any remote call. Trailing `/` of
    /// input and output are removed.
    pub fn new(
        mapper: Option<&str>,
        mapper_count: usize,
        reducer: Option<&str>,
        reducer_count: usize,
        input: &str,
        output: &str,
    ) -> Result<Self> {
        if mapper_count == 0 {
            return Err(ClusterError::validation("mapper count", "must be at least 1"));
        }
        let location = |what: &str, s: &str| {
            if !s.starts_with(SCHEME) {
                return Err(ClusterError::validation(format!("{what} {s:?}"), format!("must begin with {SCHEME}")));
            }
            ObjectUri::parse(s)
        };
        Ok(Self {
            mapper: ProgramRef::parse(mapper)?,
            mapper_count,
            reducer: ProgramRef::parse(reducer)?,
            reducer_count,
            input: location("input", input)?,
            output: location("output", output)?,
        })
    }
}
// 5d8e2b07 ends here

// [[file:../fleet.note::a3f09c6e][a3f09c6e]]
/// The job-execution engine of the fleet.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Run `command` to completion.
    async fn submit(&self, command: &SubmissionCommand, cancel: &CancellationToken) -> Result<()>;
}

/// Hadoop streaming, submitted on the controller as the hadoop user.
#[derive(Clone)]
pub struct HadoopStreaming {
    shell: Arc<dyn RemoteShell>,
    controller: String,
    hadoop: HadoopConfig,
    timeout: Duration,
}

impl HadoopStreaming {
    pub fn new(shell: Arc<dyn RemoteShell>, controller: impl Into<String>, hadoop: HadoopConfig, timeout: Duration) -> Self {
        Self {
            shell,
            controller: controller.into(),
            hadoop,
            timeout,
        }
    }
}

#[async_trait]
impl JobEngine for HadoopStreaming {
    async fn submit(&self, command: &SubmissionCommand, cancel: &CancellationToken) -> Result<()> {
        let job = &command.job_name;
        let line = command.render(&self.hadoop.gsutil);
        info!("submit job {job} on {}", self.controller);
        debug!("job command: {line}");

        let start = Instant::now();
        let run = self.shell.run(&self.controller, &line, Some(&self.hadoop.user), RunMode::Wait);
        let code = tokio::select! {
            _ = cancel.cancelled() => return Err(ClusterError::Cancelled(format!("running job {job}"))),
            r = tokio::time::timeout(self.timeout, run) => match r {
                Ok(code) => code?,
                Err(_) => return Err(ClusterError::Timeout { what: format!("job {job}"), elapsed: start.elapsed() }),
            },
        };
        if code != 0 {
            return Err(ClusterError::JobSubmission {
                job: job.clone(),
                reason: format!("exit status {code}"),
            });
        }
        info!("job {job} done in {:.1?}", start.elapsed());
        Ok(())
    }
}
// a3f09c6e ends here

// [[file:../fleet.note::c95e7a14][c95e7a14]]
#[cfg(test)]
fn test_spec(stage1: StageProgram) -> JobSpec {
    JobSpec {
        name: "job-1".into(),
        stage1,
        stage1_width: 4,
        stage2: StageProgram::Identity,
        stage2_width: 0,
        input: "/mapreduce/job-1/manifest".into(),
        output: "/mapreduce/job-1/out".into(),
        input_format: InputFormat::LinePerTask,
    }
}

#[test]
fn test_plan_job_reducer() {
    let hadoop = HadoopConfig::default();
    let uri = ObjectUri::parse("gs://b/mapreduce/mapper-reducer/count.py").unwrap();
    let spec = JobSpec {
        stage2: StageProgram::staged(uri, "job-1"),
        stage2_width: 2,
        input_format: InputFormat::Text,
        ..test_spec(StageProgram::Identity)
    };
    let cmd = plan_job(&spec, &hadoop).unwrap();
    let line = cmd.argv.join(" ");
    assert!(line.starts_with("/home/hadoop/hadoop/bin/hadoop jar "));
    assert!(line.contains("-D mapred.job.name=job-1 -D mapred.map.tasks=4 -D mapred.reduce.tasks=2"));
    assert!(line.contains("-mapper cat -reducer count.py -file /tmp/job-1/count.py"));
    assert!(!line.contains("-inputformat"));

    let rendered = cmd.render("gsutil");
    assert!(rendered.starts_with(
        "mkdir -p /tmp/job-1 && gsutil cp gs://b/mapreduce/mapper-reducer/count.py /tmp/job-1/count.py && chmod +x /tmp/job-1/count.py && "
    ));

    // no reduce phase
    let spec = JobSpec { stage2_width: 0, ..spec };
    let cmd = plan_job(&spec, &hadoop).unwrap();
    assert!(cmd.fetch.is_empty());
    let line = cmd.argv.join(" ");
    assert!(line.contains("mapred.reduce.tasks=0"));
    assert!(!line.contains("-reducer"));
}

#[test]
fn test_plan_job_invalid() {
    let hadoop = HadoopConfig::default();
    let spec = JobSpec {
        stage1_width: 0,
        ..test_spec(StageProgram::Identity)
    };
    assert!(plan_job(&spec, &hadoop).is_err());

    let spec = JobSpec {
        input: "gs://b/in".into(),
        ..test_spec(StageProgram::Identity)
    };
    assert!(plan_job(&spec, &hadoop).is_err());

    let a = ObjectUri::parse("gs://b/a/run.sh").unwrap();
    let b = ObjectUri::parse("gs://b/b/run.sh").unwrap();
    let spec = JobSpec {
        stage2: StageProgram::staged(b, "job-1"),
        stage2_width: 1,
        ..test_spec(StageProgram::staged(a, "job-1"))
    };
    assert!(plan_job(&spec, &hadoop).is_err());
}

#[test]
fn test_user_job() {
    let job = UserJob::new(None, 5, Some("gs://b/r.py"), 1, "gs://b/in/", "gs://b/out/").unwrap();
    assert_eq!(job.mapper, ProgramRef::Identity);
    assert!(matches!(job.reducer, ProgramRef::Remote(_)));
    assert_eq!(job.input.as_str(), "gs://b/in");
    assert_eq!(job.output.as_str(), "gs://b/out");

    assert!(UserJob::new(None, 5, None, 1, "/local/in", "gs://b/out").is_err());
    assert!(UserJob::new(None, 5, None, 1, "gs://b/in", "out").is_err());
    assert!(UserJob::new(None, 0, None, 1, "gs://b/in", "gs://b/out").is_err());
    assert!(UserJob::new(Some("/no/such/mapper.py"), 5, None, 1, "gs://b/in", "gs://b/out").is_err());
}
// c95e7a14 ends here
