// [[file:../fleet.note::8f2d61ac][8f2d61ac]]
//! Bulk copies between the object store and the fleet filesystem, run as
//! jobs on the fleet itself.
//!
//! A copy is a job whose mapper copies one manifest line per task and which
//! has no reduce phase. Results are verified after the job, so a failed
//! copy names the objects that are missing.
// 8f2d61ac ends here

// [[file:../fleet.note::17a4c9e3][17a4c9e3]]
use crate::common::*;
use crate::config::HadoopConfig;
use crate::fleetfs::{FleetFs, FsEntry};
use crate::job::{new_job_name, plan_job, InputFormat, JobEngine, JobSpec, StageProgram};
use crate::storage::{ObjectStore, ObjectUri};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
// 17a4c9e3 ends here

// [[file:../fleet.note::e4b7d052][e4b7d052]]
/// Mapper copying object store objects into the fleet filesystem.
pub const STORE_TO_FLEET_MAPPER: &str = "gcs-to-hdfs-mapper.sh";
/// Mapper copying fleet files into the object store.
pub const FLEET_TO_STORE_MAPPER: &str = "hdfs-to-gcs-mapper.sh";

/// (name, content) of the copy mappers shipped with this crate.
pub const COPY_MAPPERS: [(&str, &str); 2] = [
    (STORE_TO_FLEET_MAPPER, include_str!("../scripts/gcs-to-hdfs-mapper.sh")),
    (FLEET_TO_STORE_MAPPER, include_str!("../scripts/hdfs-to-gcs-mapper.sh")),
];

/// Marker file written by the job engine into a finished job's output.
pub const SUCCESS_MARKER: &str = "_SUCCESS";
/// Name of the object combining the parts of a job result directory.
pub const RESULTS_NAME: &str = "results";

/// One (source, destination) pair of a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source: String,
    pub destination: String,
}

/// The input of a copy job: one `source<TAB>destination` line per copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

fn check_manifest_path(path: &str) -> Result<()> {
    if path.contains(|c: char| c == '\t' || c == '\n' || c == '\r') {
        return Err(ClusterError::validation(
            format!("path {path:?}"),
            "tab or newline cannot be copied",
        ));
    }
    Ok(())
}

impl Manifest {
    pub fn push(&mut self, source: impl Into<String>, destination: impl Into<String>) -> Result<()> {
        let source = source.into();
        let destination = destination.into();
        check_manifest_path(&source)?;
        check_manifest_path(&destination)?;
        self.entries.push(ManifestEntry { source, destination });
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}\t{}\n", e.source, e.destination))
            .collect()
    }

    /// Parse rendered manifest `txt`.
    pub fn parse(txt: &str) -> Result<Self> {
        let mut manifest = Self::default();
        for line in txt.lines().filter(|line| !line.is_empty()) {
            let (source, destination) = line
                .split_once('\t')
                .ok_or_else(|| ClusterError::validation(format!("manifest line {line:?}"), "no tab separator"))?;
            manifest.push(source, destination)?;
        }
        Ok(manifest)
    }
}

/// Index of a result part file as decimal digits without leading zeros:
/// `part-00009` is `9`. Indices of any length are accepted.
pub fn part_index(name: &str) -> Option<&str> {
    let digits = name.strip_prefix("part-")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match digits.trim_start_matches('0') {
        "" => Some("0"),
        significant => Some(significant),
    }
}

/// Sort part file paths in numeric part order.
pub fn sort_parts(parts: &mut [String]) {
    // fewer digits is a smaller index
    parts.sort_by_cached_key(|p| {
        let index = part_index(file_name(p)).map(|d| (d.len(), d.to_string()));
        (index.is_none(), index, p.clone())
    });
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or_default()
}

/// Files to copy out of `dir`: result part files grouped by job result
/// directory, and every other file. A directory holds job results only if
/// it contains the success marker.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OutgoingFiles {
    /// result directory -> part files in numeric order
    pub results: BTreeMap<String, Vec<String>>,
    pub files: Vec<String>,
}

pub fn classify_outgoing(entries: &[FsEntry]) -> OutgoingFiles {
    let result_dirs: BTreeSet<&str> = entries
        .iter()
        .filter(|e| !e.is_dir && file_name(&e.path) == SUCCESS_MARKER)
        .map(|e| parent_dir(&e.path))
        .collect();
    // job history written next to results
    let in_job_logs = |path: &str| result_dirs.iter().any(|d| path.starts_with(&format!("{d}/_logs/")));

    let mut outgoing = OutgoingFiles::default();
    for e in entries.iter().filter(|e| !e.is_dir) {
        let dir = parent_dir(&e.path);
        let name = file_name(&e.path);
        if result_dirs.contains(dir) {
            if name == SUCCESS_MARKER {
                continue;
            }
            if part_index(name).is_some() {
                outgoing.results.entry(dir.to_string()).or_default().push(e.path.clone());
                continue;
            }
        }
        if in_job_logs(&e.path) {
            continue;
        }
        outgoing.files.push(e.path.clone());
    }
    for parts in outgoing.results.values_mut() {
        sort_parts(parts);
    }
    outgoing
}
// e4b7d052 ends here

// [[file:../fleet.note::6a9e3f17][6a9e3f17]]
/// Outcome of one bulk transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Number of files copied individually.
    pub copied: usize,
    /// Objects combined from result part files.
    pub combined: Vec<ObjectUri>,
}

/// Runs bulk copies through the job engine of the fleet.
#[derive(Clone)]
pub struct Transfer {
    store: Arc<dyn ObjectStore>,
    fs: Arc<dyn FleetFs>,
    engine: Arc<dyn JobEngine>,
    hadoop: HadoopConfig,
    /// Where the copy mappers are kept in the object store.
    program_dir: ObjectUri,
    cancel: CancellationToken,
}

impl Transfer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fs: Arc<dyn FleetFs>,
        engine: Arc<dyn JobEngine>,
        hadoop: HadoopConfig,
        program_dir: ObjectUri,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            fs,
            engine,
            hadoop,
            program_dir,
            cancel,
        }
    }

    /// Run the copy job of `manifest` with `mapper`, then clean up its
    /// scratch directory.
    async fn run_copy_job(&self, kind: &str, mapper: &str, manifest: &Manifest, width: usize) -> Result<()> {
        if manifest.is_empty() {
            debug!("nothing to copy for {kind}");
            return Ok(());
        }
        let job_name = new_job_name(kind);
        let scratch = format!("{}/{job_name}", self.hadoop.scratch_dir.trim_end_matches('/'));
        let manifest_path = format!("{scratch}/manifest");
        info!("copy {} files with job {job_name}", manifest.len());

        let copied = async {
            self.fs.put(manifest.render().as_bytes(), &manifest_path).await?;
            let spec = JobSpec {
                name: job_name.clone(),
                stage1: StageProgram::staged(self.program_dir.join(mapper), &job_name),
                stage1_width: width.max(1),
                stage2: StageProgram::Identity,
                stage2_width: 0,
                input: manifest_path.clone(),
                output: format!("{scratch}/out"),
                input_format: InputFormat::LinePerTask,
            };
            let command = plan_job(&spec, &self.hadoop)?;
            self.engine.submit(&command, &self.cancel).await
        }
        .await;

        if let Err(e) = self.fs.remove(&scratch).await {
            warn!("failed to remove scratch directory {scratch}: {e}");
        }
        copied
    }

    /// Copy every object below `src` into `fleet_dir`, keeping relative
    /// paths. `width` is the number of copy tasks.
    pub async fn copy_into_fleet(&self, src: &ObjectUri, fleet_dir: &str, width: usize) -> Result<TransferReport> {
        let fleet_dir = fleet_dir.trim_end_matches('/');
        let objects = self.store.list(src).await?;
        let mut manifest = Manifest::default();
        for object in &objects {
            let rel = object
                .relative_to(src)
                .ok_or_else(|| ClusterError::transfer(object.as_str(), format!("not below {src}")))?;
            manifest.push(object.as_str(), format!("{fleet_dir}/{rel}"))?;
        }

        self.run_copy_job("copy-in", STORE_TO_FLEET_MAPPER, &manifest, width).await?;

        if !manifest.is_empty() {
            let present: BTreeSet<String> = self
                .fs
                .list(fleet_dir)
                .await?
                .into_iter()
                .filter(|e| !e.is_dir)
                .map(|e| e.path)
                .collect();
            let missing = manifest
                .entries()
                .iter()
                .filter(|e| !present.contains(&e.destination))
                .map(|e| e.source.clone())
                .collect_vec();
            if !missing.is_empty() {
                return Err(ClusterError::Transfer {
                    objects: missing,
                    reason: format!("not found in {fleet_dir} after copy"),
                });
            }
        }
        info!("copied {} objects from {src} into {fleet_dir}", manifest.len());

        Ok(TransferReport {
            copied: manifest.len(),
            combined: vec![],
        })
    }

    /// Copy every file below `fleet_dir` into `dst`, keeping relative
    /// paths. Part files of job result directories are combined into one
    /// `results` object per directory.
    pub async fn copy_out_of_fleet(&self, fleet_dir: &str, dst: &ObjectUri, width: usize) -> Result<TransferReport> {
        let fleet_dir = fleet_dir.trim_end_matches('/');
        let entries = self.fs.list(fleet_dir).await?;
        let outgoing = classify_outgoing(&entries);
        let rel_path = |path: &str| path.strip_prefix(fleet_dir).unwrap_or_default().trim_start_matches('/').to_string();

        // a job output file of the same name would be overwritten
        let clashes = outgoing
            .results
            .keys()
            .map(|dir| format!("{dir}/{RESULTS_NAME}"))
            .filter(|path| outgoing.files.contains(path))
            .collect_vec();
        if !clashes.is_empty() {
            return Err(ClusterError::Transfer {
                objects: clashes,
                reason: format!("clashes with the combined {RESULTS_NAME} object"),
            });
        }

        let mut combined = vec![];
        for (dir, parts) in &outgoing.results {
            let target = dst.join(&rel_path(dir)).join(RESULTS_NAME);
            info!("combine {} parts of {dir} into {target}", parts.len());
            self.fs.concat_to_store(parts, &target).await?;
            combined.push(target);
        }

        let mut manifest = Manifest::default();
        for path in &outgoing.files {
            let rel = rel_path(path);
            if rel.is_empty() {
                return Err(ClusterError::transfer(path.as_str(), format!("not below {fleet_dir}")));
            }
            manifest.push(path.as_str(), dst.join(&rel).as_str())?;
        }
        self.run_copy_job("copy-out", FLEET_TO_STORE_MAPPER, &manifest, width).await?;

        if !manifest.is_empty() || !combined.is_empty() {
            let present: BTreeSet<String> = self.store.list(dst).await?.into_iter().map(|x| x.to_string()).collect();
            let missing = manifest
                .entries()
                .iter()
                .map(|e| e.destination.clone())
                .chain(combined.iter().map(|x| x.to_string()))
                .filter(|d| !present.contains(d))
                .collect_vec();
            if !missing.is_empty() {
                return Err(ClusterError::Transfer {
                    objects: missing,
                    reason: "not found in the object store after copy".into(),
                });
            }
        }
        info!("copied {} files and {} results from {fleet_dir} to {dst}", manifest.len(), combined.len());

        Ok(TransferReport {
            copied: manifest.len(),
            combined,
        })
    }
}
// 6a9e3f17 ends here

// [[file:../fleet.note::b0c4e8d5][b0c4e8d5]]
#[test]
fn test_manifest() {
    let mut manifest = Manifest::default();
    manifest.push("gs://b/in/a.txt", "/data/a.txt").unwrap();
    manifest.push("gs://b/in/sub/b.txt", "/data/sub/b.txt").unwrap();
    let txt = manifest.render();
    assert_eq!(txt, "gs://b/in/a.txt\t/data/a.txt\ngs://b/in/sub/b.txt\t/data/sub/b.txt\n");
    assert_eq!(Manifest::parse(&txt).unwrap(), manifest);
    assert!(Manifest::parse("").unwrap().is_empty());

    assert!(manifest.push("gs://b/in/with\ttab", "/data/x").is_err());
    assert!(manifest.push("gs://b/in/x", "/data/new\nline").is_err());
    assert!(Manifest::parse("no-separator\n").is_err());
}

#[test]
fn test_part_order() {
    assert_eq!(part_index("part-00009"), Some("9"));
    assert_eq!(part_index("part-10"), Some("10"));
    assert_eq!(part_index("part-00000"), Some("0"));
    // wider than any machine integer
    assert_eq!(part_index("part-000123456789012345678901234567890"), Some("123456789012345678901234567890"));
    assert_eq!(part_index("part-"), None);
    assert_eq!(part_index("part-1.gz"), None);
    assert_eq!(part_index("apart-1"), None);

    let mut parts = vec![
        "/o/part-10".to_string(),
        "/o/part-99999999999999999999999".into(),
        "/o/part-9".into(),
        "/o/part-00000".into(),
    ];
    sort_parts(&mut parts);
    assert_eq!(
        parts,
        vec!["/o/part-00000", "/o/part-9", "/o/part-10", "/o/part-99999999999999999999999"]
    );
}

#[test]
fn test_classify_outgoing() {
    let file = |path: &str| FsEntry {
        path: path.into(),
        is_dir: false,
        size: 1,
    };
    let dir = |path: &str| FsEntry {
        path: path.into(),
        is_dir: true,
        size: 0,
    };
    let entries = vec![
        dir("/out/result"),
        file("/out/result/_SUCCESS"),
        file("/out/result/part-00010"),
        file("/out/result/part-00002"),
        file("/out/result/part-123456789012345678901"),
        file("/out/result/_logs/history/job.xml"),
        file("/out/result/extra.txt"),
        // no marker: an ordinary file
        file("/out/plain/part-00000"),
        file("/out/top.txt"),
    ];
    let outgoing = classify_outgoing(&entries);
    assert_eq!(outgoing.results.len(), 1);
    assert_eq!(
        outgoing.results["/out/result"],
        vec![
            "/out/result/part-00002",
            "/out/result/part-00010",
            "/out/result/part-123456789012345678901"
        ]
    );
    assert_eq!(
        outgoing.files,
        vec!["/out/result/extra.txt", "/out/plain/part-00000", "/out/top.txt"]
    );
}
// b0c4e8d5 ends here
