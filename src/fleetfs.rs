// [[file:../fleet.note::d0e4a3b6][d0e4a3b6]]
//! The cluster's own distributed filesystem, reached through the controller.
// d0e4a3b6 ends here

// [[file:../fleet.note::b59f6e21][b59f6e21]]
use crate::base::{random_name, shell_escape, shell_join};
use crate::common::*;
use crate::config::HadoopConfig;
use crate::gateway::{RemoteShell, RunMode};
use crate::storage::ObjectUri;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
// b59f6e21 ends here

// [[file:../fleet.note::40fa81c3][40fa81c3]]
/// One entry of a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Absolute path in the fleet filesystem.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

impl FsEntry {
    /// The path of this entry below `dir`, or None if outside of it.
    pub fn relative_to(&self, dir: &str) -> Option<&str> {
        let dir = dir.trim_end_matches('/');
        let rel = self.path.strip_prefix(dir)?.strip_prefix('/')?;
        (!rel.is_empty()).then_some(rel)
    }
}

#[async_trait]
pub trait FleetFs: Send + Sync {
    /// Write `data` to the file at `path`, creating parent directories.
    async fn put(&self, data: &[u8], path: &str) -> Result<()>;

    /// List everything below `dir` recursively. A missing directory lists
    /// as empty, any other failure is a transfer error.
    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>>;

    /// Concatenate `parts` in the given order into the object `dst`.
    async fn concat_to_store(&self, parts: &[String], dst: &ObjectUri) -> Result<()>;

    /// Remove `path` recursively. Removing a missing path succeeds.
    async fn remove(&self, path: &str) -> Result<()>;
}
// 40fa81c3 ends here

// [[file:../fleet.note::c87ab2f4][c87ab2f4]]
/// Parse the output of `hadoop fs -lsr`:
///
/// drwxr-xr-x   - hadoop supergroup          0 2014-01-01 00:00 /out
/// -rw-r--r--   3 hadoop supergroup         12 2014-01-01 00:00 /out/part-00000
fn parse_lsr(out: &str) -> Vec<FsEntry> {
    out.lines()
        .filter_map(|line| {
            let fields: Vec<_> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let perms = fields[0];
            if !(perms.starts_with('d') || perms.starts_with('-')) {
                return None;
            }
            let size = fields[4].parse().ok()?;
            // paths may contain spaces
            let path = fields[7..].join(" ");
            Some(FsEntry {
                path,
                is_dir: perms.starts_with('d'),
                size,
            })
        })
        .collect()
}

/// `hadoop fs` run on the controller as the hadoop user.
#[derive(Clone)]
pub struct HadoopFs {
    shell: Arc<dyn RemoteShell>,
    controller: String,
    hadoop: HadoopConfig,
}

impl HadoopFs {
    pub fn new(shell: Arc<dyn RemoteShell>, controller: impl Into<String>, hadoop: HadoopConfig) -> Self {
        Self {
            shell,
            controller: controller.into(),
            hadoop,
        }
    }

    fn fs_command<S: AsRef<str>>(&self, args: impl IntoIterator<Item = S>) -> String {
        format!("{} fs {}", shell_escape(&self.hadoop.hadoop_bin()), shell_join(args))
    }

    async fn run(&self, command: &str) -> Result<i32> {
        let code = self
            .shell
            .run(&self.controller, command, Some(&self.hadoop.user), RunMode::Wait)
            .await?;
        Ok(code)
    }
}

#[async_trait]
impl FleetFs for HadoopFs {
    async fn put(&self, data: &[u8], path: &str) -> Result<()> {
        // stage locally, push to the controller, then copy into the filesystem
        let tmpdir = tempfile::tempdir()?;
        let local = tmpdir.path().join("payload");
        tokio::fs::write(&local, data).await?;

        let remote = format!("/tmp/gosh-fleet-{}", random_name(8));
        self.shell.push(&self.controller, &local, &remote).await?;
        let parent = Path::new(path).parent().and_then(|p| p.to_str()).unwrap_or("/");
        // hadoop 1.x creates missing parents on -mkdir
        let command = format!(
            "chmod a+r {staged}; {mkdir} >/dev/null 2>&1; {rm} >/dev/null 2>&1; {put}; rc=$?; rm -f {staged}; exit $rc",
            staged = shell_escape(&remote),
            mkdir = self.fs_command(["-mkdir", parent]),
            rm = self.fs_command(["-rm", path]),
            put = self.fs_command(["-put", remote.as_str(), path]),
        );
        match self.run(&command).await? {
            0 => Ok(()),
            code => Err(ClusterError::transfer(path, format!("hadoop fs -put exited with {code}"))),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>> {
        let listing_error = |reason: String| ClusterError::transfer(dir, format!("listing failed: {reason}"));
        // -test exits with 1 for a missing path only
        let test = self.fs_command(["-test", "-e", dir]);
        match self.run(&test).await.map_err(|e| listing_error(e.to_string()))? {
            0 => {}
            1 => {
                debug!("{dir} does not exist, nothing to list");
                return Ok(vec![]);
            }
            code => return Err(listing_error(format!("hadoop fs -test exited with {code}"))),
        }
        let out = self
            .shell
            .output(&self.controller, &self.fs_command(["-lsr", dir]), Some(&self.hadoop.user))
            .await
            .map_err(|e| listing_error(e.to_string()))?;
        Ok(parse_lsr(&out))
    }

    async fn concat_to_store(&self, parts: &[String], dst: &ObjectUri) -> Result<()> {
        if parts.is_empty() {
            return Err(ClusterError::transfer(dst.as_str(), "no parts to concatenate"));
        }
        let cat = self.fs_command(std::iter::once("-cat").chain(parts.iter().map(|s| s.as_str())));
        let command = format!(
            "set -o pipefail; {cat} | {} cp - {}",
            shell_escape(&self.hadoop.gsutil),
            shell_escape(dst.as_str())
        );
        match self.run(&command).await? {
            0 => Ok(()),
            code => Err(ClusterError::Transfer {
                objects: parts.iter().cloned().chain(std::iter::once(dst.to_string())).collect(),
                reason: format!("concatenation exited with {code}"),
            }),
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let command = self.fs_command(["-rmr", path]) + " >/dev/null 2>&1 || true";
        self.run(&command).await?;
        Ok(())
    }
}
// c87ab2f4 ends here

// [[file:../fleet.note::2fd5a8c0][2fd5a8c0]]
#[test]
fn test_parse_lsr() {
    let out = "\
drwxr-xr-x   - hadoop supergroup          0 2014-01-01 00:00 /out
-rw-r--r--   3 hadoop supergroup          0 2014-01-01 00:00 /out/_SUCCESS
-rw-r--r--   3 hadoop supergroup         12 2014-01-01 00:00 /out/part-00000
-rw-r--r--   3 hadoop supergroup          7 2014-01-01 00:00 /out/with space.txt
Found 3 items
";
    let entries = parse_lsr(out);
    assert_eq!(entries.len(), 4);
    assert!(entries[0].is_dir);
    assert_eq!(entries[2].size, 12);
    assert_eq!(entries[3].path, "/out/with space.txt");
    assert_eq!(entries[2].relative_to("/out/"), Some("part-00000"));
    assert_eq!(entries[0].relative_to("/out"), None);
}
// 2fd5a8c0 ends here
