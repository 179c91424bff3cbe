// [[file:../fleet.note::4c8e2a17][4c8e2a17]]
//! Object store locations and the client used to list and copy objects.
// 4c8e2a17 ends here

// [[file:../fleet.note::d62b90f1][d62b90f1]]
use crate::common::*;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
// d62b90f1 ends here

// [[file:../fleet.note::7ab3e4c5][7ab3e4c5]]
pub const SCHEME: &str = "gs://";

/// A validated `gs://bucket/path` location. Trailing slashes are removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectUri(String);

impl ObjectUri {
    /// Parse `s`, which must begin with the object store scheme and name a
    /// bucket.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| ClusterError::validation(format!("location {s:?}"), format!("must begin with {SCHEME}")))?;
        let trimmed = rest.trim_end_matches('/');
        let bucket = trimmed.split('/').next().unwrap_or_default();
        if bucket.is_empty() {
            return Err(ClusterError::validation(format!("location {s:?}"), "no bucket name"));
        }
        if trimmed.contains(|c: char| c == '\t' || c == '\n') {
            return Err(ClusterError::validation(format!("location {s:?}"), "tab or newline in path"));
        }
        Ok(Self(format!("{SCHEME}{trimmed}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bucket(&self) -> &str {
        self.0[SCHEME.len()..].split('/').next().unwrap_or_default()
    }

    /// Append `rel` as path components.
    pub fn join(&self, rel: &str) -> Self {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            self.clone()
        } else {
            Self(format!("{}/{rel}", self.0))
        }
    }

    /// The path of `self` below `dir`, or None if `self` is not inside `dir`.
    pub fn relative_to(&self, dir: &ObjectUri) -> Option<&str> {
        let rel = self.0.strip_prefix(&dir.0)?.strip_prefix('/')?;
        (!rel.is_empty()).then_some(rel)
    }

    /// Last path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl std::fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ObjectUri {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
// 7ab3e4c5 ends here

// [[file:../fleet.note::e2fd7b06][e2fd7b06]]
/// The object store client.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every object below `dir`, recursively and flat. Directory
    /// placeholders are not objects.
    async fn list(&self, dir: &ObjectUri) -> Result<Vec<ObjectUri>>;

    /// Upload the local file `src` to `dst`.
    async fn upload(&self, src: &Path, dst: &ObjectUri) -> Result<()>;

    /// Write `data` to `dst`.
    async fn put(&self, data: &[u8], dst: &ObjectUri) -> Result<()>;

    /// Read the content of `src`.
    async fn get(&self, src: &ObjectUri) -> Result<Vec<u8>>;
}
// e2fd7b06 ends here

// [[file:../fleet.note::3f6c81d9][3f6c81d9]]
/// Drive the `gsutil` command line client.
#[derive(Debug, Clone)]
pub struct Gsutil {
    program: String,
}

impl Gsutil {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Keep object lines of `gsutil ls` output.
fn parse_listing(out: &str) -> Result<Vec<ObjectUri>> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with('/') && !line.ends_with(':'))
        .map(ObjectUri::parse)
        .collect()
}

#[async_trait]
impl ObjectStore for Gsutil {
    async fn list(&self, dir: &ObjectUri) -> Result<Vec<ObjectUri>> {
        let pattern = format!("{dir}/**");
        debug!("{} ls {pattern}", self.program);
        let out = self.command().arg("ls").arg(&pattern).output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            // an empty directory is not an error
            if stderr.contains("matched no objects") {
                return Ok(vec![]);
            }
            return Err(ClusterError::transfer(dir.as_str(), format!("listing failed: {}", stderr.trim())));
        }
        parse_listing(&String::from_utf8_lossy(&out.stdout))
    }

    async fn upload(&self, src: &Path, dst: &ObjectUri) -> Result<()> {
        debug!("{} cp {} {dst}", self.program, src.display());
        let out = self.command().arg("cp").arg(src).arg(dst.as_str()).output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ClusterError::transfer(
                src.display().to_string(),
                format!("upload to {dst} failed: {}", stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn put(&self, data: &[u8], dst: &ObjectUri) -> Result<()> {
        debug!("{} cp - {dst}", self.program);
        let mut child = self
            .command()
            .arg("cp")
            .arg("-")
            .arg(dst.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
        }
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ClusterError::transfer(dst.as_str(), format!("write failed: {}", stderr.trim())));
        }
        Ok(())
    }

    async fn get(&self, src: &ObjectUri) -> Result<Vec<u8>> {
        debug!("{} cat {src}", self.program);
        let out = self.command().arg("cat").arg(src.as_str()).output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ClusterError::transfer(src.as_str(), format!("read failed: {}", stderr.trim())));
        }
        Ok(out.stdout)
    }
}
// 3f6c81d9 ends here

// [[file:../fleet.note::8b05d3ea][8b05d3ea]]
#[test]
fn test_object_uri() {
    let uri = ObjectUri::parse("gs://data/inputs/").unwrap();
    assert_eq!(uri.as_str(), "gs://data/inputs");
    assert_eq!(uri.bucket(), "data");
    assert_eq!(uri.join("a/b.txt").as_str(), "gs://data/inputs/a/b.txt");
    assert_eq!(uri.join("a/b.txt").file_name(), "b.txt");

    let obj = ObjectUri::parse("gs://data/inputs/sub/x").unwrap();
    assert_eq!(obj.relative_to(&uri), Some("sub/x"));
    let other = ObjectUri::parse("gs://data/inputs2/x").unwrap();
    assert_eq!(other.relative_to(&uri), None);
    assert_eq!(uri.relative_to(&uri), None);

    assert!(ObjectUri::parse("/local/file").is_err());
    assert!(ObjectUri::parse("s3://data").is_err());
    assert!(ObjectUri::parse("gs://").is_err());
    assert!(ObjectUri::parse("gs://b/with\ttab").is_err());
}

#[test]
fn test_parse_listing() {
    let out = "gs://b/in/:\ngs://b/in/a.txt\ngs://b/in/sub/\ngs://b/in/sub/b.txt\n\n";
    let objects = parse_listing(out).unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[1].as_str(), "gs://b/in/sub/b.txt");
}
// 8b05d3ea ends here
