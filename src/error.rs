// [[file:../fleet.note::1c0e7a52][1c0e7a52]]
//! Error kinds of cluster operations. Every variant names the resource that
//! failed: machine, object path or job.
// 1c0e7a52 ends here

// [[file:../fleet.note::6f3b10d4][6f3b10d4]]
use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::compute::ApiError;
use crate::gateway::GatewayError;

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

fn describe(failed: &BTreeMap<String, String>) -> String {
    failed.iter().map(|(name, reason)| format!("{name} ({reason})")).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Bad prefix, location or job parameter. Raised before any remote call.
    #[error("invalid {what}: {reason}")]
    Validation { what: String, reason: String },

    #[error("cluster already exists: {}", .0.join(", "))]
    NameCollision(Vec<String>),

    /// Some machines did not start. The map is machine name to reason.
    #[error("machines failed to start: {}", describe(.failed))]
    Provision { failed: BTreeMap<String, String> },

    /// Bootstrap failed on some machines, the others are unaffected.
    #[error("bootstrap failed on: {}", describe(.failed))]
    Bootstrap { failed: BTreeMap<String, String> },

    #[error("transfer failed for {}: {reason}", .objects.join(", "))]
    Transfer { objects: Vec<String>, reason: String },

    #[error("job {job} failed: {reason}")]
    JobSubmission { job: String, reason: String },

    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    #[error("teardown failed for: {}", describe(.failed))]
    Teardown { failed: BTreeMap<String, String> },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("operation cancelled while {0}")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn validation(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn transfer(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transfer {
            objects: vec![object.into()],
            reason: reason.into(),
        }
    }

    /// Return true if this error came from the operator interrupting us.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
// 6f3b10d4 ends here

// [[file:../fleet.note::0d5a2e61][0d5a2e61]]
#[test]
fn test_error_names_resources() {
    let mut failed = BTreeMap::new();
    failed.insert("ab-hw-001".to_string(), "STAGING".to_string());
    failed.insert("ab-hw-002".to_string(), "quota exceeded".to_string());
    let e = ClusterError::Provision { failed };
    let msg = e.to_string();
    assert!(msg.contains("ab-hw-001 (STAGING)"));
    assert!(msg.contains("ab-hw-002 (quota exceeded)"));

    let e = ClusterError::transfer("gs://b/in/a.txt", "missing after copy");
    assert!(e.to_string().contains("gs://b/in/a.txt"));
}
// 0d5a2e61 ends here
