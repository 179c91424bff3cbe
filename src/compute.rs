// [[file:../fleet.note::5b0e93a4][5b0e93a4]]
//! The compute-fleet API: create, inspect and delete machines and routes.
// 5b0e93a4 ends here

// [[file:../fleet.note::c3d8e1f2][c3d8e1f2]]
use crate::base::Backoff;
use crate::common::*;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
// c3d8e1f2 ends here

// [[file:../fleet.note::4a61f0c8][4a61f0c8]]
mod gce;

pub use gce::GceApi;
// 4a61f0c8 ends here

// [[file:../fleet.note::93c2d7b1][93c2d7b1]]
/// Error reported by the compute API.
#[derive(Debug, Clone, Error)]
#[error("compute API error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct ApiError {
    /// HTTP status, when the error came from a response.
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Return true if the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// Instance status reported by the API once it runs.
pub const RUNNING: &str = "RUNNING";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// The part of a machine resource this crate looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == RUNNING
    }

    pub fn internal_ip(&self) -> Option<&str> {
        self.network_interfaces.iter().find_map(|x| x.network_ip.as_deref())
    }

    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|x| x.access_configs.iter())
            .find_map(|x| x.nat_ip.as_deref())
    }
}

/// Parameters of a new machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub image: String,
    pub metadata: BTreeMap<String, String>,
    /// Give the machine an external NAT address.
    pub external_ip: bool,
    pub can_ip_forward: bool,
    pub tags: Vec<String>,
    /// Service account scopes.
    pub scopes: Vec<String>,
}

/// A route sending `dest_range` from machines tagged with `tags` through
/// `next_hop_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub name: String,
    pub next_hop_instance: String,
    pub dest_range: String,
    pub tags: Vec<String>,
    pub priority: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperationMessage {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for OperationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationMessage>,
}

/// A long running operation of the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    /// URL of the operation resource, zonal or global.
    #[serde(default, rename = "selfLink")]
    pub self_link: Option<String>,
    #[serde(default)]
    pub error: Option<OperationErrors>,
    #[serde(default)]
    pub warnings: Vec<OperationMessage>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    pub fn errors(&self) -> &[OperationMessage] {
        self.error.as_ref().map(|x| x.errors.as_slice()).unwrap_or_default()
    }

    /// Return true if every error of this operation is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        let errors = self.errors();
        !errors.is_empty() && errors.iter().all(|e| e.code == "RESOURCE_NOT_FOUND")
    }
}
// 93c2d7b1 ends here

// [[file:../fleet.note::e8b40f25][e8b40f25]]
/// The compute-fleet API.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Operation, ApiError>;

    /// Return None if `name` does not exist.
    async fn get_instance(&self, name: &str) -> Result<Option<Instance>, ApiError>;

    /// List machines whose name matches `filter`.
    async fn list_instances(&self, filter: &str) -> Result<Vec<Instance>, ApiError>;

    async fn delete_instance(&self, name: &str) -> Result<Operation, ApiError>;

    /// Refresh zonal or global operation `op`.
    async fn get_operation(&self, op: &Operation) -> Result<Operation, ApiError>;

    async fn insert_route(&self, request: &RouteRequest) -> Result<Operation, ApiError>;

    async fn delete_route(&self, name: &str) -> Result<Operation, ApiError>;
}

/// Poll `op` until it is done. Warnings are logged. Errors of a finished
/// operation are returned as `ApiError`.
pub async fn wait_operation(
    api: &dyn ComputeApi,
    op: Operation,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<Operation> {
    let what = format!("operation {}", op.name);
    let done = if op.is_done() {
        op
    } else {
        backoff
            .wait_until(&what, cancel, || async {
                let op = api.get_operation(&op).await?;
                Ok(op.is_done().then_some(op))
            })
            .await?
    };

    for w in &done.warnings {
        warn!("{what}: {w}");
    }
    let errors = done.errors();
    if errors.is_empty() {
        Ok(done)
    } else {
        for e in errors {
            error!("{what}: {e}");
        }
        let status = done.is_not_found().then_some(404);
        let message = errors.iter().map(|e| e.to_string()).join("; ");
        Err(ApiError::new(status, message).into())
    }
}
// e8b40f25 ends here

// [[file:../fleet.note::1f9a7e60][1f9a7e60]]
#[test]
fn test_instance_addresses() {
    let txt = r#"{
        "name": "ab-hm",
        "status": "RUNNING",
        "networkInterfaces": [
            {"networkIP": "10.240.0.2", "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "natIP": "203.0.113.9"}]}
        ]
    }"#;
    let instance: Instance = serde_json::from_str(txt).unwrap();
    assert!(instance.is_running());
    assert_eq!(instance.internal_ip(), Some("10.240.0.2"));
    assert_eq!(instance.external_ip(), Some("203.0.113.9"));

    let instance: Instance = serde_json::from_str(r#"{"name": "ab-hw-000", "status": "STAGING"}"#).unwrap();
    assert!(!instance.is_running());
    assert_eq!(instance.external_ip(), None);
}

#[test]
fn test_operation_errors() {
    let txt = r#"{
        "name": "operation-1", "status": "DONE",
        "error": {"errors": [{"code": "RESOURCE_NOT_FOUND", "message": "The resource 'ab-hm' was not found"}]}
    }"#;
    let op: Operation = serde_json::from_str(txt).unwrap();
    assert!(op.is_done());
    assert!(op.is_not_found());
    assert_eq!(op.errors().len(), 1);

    let op: Operation = serde_json::from_str(r#"{"name": "operation-2", "status": "PENDING"}"#).unwrap();
    assert!(!op.is_done());
    assert!(op.errors().is_empty());
    assert!(!op.is_not_found());

    assert!(ApiError::new(Some(404), "gone").is_not_found());
    assert_eq!(ApiError::new(Some(500), "boom").to_string(), "compute API error (HTTP 500): boom");
}
// 1f9a7e60 ends here
