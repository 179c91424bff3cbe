// [[file:../fleet.note::4b1d8e6a][4b1d8e6a]]
//! Delete every machine of a cluster. Safe to repeat.
// 4b1d8e6a ends here

// [[file:../fleet.note::a07c5f32][a07c5f32]]
use crate::base::{for_each_bounded, Backoff};
use crate::common::*;
use crate::compute::{wait_operation, ComputeApi, Operation};
use crate::naming::Naming;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
// a07c5f32 ends here

// [[file:../fleet.note::d58e9b04][d58e9b04]]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Machines deleted by this call.
    pub deleted: Vec<String>,
    /// Whether the NAT route was deleted by this call.
    pub route_deleted: bool,
}

/// Wait for a delete operation. Missing resources count as deleted.
/// Return false if the resource was already gone.
async fn finish_delete(
    api: &dyn ComputeApi,
    issued: std::result::Result<Operation, crate::compute::ApiError>,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<bool> {
    let op = match issued {
        Ok(op) => op,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match wait_operation(api, op, backoff, cancel).await {
        Ok(_) => Ok(true),
        Err(ClusterError::Api(e)) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete every machine whose name belongs to `naming`, and the NAT route.
/// Names returned by the API filter are checked again, so machines of
/// other clusters are never touched.
pub async fn teardown(
    api: Arc<dyn ComputeApi>,
    naming: &Naming,
    concurrency: usize,
    backoff: Backoff,
    cancel: CancellationToken,
) -> Result<TeardownReport> {
    let names = api
        .list_instances(&naming.filter_expression())
        .await?
        .into_iter()
        .map(|x| x.name)
        .filter(|name| naming.owns(name))
        .sorted()
        .dedup()
        .collect_vec();
    if names.is_empty() {
        info!("no machine of cluster {:?} is left", naming.prefix());
    }

    let results = for_each_bounded(names.clone(), concurrency, |name| {
        let api = api.clone();
        let cancel = cancel.clone();
        async move {
            info!("shutting down {name}");
            let issued = api.delete_instance(&name).await;
            finish_delete(api.as_ref(), issued, &backoff, &cancel).await
        }
    })
    .await;

    let mut report = TeardownReport::default();
    let mut failed = BTreeMap::new();
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(true) => report.deleted.push(name),
            Ok(false) => debug!("{name} was already gone"),
            Err(e) => {
                error!("failed to delete {name}: {e}");
                failed.insert(name, e.to_string());
            }
        }
    }

    let route = naming.route_name();
    let issued = api.delete_route(&route).await;
    match finish_delete(api.as_ref(), issued, &backoff, &cancel).await {
        Ok(deleted) => report.route_deleted = deleted,
        Err(e) => {
            error!("failed to delete route {route}: {e}");
            failed.insert(route, e.to_string());
        }
    }

    if failed.is_empty() {
        Ok(report)
    } else {
        Err(ClusterError::Teardown { failed })
    }
}
// d58e9b04 ends here
