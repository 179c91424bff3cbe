// [[file:../fleet.note::dba9de5e][dba9de5e]]
//! Ephemeral Hadoop clusters on Compute Engine: provision a fleet of
//! machines, bootstrap the cluster daemons, move data between Cloud Storage
//! and the cluster filesystem, run streaming jobs and tear everything down.
// dba9de5e ends here

// [[file:../fleet.note::b21b77b4][b21b77b4]]
mod signal;

pub mod base;
pub mod bootstrap;
pub mod cli;
pub mod compute;
pub mod config;
pub mod error;
pub mod fleet;
pub mod fleetfs;
pub mod gateway;
pub mod job;
pub mod naming;
pub mod provision;
pub mod storage;
pub mod teardown;
pub mod transfer;

mod common {
    pub use crate::error::{ClusterError, Result};
    pub use itertools::Itertools;
    pub use log::{debug, error, info, trace, warn};
    pub use serde::{Deserialize, Serialize};
}
// b21b77b4 ends here

// [[file:../fleet.note::0a725e9c][0a725e9c]]
pub use crate::config::FleetConfig;
pub use crate::error::{ClusterError, Result};
pub use crate::fleet::{Collaborators, Fleet};
pub use crate::naming::{machine_name, Role};
// 0a725e9c ends here
