//! Auxiliary controllers running next to the syncers.
//!
//! Each module exposes a `register` function adding its runnable to the
//! virtual or physical [`vkube_syncer::ClusterManager`]. The operator decides
//! which ones run and in what order.

#![deny(missing_docs)]

pub mod coredns;
pub mod endpoints;
pub mod manifests;
pub mod podsecurity;
pub mod runner;
pub mod securitycontext;
