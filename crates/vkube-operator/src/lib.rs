//! vkube syncer process: configuration and startup

#![deny(missing_docs)]

pub mod cli;
pub mod startup;
