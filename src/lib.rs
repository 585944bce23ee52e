//! vmfixture - pre/post-processing of VM test fixtures.
//!
//! Before a virtualization test body runs, [`fixture::Fixture::preprocess`]
//! prepares host storage and tuning, creates or restores disk images, brings
//! the requested VMs up and starts background pollers. Afterwards
//! [`fixture::Fixture::postprocess`] stops the pollers, kills or keeps VMs,
//! checks and removes images, and reverts host changes.
//!
//! # Architecture
//!
//! - [`storage`]: image lifecycle actions and storage backends
//! - [`vm`]: VM handle traits and per-VM lifecycle actions
//! - [`scheduler`]: serial or partitioned parallel image processing
//! - [`fixture`]: the orchestration driver
//! - [`poller`]: screendump and register background loops
//! - [`host`]: host probes, tuning and hook commands

pub mod artifacts;
pub mod codec;
pub mod config;
pub mod env;
pub mod error;
pub mod fixture;
pub mod host;
pub mod kernel;
pub mod poller;
pub mod scheduler;
pub mod storage;
pub mod testrun;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Params;
pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
