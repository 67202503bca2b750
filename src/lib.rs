//! Coordination core for automated forensic ingest.
//!
//! A fleet of hosts shares a directory of manifest files, each describing
//! one data source to ingest into a case. The hosts coordinate through a
//! shared store of per-manifest records and advisory locks: scans discover
//! work and recover crashed jobs, a per-host monitor maintains the pending,
//! running, and completed views, and events keep peers' views fresh between
//! scans.

pub mod cases;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod job;
pub mod manifest;
pub mod monitor;
pub mod node_data;
pub mod scanner;

pub use config::MonitorConfig;
pub use error::{AutoIngestError, Result};
pub use job::AutoIngestJob;
pub use monitor::{AutoIngestMonitor, JobsSnapshot};
