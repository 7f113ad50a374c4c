//! Batch Supervisor: runs external worker processes for credential batch
//! jobs, enforces their lifecycle and turns their outcome files into
//! durable per-credential results.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod job;
pub mod outcome;
pub mod process;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod supervisor;
