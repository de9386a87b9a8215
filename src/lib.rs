//! WolfHA - MariaDB master/slave role agent
//!
//! Each member of a two-node cluster runs one agent. The agent watches a
//! shared designation file naming the current master and drives every
//! local database service into the matching role.
//!
//! # Architecture
//!
//! - [`reconcile`]: the per-node loop. Polls the designation, queues role
//!   switches and retries failed ones for a bounded time.
//! - [`catalog`]: per-database role switch protocol (promotion, demotion,
//!   full resync from the peer's backup).
//! - [`driver`]: the backend running the database processes.
//! - [`peer`]: the remote agent API client and the backup sync transport.
//! - [`api`]: the HTTP surface the remote agent and operators call.

pub mod alarm;
pub mod api;
pub mod catalog;
pub mod config;
pub mod designation;
pub mod driver;
pub mod error;
pub mod peer;
pub mod reconcile;
pub mod service;
pub mod status;

pub use config::AgentConfig;
pub use error::{Error, Result};
