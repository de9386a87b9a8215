//! Compute Driver
//!
//! Abstraction over the backend that runs the database processes: lifecycle,
//! command execution inside a service, one-shot jobs sharing a service's
//! volumes, discovery and endpoint routing.

mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerDriver;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::service::{Catalog, Endpoint, ServiceEvent, ServiceInfo};

/// Backend running the managed services
#[async_trait::async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Create and start a new service
    async fn create_service(&self, service: &ServiceInfo) -> Result<()>;

    /// Remove a service and its runtime (volumes on the host are kept)
    async fn destroy_service(&self, service: &ServiceInfo) -> Result<()>;

    async fn start_service(&self, service: &ServiceInfo) -> Result<()>;

    async fn stop_service(&self, service: &ServiceInfo) -> Result<()>;

    /// Run a command inside the service, returning its standard output
    async fn exec_command(&self, service: &ServiceInfo, argv: &[String]) -> Result<Vec<u8>>;

    /// Run shell commands in sequence in a one-shot job sharing the service's volumes
    async fn run_job(&self, service: &ServiceInfo, job_name: &str, commands: &[String]) -> Result<()>;

    /// List the services of a catalog
    async fn list_services(&self, catalog: Catalog) -> Result<Vec<ServiceInfo>>;

    /// Look up one service
    async fn query_service(&self, name: &str, catalog: Catalog) -> Result<ServiceInfo>;

    /// Route the service's clients to another endpoint
    async fn change_endpoint(&self, service: &ServiceInfo, target: &Endpoint) -> Result<()>;

    /// Route the service's clients back to the service itself
    async fn restore_endpoint(&self, service: &ServiceInfo) -> Result<()>;

    /// Emit lifecycle events until the receiver is dropped
    async fn watch(&self, sender: mpsc::Sender<ServiceEvent>) -> Result<()>;
}
