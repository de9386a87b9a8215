//! In-memory compute driver for tests

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::ComputeDriver;
use crate::error::{Error, Result};
use crate::service::{Catalog, Endpoint, ServiceEvent, ServiceInfo};

/// Scripted driver recording every call it receives
#[derive(Default)]
pub struct MockDriver {
    services: Mutex<HashMap<String, ServiceInfo>>,
    /// (fragment of the last argv element, scripted result)
    responses: Mutex<Vec<(String, std::result::Result<String, String>)>>,
    calls: Mutex<Vec<String>>,
    failing_jobs: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, service: ServiceInfo) {
        self.services
            .lock()
            .unwrap()
            .insert(service.name.clone(), service);
    }

    /// Answer commands containing `fragment` with `output`
    pub fn respond(&self, fragment: &str, output: &str) {
        let mut responses = self.responses.lock().unwrap();
        responses.retain(|(f, _)| f != fragment);
        responses.push((fragment.to_string(), Ok(output.to_string())));
    }

    /// Fail commands containing `fragment`
    pub fn fail(&self, fragment: &str, reason: &str) {
        let mut responses = self.responses.lock().unwrap();
        responses.retain(|(f, _)| f != fragment);
        responses.push((fragment.to_string(), Err(reason.to_string())));
    }

    pub fn fail_job(&self, job_name: &str) {
        self.failing_jobs.lock().unwrap().push(job_name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether any recorded call contains `fragment` (case-insensitive)
    pub fn called(&self, fragment: &str) -> bool {
        let fragment = fragment.to_lowercase();
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.to_lowercase().contains(&fragment))
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl ComputeDriver for MockDriver {
    async fn create_service(&self, service: &ServiceInfo) -> Result<()> {
        self.record(format!("create {}", service.name));
        self.add_service(service.clone());
        Ok(())
    }

    async fn destroy_service(&self, service: &ServiceInfo) -> Result<()> {
        self.record(format!("destroy {}", service.name));
        self.services.lock().unwrap().remove(&service.name);
        Ok(())
    }

    async fn start_service(&self, service: &ServiceInfo) -> Result<()> {
        self.record(format!("start {}", service.name));
        Ok(())
    }

    async fn stop_service(&self, service: &ServiceInfo) -> Result<()> {
        self.record(format!("stop {}", service.name));
        Ok(())
    }

    async fn exec_command(&self, service: &ServiceInfo, argv: &[String]) -> Result<Vec<u8>> {
        let command = argv.last().cloned().unwrap_or_default();
        self.record(format!("exec {} {}", service.name, command));

        let lowered = command.to_lowercase();
        let responses = self.responses.lock().unwrap();
        let scripted = responses
            .iter()
            .rev()
            .find(|(fragment, _)| lowered.contains(&fragment.to_lowercase()));

        match scripted {
            Some((_, Ok(output))) => Ok(output.clone().into_bytes()),
            Some((_, Err(reason))) => Err(Error::Driver(reason.clone())),
            None => Ok(Vec::new()),
        }
    }

    async fn run_job(&self, service: &ServiceInfo, job_name: &str, commands: &[String]) -> Result<()> {
        self.record(format!("job {} {} {}", service.name, job_name, commands.join(" && ")));
        if self.failing_jobs.lock().unwrap().iter().any(|j| j == job_name) {
            return Err(Error::Driver(format!("job {} failed", job_name)));
        }
        Ok(())
    }

    async fn list_services(&self, catalog: Catalog) -> Result<Vec<ServiceInfo>> {
        let mut services: Vec<ServiceInfo> = self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.catalog == catalog)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn query_service(&self, name: &str, catalog: Catalog) -> Result<ServiceInfo> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .filter(|s| s.catalog == catalog)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    async fn change_endpoint(&self, service: &ServiceInfo, target: &Endpoint) -> Result<()> {
        self.record(format!("change_endpoint {} {}", service.name, target));
        Ok(())
    }

    async fn restore_endpoint(&self, service: &ServiceInfo) -> Result<()> {
        self.record(format!("restore_endpoint {}", service.name));
        Ok(())
    }

    async fn watch(&self, _sender: mpsc::Sender<ServiceEvent>) -> Result<()> {
        Ok(())
    }
}
