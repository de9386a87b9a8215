//! Docker Driver
//!
//! Runs services as containers through the `docker` CLI. Service metadata
//! lives in container labels; endpoint routing is published as override
//! files read by the local load balancer.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::ComputeDriver;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::service::{Catalog, Credentials, Endpoint, ServiceEvent, ServiceInfo, Volumes};

const LABEL_CATALOG: &str = "catalog";
const LABEL_HOST: &str = "host";
const LABEL_PORT: &str = "port";
const LABEL_ROOT: &str = "root";
const LABEL_PASSWORD: &str = "password";
const LABEL_CONF_PATH: &str = "confPath";
const LABEL_DATA_PATH: &str = "dataPath";
const LABEL_BACK_PATH: &str = "backPath";

/// Container mount points of a service's host volumes
#[derive(Debug, Clone)]
struct Mounts {
    conf: String,
    data: String,
    backup: String,
    port: u16,
}

/// Subset of `docker inspect` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    name: String,
    config: ContainerConfig,
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
    #[serde(default)]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerHealth {
    status: String,
}

/// Route override consumed by the load balancer
#[derive(Debug, serde::Serialize, Deserialize)]
struct RouteOverride {
    host: String,
    port: u16,
}

/// Docker CLI backed compute driver
pub struct DockerDriver {
    binary: String,
    label_prefix: String,
    exec_timeout: Duration,
    job_timeout: Duration,
    poll_interval: Duration,
    endpoint_dir: PathBuf,
    mounts: Mounts,
}

impl DockerDriver {
    /// Create a driver and check that the docker daemon answers
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        let driver = Self::new(config);
        driver
            .docker(&["version", "--format", "{{.Server.Version}}"], driver.exec_timeout)
            .await
            .map_err(|e| Error::Driver(format!("docker daemon unreachable: {}", e)))?;
        Ok(driver)
    }

    /// Create a driver without contacting the daemon
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            binary: config.driver.binary.clone(),
            label_prefix: config.driver.label_prefix.clone(),
            exec_timeout: Duration::from_secs(config.driver.exec_timeout_secs),
            job_timeout: Duration::from_secs(config.driver.job_timeout_secs),
            poll_interval: config.poll_interval(),
            endpoint_dir: config.endpoint_dir(),
            mounts: Mounts {
                conf: "/etc/mysql/conf.d".to_string(),
                data: config.mariadb.container_data_dir.clone(),
                backup: config.mariadb.container_backup_dir.clone(),
                port: config.mariadb.port,
            },
        }
    }

    fn label(&self, key: &str) -> String {
        format!("{}{}", self.label_prefix, key)
    }

    /// Run a docker CLI command and return its stdout
    async fn docker<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<Vec<u8>> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        tracing::debug!("{} {}", self.binary, args.join(" "));

        let output = tokio::time::timeout(timeout, Command::new(&self.binary).args(&args).output())
            .await
            .map_err(|_| {
                Error::Driver(format!("docker {} timed out after {:?}", args[0], timeout))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Driver(format!(
                "docker {} failed ({}): {}",
                args[0],
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspect> {
        let output = match self.docker(&["inspect", name], self.exec_timeout).await {
            Ok(output) => output,
            Err(Error::Driver(msg)) if msg.contains("No such") => {
                return Err(Error::ServiceNotFound(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut containers: Vec<ContainerInspect> = serde_json::from_slice(&output)?;
        containers
            .pop()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Names of all containers carrying a catalog label, optionally of one catalog
    async fn container_names(&self, catalog: Option<Catalog>) -> Result<Vec<String>> {
        let filter = match catalog {
            Some(catalog) => format!("label={}={}", self.label(LABEL_CATALOG), catalog),
            None => format!("label={}", self.label(LABEL_CATALOG)),
        };

        let output = self
            .docker(
                &["ps", "-a", "--filter", filter.as_str(), "--format", "{{.Names}}"],
                self.exec_timeout,
            )
            .await?;

        Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn services(&self, catalog: Option<Catalog>) -> Result<Vec<ServiceInfo>> {
        let mut services = Vec::new();
        for name in self.container_names(catalog).await? {
            let inspect = match self.inspect(&name).await {
                Ok(inspect) => inspect,
                // Removed between ps and inspect
                Err(Error::ServiceNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match service_from_inspect(&inspect, &self.label_prefix) {
                Ok(service) => services.push(service),
                Err(e) => tracing::warn!("Skipping container {}: {}", name, e),
            }
        }
        Ok(services)
    }

    fn route_file(&self, service: &ServiceInfo) -> PathBuf {
        self.endpoint_dir.join(format!("{}.json", service.name))
    }
}

/// Build a service description from container metadata
fn service_from_inspect(inspect: &ContainerInspect, prefix: &str) -> Result<ServiceInfo> {
    let empty = BTreeMap::new();
    let labels = inspect.config.labels.as_ref().unwrap_or(&empty);
    let label = |key: &str| labels.get(&format!("{}{}", prefix, key)).cloned().unwrap_or_default();

    let name = inspect.name.trim_start_matches('/').to_string();
    let catalog: Catalog = label(LABEL_CATALOG).parse()?;
    let port = label(LABEL_PORT)
        .parse()
        .map_err(|_| Error::Driver(format!("container {} has no valid port label", name)))?;

    let healthy = inspect
        .state
        .health
        .as_ref()
        .map(|h| h.status == "healthy")
        .unwrap_or(true);

    Ok(ServiceInfo {
        name,
        catalog,
        image: inspect.config.image.clone(),
        labels: labels.clone(),
        volumes: Volumes {
            conf_path: label(LABEL_CONF_PATH).into(),
            data_path: label(LABEL_DATA_PATH).into(),
            back_path: label(LABEL_BACK_PATH).into(),
        },
        credentials: Credentials {
            root: label(LABEL_ROOT),
            password: label(LABEL_PASSWORD),
        },
        endpoint: Endpoint {
            host: label(LABEL_HOST),
            port,
        },
        available: inspect.state.running && healthy,
    })
}

/// Compare a previous listing with the current one
fn diff_services(
    cache: &HashMap<String, ServiceInfo>,
    current: &HashMap<String, ServiceInfo>,
) -> Vec<ServiceEvent> {
    let mut events = Vec::new();

    for (name, service) in current {
        match cache.get(name) {
            None => events.push(ServiceEvent::Added(service.clone())),
            Some(previous) if previous != service => {
                events.push(ServiceEvent::Modified(service.clone()))
            }
            Some(_) => {}
        }
    }

    for (name, service) in cache {
        if !current.contains_key(name) {
            events.push(ServiceEvent::Removed(service.clone()));
        }
    }

    events
}

#[async_trait::async_trait]
impl ComputeDriver for DockerDriver {
    async fn create_service(&self, service: &ServiceInfo) -> Result<()> {
        for dir in [
            &service.volumes.conf_path,
            &service.volumes.data_path,
            &service.volumes.back_path,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            service.name.clone(),
            "--restart".into(),
            "unless-stopped".into(),
        ];

        let labels = [
            (LABEL_CATALOG, service.catalog.to_string()),
            (LABEL_HOST, service.endpoint.host.clone()),
            (LABEL_PORT, service.endpoint.port.to_string()),
            (LABEL_ROOT, service.credentials.root.clone()),
            (LABEL_PASSWORD, service.credentials.password.clone()),
            (LABEL_CONF_PATH, service.volumes.conf_path.display().to_string()),
            (LABEL_DATA_PATH, service.volumes.data_path.display().to_string()),
            (LABEL_BACK_PATH, service.volumes.back_path.display().to_string()),
        ];
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{}={}", self.label(key), value));
        }

        args.extend([
            "-e".into(),
            format!("MARIADB_ROOT_PASSWORD={}", service.credentials.password),
            "-p".into(),
            format!("{}:{}", service.endpoint.port, self.mounts.port),
            "-v".into(),
            format!("{}:{}", service.volumes.conf_path.display(), self.mounts.conf),
            "-v".into(),
            format!("{}:{}", service.volumes.data_path.display(), self.mounts.data),
            "-v".into(),
            format!("{}:{}", service.volumes.back_path.display(), self.mounts.backup),
            service.image.clone(),
        ]);

        self.docker(&args, self.job_timeout).await?;
        tracing::info!("Created service {}", service);
        Ok(())
    }

    async fn destroy_service(&self, service: &ServiceInfo) -> Result<()> {
        self.docker(&["rm", "-f", service.name.as_str()], self.exec_timeout)
            .await?;
        let _ = self.restore_endpoint(service).await;
        tracing::info!("Destroyed service {}", service);
        Ok(())
    }

    async fn start_service(&self, service: &ServiceInfo) -> Result<()> {
        self.docker(&["start", service.name.as_str()], self.exec_timeout)
            .await?;
        Ok(())
    }

    async fn stop_service(&self, service: &ServiceInfo) -> Result<()> {
        self.docker(&["stop", service.name.as_str()], self.exec_timeout)
            .await?;
        Ok(())
    }

    async fn exec_command(&self, service: &ServiceInfo, argv: &[String]) -> Result<Vec<u8>> {
        let mut args = vec!["exec".to_string(), service.name.clone()];
        args.extend(argv.iter().cloned());
        self.docker(&args, self.exec_timeout).await
    }

    async fn run_job(&self, service: &ServiceInfo, job_name: &str, commands: &[String]) -> Result<()> {
        // A job left behind by a crashed run would block the name
        let _ = self.docker(&["rm", "-f", job_name], self.exec_timeout).await;

        let script = commands.join(" && ");
        tracing::info!("Running job {} for {}: {}", job_name, service, script);

        let args = [
            "run",
            "--rm",
            "--name",
            job_name,
            "--network",
            "host",
            "--volumes-from",
            service.name.as_str(),
            "--entrypoint",
            "sh",
            service.image.as_str(),
            "-c",
            script.as_str(),
        ];
        self.docker(&args, self.job_timeout).await?;

        tracing::info!("Job {} finished", job_name);
        Ok(())
    }

    async fn list_services(&self, catalog: Catalog) -> Result<Vec<ServiceInfo>> {
        self.services(Some(catalog)).await
    }

    async fn query_service(&self, name: &str, catalog: Catalog) -> Result<ServiceInfo> {
        let inspect = self.inspect(name).await?;
        let service = service_from_inspect(&inspect, &self.label_prefix)?;
        if service.catalog != catalog {
            return Err(Error::ServiceNotFound(format!("{}:{}", catalog, name)));
        }
        Ok(service)
    }

    async fn change_endpoint(&self, service: &ServiceInfo, target: &Endpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.endpoint_dir).await?;

        let route = RouteOverride {
            host: target.host.clone(),
            port: target.port,
        };
        let path = self.route_file(service);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&route)?)
            .await
            .map_err(|e| Error::Driver(format!("failed to write {}: {}", path.display(), e)))?;

        tracing::info!("Routed {} to {}", service, target);
        Ok(())
    }

    async fn restore_endpoint(&self, service: &ServiceInfo) -> Result<()> {
        let path = self.route_file(service);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Restored route of {}", service);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Driver(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn watch(&self, sender: mpsc::Sender<ServiceEvent>) -> Result<()> {
        let mut cache: HashMap<String, ServiceInfo> = HashMap::new();
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            let current = match self.services(None).await {
                Ok(services) => services
                    .into_iter()
                    .map(|s| (s.name.clone(), s))
                    .collect::<HashMap<_, _>>(),
                Err(e) => {
                    tracing::warn!("Failed to list containers: {}", e);
                    continue;
                }
            };

            for event in diff_services(&cache, &current) {
                tracing::debug!("Service {} {}", event.service(), event.type_name());
                if sender.send(event).await.is_err() {
                    return Ok(());
                }
            }

            cache = current;
        }
    }
}
