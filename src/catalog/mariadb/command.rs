//! MariaDB Commands
//!
//! Statements issued through the `mysql` client inside the service, and
//! the `mariabackup` jobs used for full copies.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::MariaDbConfig;
use crate::driver::ComputeDriver;
use crate::error::{Error, Result};
use crate::service::{Credentials, ServiceInfo};
use crate::status::{parse_master_status, parse_slave_status, MasterCoordinates, MasterStatus, SlaveStatus};

const SHOW_MASTER_STATUS: &str = "SHOW MASTER STATUS\\G";
const SHOW_SLAVE_STATUS: &str = "SHOW SLAVE STATUS\\G";
const START_SLAVE: &str = "START SLAVE;";
const STOP_SLAVE: &str = "STOP SLAVE;";

fn grant_replication_sql(credentials: &Credentials) -> String {
    format!(
        "GRANT REPLICATION SLAVE ON *.* TO '{}'@'%' IDENTIFIED BY '{}';",
        credentials.root, credentials.password
    )
}

fn change_master_sql(credentials: &Credentials, master: &MasterCoordinates) -> String {
    format!(
        "CHANGE MASTER TO master_host='{}', master_port={}, master_user='{}', master_password='{}', master_log_file='{}', master_log_pos={};",
        master.host,
        master.port,
        credentials.root,
        credentials.password,
        master.log_file,
        master.log_pos
    )
}

fn mysql_argv(credentials: &Credentials, sql: &str) -> Vec<String> {
    vec![
        "mysql".to_string(),
        format!("-u{}", credentials.root),
        format!("-p{}", credentials.password),
        "-e".to_string(),
        sql.to_string(),
    ]
}

/// Executes MariaDB statements and jobs through the compute driver
pub struct MariaDbCommands {
    driver: Arc<dyn ComputeDriver>,
    backup_dir: String,
    data_dir: String,
}

impl MariaDbCommands {
    pub fn new(driver: Arc<dyn ComputeDriver>, config: &MariaDbConfig) -> Self {
        Self {
            driver,
            backup_dir: config.container_backup_dir.trim_end_matches('/').to_string(),
            data_dir: config.container_data_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Run one statement; any execution failure is a probe failure
    async fn exec(&self, service: &ServiceInfo, sql: &str) -> Result<String> {
        tracing::debug!("{}: {}", service, sql);
        let output = self
            .driver
            .exec_command(service, &mysql_argv(&service.credentials, sql))
            .await
            .map_err(|e| Error::probe(&service.name, e))?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    pub async fn grant_replication(&self, service: &ServiceInfo) -> Result<()> {
        tracing::info!("{}: granting replication to {}", service, service.credentials.root);
        self.exec(service, &grant_replication_sql(&service.credentials)).await?;
        Ok(())
    }

    pub async fn change_master(&self, service: &ServiceInfo, master: &MasterCoordinates) -> Result<()> {
        tracing::info!("{}: change master to [{}]", service, master);
        self.exec(service, &change_master_sql(&service.credentials, master)).await?;
        Ok(())
    }

    pub async fn start_slave(&self, service: &ServiceInfo) -> Result<()> {
        tracing::info!("{}: start slave", service);
        self.exec(service, START_SLAVE).await?;
        Ok(())
    }

    pub async fn stop_slave(&self, service: &ServiceInfo) -> Result<()> {
        tracing::info!("{}: stop slave", service);
        self.exec(service, STOP_SLAVE).await?;
        Ok(())
    }

    pub async fn master_status(&self, service: &ServiceInfo, now: DateTime<Utc>) -> Result<MasterStatus> {
        let output = self.exec(service, SHOW_MASTER_STATUS).await?;
        Ok(parse_master_status(&output, &service.endpoint, now))
    }

    pub async fn slave_status(&self, service: &ServiceInfo, now: DateTime<Utc>) -> Result<SlaveStatus> {
        let output = self.exec(service, SHOW_SLAVE_STATUS).await?;
        Ok(parse_slave_status(&output, now))
    }

    fn mariabackup(&self, mode: &str, service: &ServiceInfo) -> String {
        format!(
            "mariabackup {} --host={} --port={} --target-dir={} --datadir={} --user={} --password={}",
            mode,
            service.endpoint.host,
            service.endpoint.port,
            self.backup_dir,
            self.data_dir,
            service.credentials.root,
            service.credentials.password
        )
    }

    /// Full backup into the service's backup volume
    pub async fn backup(&self, service: &ServiceInfo) -> Result<()> {
        let commands = vec![
            format!("rm -rf {}/*", self.backup_dir),
            self.mariabackup("--backup", service),
            self.mariabackup("--prepare", service),
        ];
        self.driver
            .run_job(service, &format!("{}-backup", service.name), &commands)
            .await
    }

    /// Replace the data directory with the backup volume's content.
    ///
    /// The service is stopped for the copy and always started again; the
    /// job's error is returned after the restart attempt.
    pub async fn restore(&self, service: &ServiceInfo) -> Result<()> {
        self.driver.stop_service(service).await?;

        let commands = vec![
            format!("rm -rf {}/*", self.data_dir),
            self.mariabackup("--copy-back", service),
            format!("chown -R mysql:mysql {}", self.data_dir),
        ];
        let restored = self
            .driver
            .run_job(service, &format!("{}-restore", service.name), &commands)
            .await;

        if let Err(e) = self.driver.start_service(service).await {
            tracing::error!("{}: failed to start after restore: {}", service, e);
        }

        restored?;
        tracing::info!("{}: restore finished", service);
        Ok(())
    }
}
