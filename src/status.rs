//! Replication Status
//!
//! Structured records of a MariaDB node's master and slave state, and the
//! parsers turning `SHOW MASTER STATUS\G` / `SHOW SLAVE STATUS\G` reports
//! and backup binlog markers into them.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::service::Endpoint;

static LOG_FILE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"File:\s*(\S+)").unwrap());
static LOG_POS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Position:\s*(\S+)").unwrap());

static IO_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Slave_IO_State:\s*(\S+)").unwrap());
static MASTER_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Master_Host:\s*(\S+)").unwrap());
static MASTER_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Master_Port:\s*(\S+)").unwrap());
static IO_RUNNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Slave_IO_Running:\s*(\S+)").unwrap());
static SQL_RUNNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Slave_SQL_Running:\s*(\S+)").unwrap());
static BEHIND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Seconds_Behind_Master:\s*(\S+)").unwrap());

/// Master side of a node's replication state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterStatus {
    #[serde(rename = "enable")]
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub log_file: String,
    pub log_pos: u64,
    /// UTC epoch milliseconds
    #[serde(rename = "timeStamp")]
    pub timestamp: i64,
}

impl MasterStatus {
    /// Coordinates a slave should follow
    pub fn coordinates(&self) -> MasterCoordinates {
        MasterCoordinates {
            host: self.host.clone(),
            port: self.port,
            log_file: self.log_file.clone(),
            log_pos: self.log_pos,
        }
    }
}

/// Slave side of a node's replication state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatus {
    #[serde(rename = "enable")]
    pub enabled: bool,
    pub master_host: String,
    pub master_port: u16,
    #[serde(rename = "runningOK")]
    pub running_ok: bool,
    #[serde(rename = "behindSecond")]
    pub behind_seconds: u64,
    /// UTC epoch milliseconds
    #[serde(rename = "timeStamp")]
    pub timestamp: i64,
}

impl SlaveStatus {
    /// Whether this slave currently replicates from the given endpoint
    pub fn follows(&self, host: &str, port: u16) -> bool {
        self.enabled && self.master_host == host && self.master_port == port
    }
}

/// Replication target handed to `CHANGE MASTER TO`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterCoordinates {
    pub host: String,
    pub port: u16,
    pub log_file: String,
    pub log_pos: u64,
}

impl std::fmt::Display for MasterCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host:{}, Port:{}, LogFile:{}, LogPos:{}",
            self.host, self.port, self.log_file, self.log_pos
        )
    }
}

/// Both halves of a node's status, as served to the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReport {
    #[serde(default)]
    pub master_status: Option<MasterStatus>,
    #[serde(default)]
    pub slave_status: Option<SlaveStatus>,
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parse a `SHOW MASTER STATUS\G` report.
///
/// The host and port are those of the probed service.
pub fn parse_master_status(output: &str, endpoint: &Endpoint, now: DateTime<Utc>) -> MasterStatus {
    let mut status = MasterStatus {
        host: endpoint.host.clone(),
        port: endpoint.port,
        timestamp: now.timestamp_millis(),
        ..Default::default()
    };

    for line in output.lines() {
        if let Some(file) = capture(&LOG_FILE_RE, line) {
            status.enabled = true;
            status.log_file = file.to_string();
            continue;
        }

        if let Some(pos) = capture(&LOG_POS_RE, line) {
            if let Ok(pos) = pos.parse() {
                status.log_pos = pos;
            }
        }
    }

    status
}

/// Parse a `SHOW SLAVE STATUS\G` report.
///
/// A report without an IO state yields a disabled record with every other
/// field zeroed.
pub fn parse_slave_status(output: &str, now: DateTime<Utc>) -> SlaveStatus {
    let mut enabled = false;
    let mut master_host = String::new();
    let mut master_port = "";
    let mut io_running = String::new();
    let mut sql_running = String::new();
    let mut behind = "";

    for line in output.lines() {
        if capture(&IO_STATE_RE, line).is_some() {
            enabled = true;
        } else if let Some(host) = capture(&MASTER_HOST_RE, line) {
            master_host = host.to_lowercase();
        } else if let Some(port) = capture(&MASTER_PORT_RE, line) {
            master_port = port;
        } else if let Some(flag) = capture(&IO_RUNNING_RE, line) {
            io_running = flag.to_lowercase();
        } else if let Some(flag) = capture(&SQL_RUNNING_RE, line) {
            sql_running = flag.to_lowercase();
        } else if let Some(value) = capture(&BEHIND_RE, line) {
            behind = value;
        }
    }

    let mut status = SlaveStatus {
        enabled,
        timestamp: now.timestamp_millis(),
        ..Default::default()
    };

    if !enabled {
        return status;
    }

    status.master_host = master_host;
    status.master_port = master_port.parse().unwrap_or(0);
    status.running_ok = io_running == "yes" && sql_running == "yes";
    // NULL while the IO thread is disconnected
    status.behind_seconds = behind.parse().unwrap_or(0);
    status
}

/// Parse the binlog coordinates file written by `mariabackup`.
///
/// Only the first line is read; it must hold exactly three tab-separated
/// fields: file, position and GTID.
pub fn parse_binlog_marker(content: &str) -> Result<(String, u64)> {
    let line = content
        .lines()
        .next()
        .ok_or_else(|| Error::CorruptBinlogMarker("binlog marker is empty".into()))?;

    let items: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
    if items.len() != 3 {
        return Err(Error::CorruptBinlogMarker(format!(
            "expected 3 fields, found {}: {:?}",
            items.len(),
            items
        )));
    }

    let log_pos = items[1].parse::<u64>().map_err(|_| {
        Error::CorruptBinlogMarker(format!("invalid binlog position '{}'", items[1]))
    })?;

    Ok((items[0].to_string(), log_pos))
}

/// Whether a node must copy the peer's full dataset before following it.
///
/// Binlog-only catch-up is trusted while the last persisted master record
/// is younger than `window`.
pub fn needs_full_resync(
    record: Option<&MasterStatus>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> bool {
    match record {
        Some(record) => now.timestamp_millis() - record.timestamp >= window.num_milliseconds(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const MASTER_REPORT: &str = "*************************** 1. row ***************************
            File: mysql-bin.000007
        Position: 154
    Binlog_Do_DB:
Binlog_Ignore_DB:
";

    const SLAVE_REPORT: &str = "*************************** 1. row ***************************
                Slave_IO_State: Waiting for master to send event
                   Master_Host: DB-Node-2
                   Master_User: root
                   Master_Port: 3306
                 Connect_Retry: 60
               Master_Log_File: mysql-bin.000007
           Read_Master_Log_Pos: 154
              Slave_IO_Running: Yes
             Slave_SQL_Running: Yes
         Seconds_Behind_Master: 5
       Slave_SQL_Running_State: Slave has read all relay log
";

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "10.0.0.1".into(),
            port: 3306,
        }
    }

    #[test]
    fn test_parse_master_status() {
        let now = Utc::now();
        let status = parse_master_status(MASTER_REPORT, &endpoint(), now);
        assert!(status.enabled);
        assert_eq!(status.log_file, "mysql-bin.000007");
        assert_eq!(status.log_pos, 154);
        assert_eq!(status.host, "10.0.0.1");
        assert_eq!(status.timestamp, now.timestamp_millis());
    }

    #[test]
    fn test_parse_master_status_binlog_disabled() {
        let status = parse_master_status("", &endpoint(), Utc::now());
        assert!(!status.enabled);
        assert!(status.log_file.is_empty());
        assert_eq!(status.log_pos, 0);
    }

    #[test]
    fn test_parse_slave_status() {
        let status = parse_slave_status(SLAVE_REPORT, Utc::now());
        assert!(status.enabled);
        assert_eq!(status.master_host, "db-node-2");
        assert_eq!(status.master_port, 3306);
        assert!(status.running_ok);
        assert_eq!(status.behind_seconds, 5);
        assert!(status.follows("db-node-2", 3306));
    }

    #[test]
    fn test_parse_slave_status_not_running() {
        let report = SLAVE_REPORT
            .replace("Slave_SQL_Running: Yes", "Slave_SQL_Running: No")
            .replace("Seconds_Behind_Master: 5", "Seconds_Behind_Master: NULL");
        let status = parse_slave_status(&report, Utc::now());
        assert!(status.enabled);
        assert!(!status.running_ok);
        assert_eq!(status.behind_seconds, 0);
    }

    #[test]
    fn test_parse_slave_status_no_io_state() {
        let report = "Master_Host: 10.0.0.2\nMaster_Port: 3306\nSeconds_Behind_Master: 9\n";
        let status = parse_slave_status(report, Utc::now());
        assert!(!status.enabled);
        assert!(status.master_host.is_empty());
        assert_eq!(status.master_port, 0);
        assert_eq!(status.behind_seconds, 0);
    }

    #[test]
    fn test_parse_binlog_marker() {
        let (file, pos) = parse_binlog_marker("mysql-bin.000007\t154\tsomeuuid").unwrap();
        assert_eq!(file, "mysql-bin.000007");
        assert_eq!(pos, 154);

        let (file, pos) = parse_binlog_marker("mysql-bin.000002\t325\t0-1-42\n").unwrap();
        assert_eq!(file, "mysql-bin.000002");
        assert_eq!(pos, 325);
    }

    #[test]
    fn test_parse_binlog_marker_corrupt() {
        assert!(matches!(
            parse_binlog_marker("mysql-bin.000007\t154"),
            Err(Error::CorruptBinlogMarker(_))
        ));
        assert!(matches!(parse_binlog_marker(""), Err(Error::CorruptBinlogMarker(_))));
        assert!(matches!(
            parse_binlog_marker("mysql-bin.000007\tabc\tuuid"),
            Err(Error::CorruptBinlogMarker(_))
        ));
    }

    #[test]
    fn test_needs_full_resync() {
        let now = Utc::now();
        let window = Duration::hours(72);
        let record = |age: Duration| MasterStatus {
            enabled: true,
            timestamp: (now - age).timestamp_millis(),
            ..Default::default()
        };

        assert!(!needs_full_resync(Some(&record(Duration::hours(47))), now, window));
        assert!(needs_full_resync(Some(&record(Duration::hours(73))), now, window));
        assert!(needs_full_resync(None, now, window));
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"masterStatus":{"enable":true,"host":"10.0.0.2","port":3306,"logFile":"mysql-bin.000003","logPos":42,"timeStamp":1700000000000},"slaveStatus":{"enable":false,"masterHost":"","masterPort":0,"runningOK":false,"behindSecond":0,"timeStamp":1700000000000}}"#;
        let report: ReplicationReport = serde_json::from_str(json).unwrap();
        let master = report.master_status.unwrap();
        assert!(master.enabled);
        assert_eq!(master.coordinates().to_string(), "Host:10.0.0.2, Port:3306, LogFile:mysql-bin.000003, LogPos:42");
        assert!(!report.slave_status.unwrap().enabled);
    }
}
