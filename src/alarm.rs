//! Alarms
//!
//! Fire-and-forget operator notifications. The agent raises one when the
//! local services stay unhealthy for several consecutive ticks.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AlarmConfig;
use crate::error::{Error, Result};

/// Alarm payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmInfo {
    pub title: String,
    pub content: String,
}

/// Alarm delivery
#[async_trait::async_trait]
pub trait AlarmSender: Send + Sync {
    async fn send(&self, alarm: &AlarmInfo) -> Result<()>;
}

/// Writes alarms to the log only
pub struct LogAlarm;

#[async_trait::async_trait]
impl AlarmSender for LogAlarm {
    async fn send(&self, alarm: &AlarmInfo) -> Result<()> {
        tracing::error!("ALARM {}: {}", alarm.title, alarm.content);
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookMessage<'a> {
    to_job_nos: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    body: &'a AlarmInfo,
}

/// Posts alarms to a messaging webhook with basic auth
pub struct WebhookAlarm {
    client: reqwest::Client,
    url: String,
    account: String,
    password: String,
    receiver: String,
}

impl WebhookAlarm {
    pub fn new(url: &str, config: &AlarmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Alarm(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            account: config.account.clone(),
            password: config.password.clone(),
            receiver: config.receiver.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AlarmSender for WebhookAlarm {
    async fn send(&self, alarm: &AlarmInfo) -> Result<()> {
        let message = WebhookMessage {
            to_job_nos: &self.receiver,
            kind: "oa",
            body: alarm,
        };

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.account, Some(&self.password))
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::Alarm(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Alarm(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }
}

/// Build the sender configured for this agent
pub fn sender_from_config(config: &AlarmConfig) -> Result<Arc<dyn AlarmSender>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookAlarm::new(url, config)?)),
        None => Ok(Arc::new(LogAlarm)),
    }
}

/// Non-blocking front of an [`AlarmSender`]
#[derive(Clone)]
pub struct AlarmNotifier {
    tx: mpsc::Sender<AlarmInfo>,
}

impl AlarmNotifier {
    /// Start the delivery task
    pub fn spawn(sender: Arc<dyn AlarmSender>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AlarmInfo>(64);

        let handle = tokio::spawn(async move {
            while let Some(alarm) = rx.recv().await {
                if let Err(e) = sender.send(&alarm).await {
                    tracing::error!("Failed to deliver alarm '{}': {}", alarm.title, e);
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Queue an alarm; never blocks or fails the caller
    pub fn notify(&self, title: impl Into<String>, content: impl Into<String>) {
        let alarm = AlarmInfo {
            title: title.into(),
            content: content.into(),
        };
        if let Err(e) = self.tx.try_send(alarm) {
            tracing::warn!("Alarm dropped: {}", e);
        }
    }
}

/// Raises one alarm per run of consecutive unhealthy observations
pub struct HealthWatch {
    threshold: u32,
    failures: u32,
    raised: bool,
}

impl HealthWatch {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
            raised: false,
        }
    }

    /// Record one health observation; returns the alarm to raise, if any
    pub fn observe(&mut self, node: &str, healthy: bool) -> Option<AlarmInfo> {
        if healthy {
            if self.raised {
                tracing::info!("Services on {} are healthy again", node);
            }
            self.failures = 0;
            self.raised = false;
            return None;
        }

        self.failures += 1;
        if self.raised || self.failures < self.threshold {
            return None;
        }

        self.raised = true;
        Some(AlarmInfo {
            title: format!("Database services unhealthy on {}", node),
            content: format!(
                "Services on {} have been unavailable for {} consecutive checks",
                node, self.failures
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        alarms: Mutex<Vec<AlarmInfo>>,
    }

    #[async_trait::async_trait]
    impl AlarmSender for Recorder {
        async fn send(&self, alarm: &AlarmInfo) -> Result<()> {
            self.alarms.lock().unwrap().push(alarm.clone());
            Ok(())
        }
    }

    #[test]
    fn test_health_watch_threshold() {
        let mut watch = HealthWatch::new(3);
        assert!(watch.observe("10.0.0.1", false).is_none());
        assert!(watch.observe("10.0.0.1", false).is_none());
        let alarm = watch.observe("10.0.0.1", false).unwrap();
        assert!(alarm.content.contains("3 consecutive"));

        // Raised once per outage
        assert!(watch.observe("10.0.0.1", false).is_none());

        assert!(watch.observe("10.0.0.1", true).is_none());
        assert!(watch.observe("10.0.0.1", false).is_none());
        assert!(watch.observe("10.0.0.1", false).is_none());
        assert!(watch.observe("10.0.0.1", false).is_some());
    }

    #[test]
    fn test_webhook_message_format() {
        let alarm = AlarmInfo {
            title: "t".into(),
            content: "c".into(),
        };
        let message = WebhookMessage {
            to_job_nos: "20070111",
            kind: "oa",
            body: &alarm,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            serde_json::json!({"toJobNos": "20070111", "type": "oa", "body": {"title": "t", "content": "c"}})
        );
    }

    #[tokio::test]
    async fn test_notifier_delivers() {
        let recorder = Arc::new(Recorder::default());
        let (notifier, handle) = AlarmNotifier::spawn(recorder.clone());

        notifier.notify("title", "content");
        drop(notifier);
        handle.await.unwrap();

        let alarms = recorder.alarms.lock().unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].title, "title");
    }
}
