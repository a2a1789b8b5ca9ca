use crate::alert::{AlertLevel, RuleAlertEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Production,
    Test,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Destination::Production => "production",
            Destination::Test => "test",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A test scan never reaches production, whatever the alert's own level.
pub fn route(level: AlertLevel, scan_test: bool) -> Destination {
    if scan_test || level == AlertLevel::Test {
        Destination::Test
    } else {
        Destination::Production
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write alert: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Rejected(String),
}

pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, alert: &RuleAlertEvent) -> Result<(), SinkError>;
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    name: String,
    alerts: Mutex<Vec<RuleAlertEvent>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<RuleAlertEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RuleAlertEvent>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, alert: &RuleAlertEvent) -> Result<(), SinkError> {
        self.lock().push(alert.clone());
        Ok(())
    }
}

/// Writes one JSON document per alert, newline separated.
pub struct JsonLinesSink<W: Write + Send> {
    name: String,
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> AlertSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, alert: &RuleAlertEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Outcome of routing one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub rule: String,
    /// `None` when the alert did not fire and nothing was sent.
    pub destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchRecord {
    pub fn delivered(&self) -> bool {
        self.destination.is_some() && self.error.is_none()
    }
}

#[derive(Clone)]
pub struct AlertRouter {
    production: Arc<dyn AlertSink>,
    test: Arc<dyn AlertSink>,
}

impl AlertRouter {
    pub fn new(production: Arc<dyn AlertSink>, test: Arc<dyn AlertSink>) -> Self {
        Self { production, test }
    }

    /// Sends the alert to exactly one sink. Sink failures are reported on the
    /// record and logged; they are not retried.
    pub fn dispatch(&self, alert: &RuleAlertEvent, scan_test: bool) -> DispatchRecord {
        let rule = alert.rule.clone();
        if !alert.event.alert {
            debug!(scan_id = %alert.scan_id, rule = %rule, "rule did not fire; nothing dispatched");
            return DispatchRecord {
                rule,
                destination: None,
                error: None,
            };
        }

        let destination = route(alert.event.level, scan_test);
        let sink = match destination {
            Destination::Production => &self.production,
            Destination::Test => &self.test,
        };
        let error = match sink.send(alert) {
            Ok(()) => {
                info!(scan_id = %alert.scan_id, rule = %rule, destination = %destination, sink = sink.name(), "alert dispatched");
                None
            }
            Err(err) => {
                warn!(scan_id = %alert.scan_id, rule = %rule, destination = %destination, sink = sink.name(), error = %err, "alert sink failed");
                Some(err.to_string())
            }
        };
        DispatchRecord {
            rule,
            destination: Some(destination),
            error,
        }
    }
}
