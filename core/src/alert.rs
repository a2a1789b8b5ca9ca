use crate::event::{now_rfc3339, EventLevel, EventPayload, EventResult, ScanEventType, ScanId};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Routing destination of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Prod,
    Test,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Prod => "prod",
            AlertLevel::Test => "test",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAlert {
    pub alert: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub level: AlertLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    /// Evidence captured when the rule fired. Owned copies, never references
    /// into live scan state.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl RuleAlert {
    pub fn has_evidence(&self) -> bool {
        !self.context.is_empty()
    }

    pub fn severity(&self) -> EventLevel {
        if self.error.unwrap_or(false) {
            EventLevel::Error
        } else if self.alert {
            EventLevel::Warning
        } else {
            EventLevel::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAlertEvent {
    #[serde(deserialize_with = "rule_alert_entry")]
    entry: ScanEventType,
    pub rule: String,
    pub scan_id: ScanId,
    pub level: EventLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<bool>,
    pub created_at: String,
    pub event: RuleAlert,
}

impl RuleAlertEvent {
    pub fn new(scan_id: ScanId, test: bool, alert: RuleAlert) -> Self {
        Self {
            entry: ScanEventType::RuleAlert,
            rule: alert.name.clone(),
            scan_id,
            level: alert.severity(),
            test: test.then_some(true),
            created_at: now_rfc3339(),
            event: alert,
        }
    }

    /// Always `rule-alert`.
    pub fn entry(&self) -> ScanEventType {
        self.entry
    }

    pub fn to_event_result(&self) -> EventResult {
        EventResult {
            scan_id: self.scan_id.clone(),
            level: self.level,
            test: self.test,
            created_at: self.created_at.clone(),
            payload: EventPayload::RuleAlert(self.event.clone()),
        }
    }
}

fn rule_alert_entry<'de, D>(deserializer: D) -> Result<ScanEventType, D::Error>
where
    D: Deserializer<'de>,
{
    let entry = ScanEventType::deserialize(deserializer)?;
    if entry == ScanEventType::RuleAlert {
        Ok(entry)
    } else {
        Err(de::Error::custom(format!(
            "alert event entry must be 'rule-alert', found '{entry}'"
        )))
    }
}
