use crate::alert::AlertLevel;
use crate::validation::{validate_config, Diagnostic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_RECENT_EVENT_CAPACITY: usize = 128;
pub const DEFAULT_MAX_THIRD_PARTY_ORIGINS: usize = 5;
pub const DEFAULT_RETAINED_SCANS: usize = 1024;
pub const DEFAULT_CONSOLE_ERROR_PATTERN: &str =
    r"(?i)\b(uncaught|exception|error|failed|refused|denied)\b";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of recent events each scan context keeps as rule evidence.
    pub recent_event_capacity: usize,
    /// Console messages matching any of these patterns are recorded at
    /// `error` level instead of `warning`.
    pub console_error_patterns: Vec<String>,
    pub retain_content: bool,
    /// How many finished scans keep their lifecycle record and summary.
    /// The oldest are forgotten first.
    pub retained_scans: usize,
    pub rules: RuleSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recent_event_capacity: DEFAULT_RECENT_EVENT_CAPACITY,
            console_error_patterns: vec![DEFAULT_CONSOLE_ERROR_PATTERN.to_string()],
            retain_content: false,
            retained_scans: DEFAULT_RETAINED_SCANS,
            rules: RuleSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub blocked_script_digests: BTreeSet<String>,
    pub blocked_domains: Vec<String>,
    pub watched_functions: Vec<String>,
    pub max_third_party_origins: usize,
    /// Per-rule routing override; rules not listed alert at `prod`.
    pub levels: BTreeMap<String, AlertLevel>,
    pub disabled: BTreeSet<String>,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            blocked_script_digests: BTreeSet::new(),
            blocked_domains: Vec::new(),
            watched_functions: ["eval", "Function", "document.write", "atob"]
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            max_third_party_origins: DEFAULT_MAX_THIRD_PARTY_ORIGINS,
            levels: BTreeMap::new(),
            disabled: BTreeSet::new(),
        }
    }
}

impl RuleSettings {
    pub fn level_for(&self, rule: &str) -> AlertLevel {
        self.levels.get(rule).copied().unwrap_or_default()
    }

    pub fn is_enabled(&self, rule: &str) -> bool {
        !self.disabled.contains(rule)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid console error pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl PipelineConfig {
    /// Runs every check and fails on the first error-level diagnostic set.
    /// Warnings are returned so callers can surface them.
    pub fn validate(&self) -> Result<Vec<Diagnostic>, ConfigError> {
        let diagnostics = validate_config(self);
        let errors: Vec<String> = diagnostics
            .iter()
            .filter(|diag| diag.is_error())
            .map(Diagnostic::to_string)
            .collect();
        if errors.is_empty() {
            Ok(diagnostics)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn compile_console_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.console_error_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"rules": {"blocked_domains": ["evil.test"], "levels": {"insecure-cookie": "test"}}}"#,
        )
        .expect("parse partial config");
        assert_eq!(config.recent_event_capacity, DEFAULT_RECENT_EVENT_CAPACITY);
        assert_eq!(config.rules.max_third_party_origins, DEFAULT_MAX_THIRD_PARTY_ORIGINS);
        assert_eq!(config.rules.level_for("insecure-cookie"), AlertLevel::Test);
        assert_eq!(config.rules.level_for("blocked-domain-request"), AlertLevel::Prod);
        assert!(config.rules.watched_functions.iter().any(|f| f == "eval"));
    }

    #[test]
    fn default_patterns_compile_and_match() {
        let patterns = PipelineConfig::default()
            .compile_console_patterns()
            .expect("default patterns compile");
        assert!(patterns[0].is_match("Uncaught TypeError: x is undefined"));
        assert!(!patterns[0].is_match("hello world"));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let config = PipelineConfig {
            recent_event_capacity: 0,
            ..PipelineConfig::default()
        };
        let err = config.validate().expect_err("zero capacity must be rejected");
        assert!(err.to_string().contains("recent_event_capacity"));
    }
}
