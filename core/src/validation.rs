use crate::config::PipelineConfig;
use crate::rules::is_builtin_rule;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

pub fn validate_config(config: &PipelineConfig) -> Vec<Diagnostic> {
    let mut ctx = ValidationContext::new();

    ctx.push("recent_event_capacity".to_string());
    if config.recent_event_capacity == 0 {
        ctx.error("ring buffer capacity must be at least 1");
    }
    ctx.pop();

    ctx.push("retained_scans".to_string());
    if config.retained_scans == 0 {
        ctx.error("at least one finished scan must be retained");
    }
    ctx.pop();

    ctx.push("console_error_patterns".to_string());
    validate_patterns(&config.console_error_patterns, &mut ctx);
    ctx.pop();

    ctx.push("rules".to_string());
    validate_rules(config, &mut ctx);
    ctx.pop();

    ctx.finish()
}

struct ValidationContext {
    stack: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn push(&mut self, label: String) {
        self.stack.push(label);
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn location(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(self.stack.join(" > "))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::error(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn warning(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::warning(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

fn validate_patterns(patterns: &[String], ctx: &mut ValidationContext) {
    if patterns.is_empty() {
        ctx.warning("no patterns configured; console messages will always be warnings");
    }
    for pattern in patterns {
        if pattern.trim().is_empty() {
            ctx.error("pattern cannot be empty");
            continue;
        }
        if let Err(err) = Regex::new(pattern) {
            ctx.error(format!("pattern '{}' does not compile: {err}", pattern));
        }
    }
}

fn validate_rules(config: &PipelineConfig, ctx: &mut ValidationContext) {
    let rules = &config.rules;

    ctx.push("blocked_script_digests".to_string());
    for digest in &rules.blocked_script_digests {
        let trimmed = digest.trim();
        if trimmed.is_empty() {
            ctx.error("digest cannot be empty");
        } else if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            ctx.warning(format!(
                "'{}' is not a 64 character sha256 hex digest; it will only match identical strings",
                digest
            ));
        }
    }
    ctx.pop();

    ctx.push("blocked_domains".to_string());
    let mut seen = HashSet::new();
    for domain in &rules.blocked_domains {
        let trimmed = domain.trim().trim_start_matches('.');
        if trimmed.is_empty() {
            ctx.error("domain cannot be empty");
            continue;
        }
        if trimmed.contains('/') || trimmed.contains(':') {
            ctx.error(format!("'{}' must be a bare host name, not a URL", domain));
        }
        if !seen.insert(trimmed.to_ascii_lowercase()) {
            ctx.warning(format!("domain '{}' is listed more than once", domain));
        }
    }
    ctx.pop();

    if rules.max_third_party_origins == 0 {
        ctx.push("max_third_party_origins".to_string());
        ctx.warning("threshold 0 alerts on the first third-party script origin");
        ctx.pop();
    }

    ctx.push("levels".to_string());
    for name in rules.levels.keys() {
        if !is_builtin_rule(name) {
            ctx.error(format!("unknown rule '{}'", name));
        } else if !rules.is_enabled(name) {
            ctx.warning(format!("rule '{}' is disabled; its level override is unused", name));
        }
    }
    ctx.pop();

    ctx.push("disabled".to_string());
    for name in &rules.disabled {
        if !is_builtin_rule(name) {
            ctx.error(format!("unknown rule '{}'", name));
        }
    }
    ctx.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertLevel;

    #[test]
    fn default_config_is_clean() {
        let diagnostics = validate_config(&PipelineConfig::default());
        assert!(diagnostics.is_empty(), "unexpected: {diagnostics:?}");
    }

    #[test]
    fn reports_locations_for_nested_errors() {
        let mut config = PipelineConfig::default();
        config.console_error_patterns = vec!["(unclosed".to_string()];
        config.rules.blocked_domains = vec!["https://evil.test/".to_string()];
        config.rules.disabled.insert("no-such-rule".to_string());

        let diagnostics = validate_config(&config);
        let errors: Vec<String> = diagnostics
            .iter()
            .filter(|d| d.is_error())
            .map(|d| d.to_string())
            .collect();

        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors[0].starts_with("console_error_patterns:"));
        assert!(errors[1].starts_with("rules > blocked_domains:"));
        assert!(errors[2].starts_with("rules > disabled:"));
    }

    #[test]
    fn zero_retention_is_an_error() {
        let mut config = PipelineConfig::default();
        config.retained_scans = 0;
        let diagnostics = validate_config(&config);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_error());
        assert!(diagnostics[0].to_string().starts_with("retained_scans"));
    }

    #[test]
    fn short_digests_and_unused_levels_are_warnings() {
        let mut config = PipelineConfig::default();
        config.rules.blocked_script_digests.insert("abc123".to_string());
        config
            .rules
            .levels
            .insert("insecure-cookie".to_string(), AlertLevel::Test);
        config.rules.disabled.insert("insecure-cookie".to_string());

        let diagnostics = validate_config(&config);
        assert!(diagnostics.iter().all(|d| !d.is_error()), "{diagnostics:?}");
        assert_eq!(diagnostics.len(), 2);
    }
}
