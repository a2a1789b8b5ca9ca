//! Rule evaluation over normalized events and per-scan context.
//!
//! Rules are isolated from each other: an error or a panic inside one rule
//! becomes an `error` event for the scan and never stops the others.

use crate::alert::{AlertLevel, RuleAlert};
use crate::config::RuleSettings;
use crate::context::ScanContext;
use crate::event::{EventResult, ScanEventType};
use crate::rules::builtin_rules;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// When a rule is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTrigger {
    /// After every normalized event is folded into the context.
    Incremental,
    /// Once, when the scan reaches a terminal state.
    Terminal,
}

/// How often one rule may alert within a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatPolicy {
    Once,
    PerKey,
}

/// One positive finding from a rule. `key` identifies the offending thing
/// (a digest, a URL) for `PerKey` rules.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub key: Option<String>,
    pub message: String,
    pub context: BTreeMap<String, Value>,
}

impl RuleMatch {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            key: None,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn keyed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(message)
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.context.insert(field.to_string(), value.into());
        self
    }
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn playbook(&self) -> Option<&'static str> {
        None
    }

    fn trigger(&self) -> RuleTrigger {
        RuleTrigger::Incremental
    }

    /// Rules alert at most once per scan unless they opt into one alert
    /// per distinct match key.
    fn repeat(&self) -> RepeatPolicy {
        RepeatPolicy::Once
    }

    /// Incremental rules are only consulted for the entries they accept.
    fn applies_to(&self, _entry: ScanEventType) -> bool {
        true
    }

    /// `event` is `None` for terminal evaluation. The context already
    /// includes `event` when one is given.
    fn evaluate(
        &self,
        event: Option<&EventResult>,
        context: &ScanContext,
    ) -> anyhow::Result<Vec<RuleMatch>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("rule '{0}' is registered more than once")]
    DuplicateRule(String),
}

/// Per-scan memory of which alerts have already fired.
#[derive(Debug, Clone, Default)]
pub struct AlertLedger {
    fired: BTreeSet<(String, Option<String>)>,
    terminal_done: bool,
}

impl AlertLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fired_count(&self) -> usize {
        self.fired.len()
    }

    pub fn terminal_done(&self) -> bool {
        self.terminal_done
    }

    /// Records an alert raised outside the engine. Identical alerts (same
    /// name and evidence) are claimed once per scan.
    pub fn claim_inbound(&mut self, alert: &RuleAlert) -> bool {
        let evidence = serde_json::to_string(&alert.context).unwrap_or_default();
        self.fired
            .insert((format!("inbound:{}", alert.name), Some(evidence)))
    }

    /// Returns false when this (rule, key) pair already alerted.
    fn claim(&mut self, rule: &str, policy: RepeatPolicy, key: Option<&str>) -> bool {
        let key = match policy {
            RepeatPolicy::Once => None,
            RepeatPolicy::PerKey => key.map(str::to_string),
        };
        self.fired.insert((rule.to_string(), key))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleEvaluation {
    pub alerts: Vec<RuleAlert>,
    /// `error` events for rules that failed or panicked.
    pub failures: Vec<EventResult>,
}

impl RuleEvaluation {
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    pub trigger: RuleTrigger,
    pub repeat: RepeatPolicy,
    pub level: AlertLevel,
    pub enabled: bool,
}

impl RuleDescriptor {
    pub fn describe(rule: &dyn Rule, level: AlertLevel, enabled: bool) -> Self {
        Self {
            name: rule.name().to_string(),
            description: rule.description().to_string(),
            playbook: rule.playbook().map(str::to_string),
            trigger: rule.trigger(),
            repeat: rule.repeat(),
            level,
            enabled,
        }
    }
}

struct RegisteredRule {
    rule: Box<dyn Rule>,
    level: AlertLevel,
}

#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<RegisteredRule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every enabled built-in rule at its configured level.
    pub fn from_config(settings: &RuleSettings) -> Result<Self, EngineError> {
        let mut engine = Self::new();
        for rule in builtin_rules(settings) {
            if !settings.is_enabled(rule.name()) {
                debug!(rule = rule.name(), "rule disabled by configuration");
                continue;
            }
            let level = settings.level_for(rule.name());
            engine.register(rule, level)?;
        }
        Ok(engine)
    }

    pub fn register(&mut self, rule: Box<dyn Rule>, level: AlertLevel) -> Result<(), EngineError> {
        if self.rules.iter().any(|existing| existing.rule.name() == rule.name()) {
            return Err(EngineError::DuplicateRule(rule.name().to_string()));
        }
        self.rules.push(RegisteredRule { rule, level });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn descriptors(&self) -> Vec<RuleDescriptor> {
        self.rules
            .iter()
            .map(|registered| RuleDescriptor::describe(registered.rule.as_ref(), registered.level, true))
            .collect()
    }

    /// Runs incremental rules against one event. Alerts arriving from
    /// upstream are never re-evaluated.
    pub fn evaluate_event(
        &self,
        event: &EventResult,
        context: &ScanContext,
        ledger: &mut AlertLedger,
    ) -> RuleEvaluation {
        let entry = event.entry();
        if entry == ScanEventType::RuleAlert {
            return RuleEvaluation::default();
        }
        let mut evaluation = RuleEvaluation::default();
        for registered in self
            .rules
            .iter()
            .filter(|registered| registered.rule.trigger() == RuleTrigger::Incremental)
            .filter(|registered| registered.rule.applies_to(entry))
        {
            self.run(registered, Some(event), context, ledger, &mut evaluation);
        }
        evaluation
    }

    /// Runs terminal rules. A second call for the same ledger does nothing.
    pub fn evaluate_terminal(&self, context: &ScanContext, ledger: &mut AlertLedger) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();
        if ledger.terminal_done {
            return evaluation;
        }
        ledger.terminal_done = true;
        for registered in self
            .rules
            .iter()
            .filter(|registered| registered.rule.trigger() == RuleTrigger::Terminal)
        {
            self.run(registered, None, context, ledger, &mut evaluation);
        }
        evaluation
    }

    fn run(
        &self,
        registered: &RegisteredRule,
        event: Option<&EventResult>,
        context: &ScanContext,
        ledger: &mut AlertLedger,
        evaluation: &mut RuleEvaluation,
    ) {
        let rule = registered.rule.as_ref();
        let outcome = catch_unwind(AssertUnwindSafe(|| rule.evaluate(event, context)));
        let matches = match outcome {
            Ok(Ok(matches)) => matches,
            Ok(Err(err)) => {
                warn!(scan_id = %context.scan_id(), rule = rule.name(), error = %err, "rule evaluation failed");
                evaluation.failures.push(EventResult::general_error(
                    context.scan_id().clone(),
                    context.is_test(),
                    format!("rule '{}' failed: {err:#}", rule.name()),
                ));
                return;
            }
            Err(payload) => {
                let message = panic_message(payload);
                warn!(scan_id = %context.scan_id(), rule = rule.name(), panic = %message, "rule panicked");
                evaluation.failures.push(EventResult::general_error(
                    context.scan_id().clone(),
                    context.is_test(),
                    format!("rule '{}' panicked: {message}", rule.name()),
                ));
                return;
            }
        };

        for found in matches {
            if found.context.is_empty() {
                warn!(scan_id = %context.scan_id(), rule = rule.name(), key = ?found.key, "rule matched without evidence");
                evaluation.failures.push(EventResult::general_error(
                    context.scan_id().clone(),
                    context.is_test(),
                    format!("rule '{}' matched without evidence: {}", rule.name(), found.message),
                ));
                continue;
            }
            if !ledger.claim(rule.name(), rule.repeat(), found.key.as_deref()) {
                continue;
            }
            debug!(scan_id = %context.scan_id(), rule = rule.name(), key = ?found.key, "rule matched");
            evaluation.alerts.push(RuleAlert {
                alert: true,
                name: rule.name().to_string(),
                error: None,
                message: Some(found.message),
                level: registered.level,
                description: Some(rule.description().to_string()),
                playbook: rule.playbook().map(str::to_string),
                context: found.context,
            });
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
