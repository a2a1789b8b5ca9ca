//! Drives raw events through normalization, context, rules and routing.
//!
//! Each scan has its own session lock, so events of one scan are applied one
//! at a time in arrival order while different scans proceed in parallel.
//! The session map lock is never held while a session lock is acquired.

use crate::alert::RuleAlertEvent;
use crate::artifact::ScanQueueJob;
use crate::config::PipelineConfig;
use crate::context::ScanContext;
use crate::engine::{AlertLedger, RuleEngine, RuleEvaluation};
use crate::error::PipelineError;
use crate::event::{EventLevel, EventMessage, EventPayload, EventResult, RawScanEvent, ScanId};
use crate::lifecycle::{LifecycleController, ScanState, Transition};
use crate::normalize::Normalizer;
use crate::router::{AlertRouter, DispatchRecord};
use crate::store::ContentStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedAlert {
    pub alert: RuleAlertEvent,
    pub dispatch: DispatchRecord,
}

/// Everything one ingested event produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub scan_id: ScanId,
    /// The normalized event first, then alert and rule-failure events.
    pub results: Vec<EventResult>,
    pub alerts: Vec<DispatchedAlert>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    pub state: ScanState,
}

impl IngestOutcome {
    fn new(scan_id: ScanId, state: ScanState) -> Self {
        Self {
            scan_id,
            results: Vec::new(),
            alerts: Vec::new(),
            transitions: Vec::new(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: ScanId,
    pub state: ScanState,
    pub test: bool,
    pub events: u64,
    /// Events still held in the recent-event buffer when the scan closed.
    pub recent_events: usize,
    pub requests: usize,
    pub scripts: usize,
    pub files: usize,
    pub cookies: usize,
    pub workers: usize,
    pub alerts: usize,
    pub undelivered: usize,
    pub rule_failures: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.test { " (test)" } else { "" };
        writeln!(f, "Scan {} [{}]{}", self.scan_id, self.state, marker)?;
        writeln!(
            f,
            "  events: {}, requests: {}, scripts: {}, files: {}, cookies: {}, workers: {}",
            self.events, self.requests, self.scripts, self.files, self.cookies, self.workers
        )?;
        writeln!(
            f,
            "  alerts: {} ({} undelivered), rule failures: {}",
            self.alerts, self.undelivered, self.rule_failures
        )?;
        for error in &self.errors {
            writeln!(f, "  error: {}", error)?;
        }
        Ok(())
    }
}

struct ScanSession {
    context: ScanContext,
    ledger: AlertLedger,
    closed: bool,
    alerts: usize,
    undelivered: usize,
    rule_failures: usize,
}

impl ScanSession {
    fn new(context: ScanContext) -> Self {
        Self {
            context,
            ledger: AlertLedger::new(),
            closed: false,
            alerts: 0,
            undelivered: 0,
            rule_failures: 0,
        }
    }
}

type SharedSession = Arc<Mutex<ScanSession>>;

/// Summaries of finished scans, oldest evicted first.
#[derive(Default)]
struct SummaryLog {
    by_scan: HashMap<ScanId, ScanSummary>,
    order: VecDeque<ScanId>,
}

impl SummaryLog {
    fn insert(&mut self, summary: ScanSummary, retained: usize) {
        let scan_id = summary.scan_id.clone();
        if self.by_scan.insert(scan_id.clone(), summary).is_none() {
            self.order.push_back(scan_id);
        }
        while self.order.len() > retained {
            if let Some(evicted) = self.order.pop_front() {
                self.by_scan.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, scan_id: &ScanId) -> Option<ScanSummary> {
        let summary = self.by_scan.remove(scan_id)?;
        self.order.retain(|id| id != scan_id);
        Some(summary)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<ContentStore>,
    normalizer: Normalizer,
    engine: RuleEngine,
    router: AlertRouter,
    lifecycle: LifecycleController,
    sessions: Mutex<HashMap<ScanId, SharedSession>>,
    summaries: Mutex<SummaryLog>,
}

impl Pipeline {
    /// Builds a pipeline with the built-in rules configured by `config`.
    pub fn new(config: PipelineConfig, router: AlertRouter) -> Result<Self, PipelineError> {
        let engine = RuleEngine::from_config(&config.rules)?;
        Self::with_engine(config, engine, router)
    }

    pub fn with_engine(
        config: PipelineConfig,
        engine: RuleEngine,
        router: AlertRouter,
    ) -> Result<Self, PipelineError> {
        let store = Arc::new(ContentStore::with_retention(config.retain_content));
        Self::with_store(config, store, engine, router)
    }

    /// Shares an existing content store, so digests seen by another pipeline
    /// are not reported as new again.
    pub fn with_store(
        config: PipelineConfig,
        store: Arc<ContentStore>,
        engine: RuleEngine,
        router: AlertRouter,
    ) -> Result<Self, PipelineError> {
        for diagnostic in config.validate()? {
            warn!(%diagnostic, "configuration warning");
        }
        let normalizer = Normalizer::new(&config, Arc::clone(&store))?;
        let lifecycle = LifecycleController::with_retention(config.retained_scans);
        debug!(rules = engine.len(), capacity = config.recent_event_capacity, "pipeline ready");
        Ok(Self {
            config,
            store,
            normalizer,
            engine,
            router,
            lifecycle,
            sessions: Mutex::new(HashMap::new()),
            summaries: Mutex::new(SummaryLog::default()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Registers a scheduled scan in `queued` before any of its events.
    pub fn open_scan(&self, job: &ScanQueueJob) -> Result<ScanState, PipelineError> {
        if job.scan_id.is_blank() {
            return Err(PipelineError::MissingScanId);
        }
        let state = self.lifecycle.register(job);
        if state.is_terminal() {
            return Err(PipelineError::ScanClosed {
                scan_id: job.scan_id.clone(),
                state,
            });
        }
        if job.test {
            let session = self.session(&job.scan_id, true);
            lock(&session).context.mark_test();
        }
        Ok(state)
    }

    pub fn ingest(&self, raw: RawScanEvent) -> Result<IngestOutcome, PipelineError> {
        if raw.scan_id.is_blank() {
            warn!(entry = %raw.kind, "dropping event without scan id");
            return Err(PipelineError::MissingScanId);
        }
        let scan_id = raw.scan_id.clone();
        let record = self.lifecycle.ensure(&scan_id, raw.test.unwrap_or(false));
        if record.state.is_terminal() {
            return Err(self.reject_closed(&scan_id, &raw.kind, record.state));
        }

        let shared = self.session(&scan_id, record.test);
        let mut guard = lock(&shared);
        let session = &mut *guard;
        let state = self.lifecycle.state(&scan_id).unwrap_or(record.state);
        if session.closed || state.is_terminal() {
            drop(guard);
            return Err(self.reject_closed(&scan_id, &raw.kind, state));
        }
        if self.lifecycle.is_test(&scan_id) {
            session.context.mark_test();
        }
        let test = session.context.is_test();

        let normalized = self.normalizer.normalize(&raw, test, &session.context);
        let mut outcome = IngestOutcome::new(scan_id.clone(), state);

        // The first instrumentation event implies the browser is running.
        if state == ScanState::Queued && normalized.lifecycle.is_none() && normalized.violation.is_none() {
            if let Ok(Some(transition)) = self.lifecycle.transition(&scan_id, ScanState::Active, None) {
                outcome.transitions.push(transition);
            }
        }

        let result = normalized.result;
        session.context.record(&result);
        outcome.results.push(result.clone());

        if let EventPayload::RuleAlert(inbound) = &result.payload {
            if !inbound.alert || session.ledger.claim_inbound(inbound) {
                let event = RuleAlertEvent::new(scan_id.clone(), test, inbound.clone());
                self.deliver(event, session, &mut outcome);
            } else {
                debug!(scan_id = %scan_id, rule = %inbound.name, "duplicate inbound alert suppressed");
            }
        }

        let evaluation = self
            .engine
            .evaluate_event(&result, &session.context, &mut session.ledger);
        self.absorb(evaluation, session, &mut outcome);

        if let Some(signal) = normalized.lifecycle {
            match self.lifecycle.transition(&scan_id, signal.target, signal.reason) {
                Ok(Some(transition)) => outcome.transitions.push(transition),
                Ok(None) => {}
                Err(rejected) => warn!(scan_id = %scan_id, error = %rejected, "lifecycle transition rejected"),
            }
        }

        outcome.state = self.lifecycle.state(&scan_id).unwrap_or(state);
        if outcome.state.is_terminal() {
            self.finish(session, &mut outcome);
            drop(guard);
            self.release(&scan_id);
        }
        Ok(outcome)
    }

    /// Stops a scan on behalf of the external driver. Terminal rules still run
    /// once against whatever context was gathered.
    pub fn cancel(&self, scan_id: &ScanId, reason: &str) -> Result<IngestOutcome, PipelineError> {
        let state = self
            .lifecycle
            .state(scan_id)
            .ok_or_else(|| PipelineError::UnknownScan(scan_id.clone()))?;
        if state.is_terminal() {
            return Err(PipelineError::ScanClosed {
                scan_id: scan_id.clone(),
                state,
            });
        }

        let shared = self.session(scan_id, self.lifecycle.is_test(scan_id));
        let mut guard = lock(&shared);
        let session = &mut *guard;
        if session.closed {
            let state = self.lifecycle.state(scan_id).unwrap_or(state);
            return Err(PipelineError::ScanClosed {
                scan_id: scan_id.clone(),
                state,
            });
        }

        let message = format!("cancelled: {reason}");
        let mut outcome = IngestOutcome::new(scan_id.clone(), state);
        let transition = self
            .lifecycle
            .transition(scan_id, ScanState::Failed, Some(message.clone()))
            .map_err(|rejected| PipelineError::ScanClosed {
                scan_id: scan_id.clone(),
                state: rejected.state,
            })?;
        outcome.transitions.extend(transition);
        info!(scan_id = %scan_id, reason = %reason, "scan cancelled");

        let result = EventResult::new(
            scan_id.clone(),
            EventLevel::Error,
            session.context.is_test(),
            EventPayload::Failed(EventMessage::new(message)),
        );
        session.context.record(&result);
        outcome.results.push(result);
        outcome.state = ScanState::Failed;

        self.finish(session, &mut outcome);
        drop(guard);
        self.release(scan_id);
        Ok(outcome)
    }

    /// Final summary of a scan that reached a terminal state. Only the most
    /// recent `retained_scans` summaries are kept.
    pub fn summary(&self, scan_id: &ScanId) -> Option<ScanSummary> {
        lock(&self.summaries).by_scan.get(scan_id).cloned()
    }

    /// Removes a finished scan's summary and lifecycle record.
    pub fn take_summary(&self, scan_id: &ScanId) -> Option<ScanSummary> {
        let summary = lock(&self.summaries).remove(scan_id)?;
        self.lifecycle.forget(scan_id);
        Some(summary)
    }

    pub fn summaries(&self) -> Vec<ScanSummary> {
        let mut all: Vec<ScanSummary> = lock(&self.summaries).by_scan.values().cloned().collect();
        all.sort_by(|a, b| a.scan_id.cmp(&b.scan_id));
        all
    }

    /// Scans that have a live session, sorted.
    pub fn active_scans(&self) -> Vec<ScanId> {
        let mut ids: Vec<ScanId> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn session(&self, scan_id: &ScanId, test: bool) -> SharedSession {
        let mut sessions = lock(&self.sessions);
        let capacity = self.config.recent_event_capacity;
        Arc::clone(sessions.entry(scan_id.clone()).or_insert_with(|| {
            let context = ScanContext::new(scan_id.clone(), test, capacity);
            Arc::new(Mutex::new(ScanSession::new(context)))
        }))
    }

    fn release(&self, scan_id: &ScanId) {
        lock(&self.sessions).remove(scan_id);
    }

    fn reject_closed(&self, scan_id: &ScanId, entry: &str, state: ScanState) -> PipelineError {
        warn!(scan_id = %scan_id, entry = %entry, state = %state, "event rejected for closed scan");
        self.release(scan_id);
        PipelineError::ScanClosed {
            scan_id: scan_id.clone(),
            state,
        }
    }

    fn deliver(&self, event: RuleAlertEvent, session: &mut ScanSession, outcome: &mut IngestOutcome) {
        let dispatch = self.router.dispatch(&event, session.context.is_test());
        if dispatch.destination.is_some() {
            session.alerts += 1;
            if dispatch.error.is_some() {
                session.undelivered += 1;
            }
        }
        outcome.alerts.push(DispatchedAlert {
            alert: event,
            dispatch,
        });
    }

    fn absorb(&self, evaluation: RuleEvaluation, session: &mut ScanSession, outcome: &mut IngestOutcome) {
        session.rule_failures += evaluation.failures.len();
        outcome.results.extend(evaluation.failures);
        let test = session.context.is_test();
        for alert in evaluation.alerts {
            let event = RuleAlertEvent::new(session.context.scan_id().clone(), test, alert);
            outcome.results.push(event.to_event_result());
            self.deliver(event, session, outcome);
        }
    }

    fn finish(&self, session: &mut ScanSession, outcome: &mut IngestOutcome) {
        let evaluation = self
            .engine
            .evaluate_terminal(&session.context, &mut session.ledger);
        self.absorb(evaluation, session, outcome);
        session.closed = true;

        let context = &session.context;
        let summary = ScanSummary {
            scan_id: context.scan_id().clone(),
            state: outcome.state,
            test: context.is_test(),
            events: context.event_count(),
            recent_events: context.recent_len(),
            requests: context.request_urls().len(),
            scripts: context.script_count(),
            files: context.file_count(),
            cookies: context.cookie_count(),
            workers: context.workers().len(),
            alerts: session.alerts,
            undelivered: session.undelivered,
            rule_failures: session.rule_failures,
            errors: self.lifecycle.errors(context.scan_id()),
        };
        info!(scan_id = %summary.scan_id, state = %summary.state, alerts = summary.alerts, events = summary.events, "scan finished");
        lock(&self.summaries).insert(summary, self.config.retained_scans);
    }
}

// Every critical section here leaves its data consistent, so a poisoned lock
// is recovered rather than propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
