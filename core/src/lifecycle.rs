use crate::artifact::ScanQueueJob;
use crate::config::DEFAULT_RETAINED_SCANS;
use crate::event::{now_rfc3339, ScanId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Queued,
    Active,
    Error,
    Complete,
    Failed,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Queued => "queued",
            ScanState::Active => "active",
            ScanState::Error => "error",
            ScanState::Complete => "complete",
            ScanState::Failed => "failed",
        }
    }

    /// Terminal scans accept no further events or transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Complete | ScanState::Failed)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scan {scan_id} cannot move from {state} to {requested}")]
pub struct TransitionRejected {
    pub scan_id: ScanId,
    pub state: ScanState,
    pub requested: ScanState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub scan_id: ScanId,
    pub from: ScanState,
    pub to: ScanState,
    pub at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub state: ScanState,
    pub test: bool,
    /// Reasons of every `error` transition, oldest first.
    pub errors: Vec<String>,
    pub job_name: Option<String>,
    pub source_id: Option<String>,
}

impl ScanRecord {
    fn queued(test: bool) -> Self {
        Self {
            state: ScanState::Queued,
            test,
            errors: Vec::new(),
            job_name: None,
            source_id: None,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    scans: HashMap<ScanId, ScanRecord>,
    /// Terminal scans in the order they closed.
    closed: VecDeque<ScanId>,
}

/// Owns the state machine of every live scan plus a bounded history of
/// finished ones.
#[derive(Debug)]
pub struct LifecycleController {
    registry: Mutex<Registry>,
    retained: usize,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_SCANS)
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `retained` terminal records; live scans are never
    /// evicted.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            retained: retained.max(1),
        }
    }

    /// Registers a queued scan from its job. Re-registering keeps the current
    /// state and only adds job details.
    pub fn register(&self, job: &ScanQueueJob) -> ScanState {
        let mut registry = self.lock();
        let record = registry
            .scans
            .entry(job.scan_id.clone())
            .or_insert_with(|| ScanRecord::queued(job.test));
        record.test |= job.test;
        record.job_name = Some(job.name.clone());
        record.source_id = Some(job.source_id.clone());
        debug!(scan_id = %job.scan_id, job = %job.name, test = record.test, "scan registered");
        record.state
    }

    /// Returns the scan's state, creating a queued record for unknown ids.
    /// The test flag is sticky: once set it is never cleared.
    pub fn ensure(&self, scan_id: &ScanId, test: bool) -> ScanRecord {
        let mut registry = self.lock();
        let record = registry.scans.entry(scan_id.clone()).or_insert_with(|| {
            debug!(scan_id = %scan_id, "implicit scan registration");
            ScanRecord::queued(test)
        });
        record.test |= test;
        record.clone()
    }

    pub fn state(&self, scan_id: &ScanId) -> Option<ScanState> {
        self.lock().scans.get(scan_id).map(|record| record.state)
    }

    pub fn is_test(&self, scan_id: &ScanId) -> bool {
        self.lock()
            .scans
            .get(scan_id)
            .map(|record| record.test)
            .unwrap_or(false)
    }

    pub fn record(&self, scan_id: &ScanId) -> Option<ScanRecord> {
        self.lock().scans.get(scan_id).cloned()
    }

    pub fn errors(&self, scan_id: &ScanId) -> Vec<String> {
        self.lock()
            .scans
            .get(scan_id)
            .map(|record| record.errors.clone())
            .unwrap_or_default()
    }

    /// Applies one transition. `Ok(None)` means the scan was already in the
    /// requested non-terminal state.
    pub fn transition(
        &self,
        scan_id: &ScanId,
        to: ScanState,
        reason: Option<String>,
    ) -> Result<Option<Transition>, TransitionRejected> {
        let mut registry = self.lock();
        let record = registry
            .scans
            .entry(scan_id.clone())
            .or_insert_with(|| ScanRecord::queued(false));
        let from = record.state;

        let rejected = TransitionRejected {
            scan_id: scan_id.clone(),
            state: from,
            requested: to,
        };
        if from.is_terminal() || to == ScanState::Queued {
            return Err(rejected);
        }
        if from == to && to == ScanState::Active {
            return Ok(None);
        }

        if to == ScanState::Error {
            record
                .errors
                .push(reason.clone().unwrap_or_else(|| "unspecified error".to_string()));
        }
        record.state = to;
        info!(scan_id = %scan_id, from = %from, to = %to, "scan state changed");

        if to.is_terminal() {
            registry.closed.push_back(scan_id.clone());
            while registry.closed.len() > self.retained {
                if let Some(evicted) = registry.closed.pop_front() {
                    registry.scans.remove(&evicted);
                    debug!(scan_id = %evicted, "finished scan record evicted");
                }
            }
        }

        Ok(Some(Transition {
            scan_id: scan_id.clone(),
            from,
            to,
            at: now_rfc3339(),
            reason,
        }))
    }

    /// Drops a finished scan's record. Live scans are kept; returns whether
    /// a record was removed.
    pub fn forget(&self, scan_id: &ScanId) -> bool {
        let mut registry = self.lock();
        let terminal = registry
            .scans
            .get(scan_id)
            .is_some_and(|record| record.state.is_terminal());
        if terminal {
            registry.scans.remove(scan_id);
            registry.closed.retain(|id| id != scan_id);
        }
        terminal
    }

    pub fn len(&self) -> usize {
        self.lock().scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scan_ids(&self) -> Vec<ScanId> {
        let mut ids: Vec<ScanId> = self.lock().scans.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(id: &str) -> ScanId {
        ScanId::from(id)
    }

    #[test]
    fn queued_scan_runs_to_completion() {
        let lifecycle = LifecycleController::new();
        let job = ScanQueueJob::new("hourly", "source-9", false);
        assert_eq!(lifecycle.register(&job), ScanState::Queued);

        let active = lifecycle
            .transition(&job.scan_id, ScanState::Active, None)
            .expect("queued -> active")
            .expect("state changed");
        assert_eq!(active.from, ScanState::Queued);

        assert_eq!(
            lifecycle.transition(&job.scan_id, ScanState::Active, None),
            Ok(None)
        );
        lifecycle
            .transition(&job.scan_id, ScanState::Complete, None)
            .expect("active -> complete");
        assert_eq!(lifecycle.state(&job.scan_id), Some(ScanState::Complete));
    }

    #[test]
    fn terminal_states_reject_everything() {
        let lifecycle = LifecycleController::new();
        let id = scan("s-term");
        lifecycle
            .transition(&id, ScanState::Failed, Some("crash".to_string()))
            .expect("queued -> failed");
        for target in [
            ScanState::Active,
            ScanState::Error,
            ScanState::Complete,
            ScanState::Failed,
        ] {
            let err = lifecycle
                .transition(&id, target, None)
                .expect_err("terminal scan must reject");
            assert_eq!(err.state, ScanState::Failed);
            assert_eq!(err.requested, target);
        }
    }

    #[test]
    fn error_is_recoverable_and_recorded() {
        let lifecycle = LifecycleController::new();
        let id = scan("s-err");
        lifecycle.transition(&id, ScanState::Active, None).expect("activate");
        lifecycle
            .transition(&id, ScanState::Error, Some("navigation timeout".to_string()))
            .expect("active -> error");
        lifecycle
            .transition(&id, ScanState::Error, Some("second".to_string()))
            .expect("error -> error");
        lifecycle.transition(&id, ScanState::Active, None).expect("error -> active");
        assert_eq!(lifecycle.errors(&id), vec!["navigation timeout", "second"]);
        assert!(lifecycle.transition(&id, ScanState::Queued, None).is_err());
    }

    #[test]
    fn finished_records_are_bounded_oldest_first() {
        let lifecycle = LifecycleController::with_retention(3);
        let live = scan("live");
        lifecycle.transition(&live, ScanState::Active, None).expect("activate");
        for i in 0..10 {
            let id = scan(&format!("done-{i}"));
            lifecycle.transition(&id, ScanState::Active, None).expect("activate");
            lifecycle.transition(&id, ScanState::Complete, None).expect("complete");
        }

        assert_eq!(lifecycle.len(), 4);
        assert_eq!(lifecycle.state(&live), Some(ScanState::Active));
        assert_eq!(lifecycle.state(&scan("done-6")), None);
        assert_eq!(lifecycle.state(&scan("done-9")), Some(ScanState::Complete));
    }

    #[test]
    fn forget_only_drops_finished_scans() {
        let lifecycle = LifecycleController::new();
        let live = scan("f-live");
        let done = scan("f-done");
        lifecycle.transition(&live, ScanState::Active, None).expect("activate");
        lifecycle.transition(&done, ScanState::Failed, None).expect("fail");
        assert!(!lifecycle.forget(&live));
        assert!(lifecycle.forget(&done));
        assert!(!lifecycle.forget(&done));
        assert_eq!(lifecycle.scan_ids(), vec![live]);
    }

    #[test]
    fn test_flag_is_sticky() {
        let lifecycle = LifecycleController::new();
        let id = scan("s-test");
        assert!(lifecycle.ensure(&id, true).test);
        assert!(lifecycle.ensure(&id, false).test);
        assert!(lifecycle.is_test(&id));
        assert_eq!(lifecycle.state(&id), Some(ScanState::Queued));
    }
}
