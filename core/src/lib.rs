pub mod alert;
pub mod artifact;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod normalize;
pub mod pipeline;
pub mod router;
pub mod rules;
pub mod store;
pub mod validation;

pub use alert::{AlertLevel, RuleAlert, RuleAlertEvent};
pub use artifact::{ArtifactKind, ArtifactMetadata, FileAttributes, ScanQueueJob};
pub use config::{ConfigError, PipelineConfig, RuleSettings};
pub use context::{RequestExchange, ScanContext};
pub use engine::{
    AlertLedger, EngineError, RepeatPolicy, Rule, RuleDescriptor, RuleEngine, RuleEvaluation,
    RuleMatch, RuleTrigger,
};
pub use error::PipelineError;
pub use event::{
    EventLevel, EventPayload, EventResult, RawScanEvent, ScanEventType, ScanId,
};
pub use lifecycle::{LifecycleController, ScanState, Transition, TransitionRejected};
pub use normalize::{LifecycleSignal, Normalized, Normalizer, SchemaViolation};
pub use pipeline::{DispatchedAlert, IngestOutcome, Pipeline, ScanSummary};
pub use router::{
    route, AlertRouter, AlertSink, Destination, DispatchRecord, JsonLinesSink, MemorySink,
    SinkError,
};
pub use rules::{builtin_rule_catalog, builtin_rules, RuleCatalog, BUILTIN_RULE_NAMES};
pub use store::{sha256_hex, ContentStore, PutOutcome};
pub use validation::{validate_config, Diagnostic, DiagnosticLevel};
