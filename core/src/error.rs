use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::event::ScanId;
use crate::lifecycle::ScanState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("event has no scan id")]
    MissingScanId,
    #[error("scan {scan_id} is {state} and accepts no further events")]
    ScanClosed { scan_id: ScanId, state: ScanState },
    #[error("unknown scan {0}")]
    UnknownScan(ScanId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
