use std::fmt;
use std::time::Duration;

use umlsmith_core::StoreError;

use crate::fallback::Stage;

/// Failure of a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend id: {0:?}")]
    InvalidId(String),

    #[error("build LLM: {0}")]
    Build(String),

    #[error("chat: {0}")]
    Chat(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("LLM returned empty text")]
    Empty,

    #[error("discovery: {0}")]
    Discovery(String),

    /// The backend has no such capability. Distinct from a transient failure.
    #[error("operation not supported")]
    Unsupported,
}

/// One failed candidate inside a fallback run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub backend: String,
    pub detail: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.detail)
    }
}

pub(crate) fn join_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("all {stage} candidates failed: {}", join_failures(.failures))]
    ExhaustedCandidates {
        stage: Stage,
        failures: Vec<CandidateFailure>,
    },

    #[error("no {0} candidates configured")]
    NoCandidates(Stage),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("diagram not found: {0}")]
    DiagramNotFound(String),

    #[error("No undo steps available.")]
    NothingToUndo,

    #[error("No commands to redo.")]
    NothingToRedo,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a repair step produced nothing.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("refinement is not supported by the configured backends")]
    Unsupported,

    #[error(transparent)]
    Failed(#[from] PipelineError),
}
