//! Multi-model PlantUML generation with fallback across candidates, an optional
//! ideation stage, deterministic clean-up and a bounded validate-and-repair loop.

pub mod availability;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod prompt;
pub mod repair;
pub mod router;
pub mod sanitize;
pub mod service;
pub mod stages;
pub mod validator;

pub use cancel::RunGuard;
pub use engine::{BackendConfig, BackendId, BackendKind, EngineConfig, LlmRunner, TextGenerator};
pub use error::{BackendError, CandidateFailure, PipelineError, RepairError};
pub use extract::{extract, looks_well_formed, Extraction};
pub use fallback::{FallbackInvoker, Generated, Stage};
pub use repair::{Outcome, Repair, RepairLoop, RepairReport, SyntaxValidator, Validation};
pub use router::classify;
pub use sanitize::{count_relationships, sanitize, Sanitizer};
pub use service::{
    BackendListing, DiagramResult, DiagramService, DiagramText, HistoryMove, PipelineOptions,
    ServiceBuilder,
};
pub use stages::{CandidateSets, Rendered};
pub use validator::{NoValidator, PlantUmlValidator};
