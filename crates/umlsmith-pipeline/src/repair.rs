//! Validate-and-repair loop.
//!
//! ```text
//! Validating(n) --valid--------------------------> Accepted
//! Validating(n) --invalid, n < max---------------> Repairing(n, diagnostic)
//! Validating(n) --invalid, n == max--------------> Exhausted
//! Repairing(n)  --refined / transient failure----> Validating(n + 1)
//! ```
//!
//! An unavailable validator accepts immediately. A backend without refine support or a
//! cancelled run stops the loop with the payload it has. Neither is an error.

use async_trait::async_trait;
use serde::Serialize;
use umlsmith_core::DiagramCategory;

use crate::cancel::RunGuard;
use crate::error::RepairError;
use crate::extract::{extract, looks_well_formed};
use crate::fallback::FallbackInvoker;
use crate::prompt;
use crate::sanitize::Sanitizer;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Verdict of a syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
    /// The checker could not run (missing, crashed, timed out).
    Unavailable,
}

#[async_trait]
pub trait SyntaxValidator: Send + Sync {
    fn is_available(&self) -> bool;

    async fn validate(&self, payload: &str) -> Validation;
}

/// Produces a corrected payload from the current one plus validator feedback.
#[async_trait]
pub trait Repair: Send + Sync {
    async fn repair(&self, payload: &str, feedback: &str) -> Result<String, RepairError>;
}

/// [`Repair`] through the refine capability of a candidate list.
pub struct InvokerRepair<'a> {
    pub invoker: &'a FallbackInvoker,
    pub candidates: &'a [String],
    pub guard: &'a RunGuard,
}

#[async_trait]
impl Repair for InvokerRepair<'_> {
    async fn repair(&self, payload: &str, feedback: &str) -> Result<String, RepairError> {
        self.invoker
            .refine(self.candidates, payload, feedback, self.guard)
            .await
            .map(|g| g.text)
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    ValidatorUnavailable,
    Exhausted,
    RefineUnsupported,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub payload: String,
    pub outcome: Outcome,
    /// Validator runs performed.
    pub attempts: u32,
    /// Successful repair calls.
    pub repairs: u32,
    pub last_diagnostic: Option<String>,
}

enum State {
    Validating { attempt: u32 },
    Repairing { attempt: u32, diagnostic: String },
}

pub struct RepairLoop<'a> {
    validator: &'a dyn SyntaxValidator,
    repair: &'a dyn Repair,
    sanitizer: Option<Sanitizer>,
    max_attempts: u32,
}

impl<'a> RepairLoop<'a> {
    pub fn new(validator: &'a dyn SyntaxValidator, repair: &'a dyn Repair) -> Self {
        Self {
            validator,
            repair,
            sanitizer: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Values below 1 still validate once.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Re-sanitize every repaired payload.
    pub fn sanitizer(mut self, sanitizer: Option<Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub async fn validate_and_fix(
        &self,
        payload: &str,
        category: Option<DiagramCategory>,
        original_prompt: &str,
        guard: &RunGuard,
    ) -> RepairReport {
        let mut report = RepairReport {
            payload: payload.to_string(),
            outcome: Outcome::Accepted,
            attempts: 0,
            repairs: 0,
            last_diagnostic: None,
        };
        let mut state = State::Validating { attempt: 1 };

        loop {
            if guard.is_stopped() {
                tracing::info!(attempts = report.attempts, "repair loop cancelled");
                report.outcome = Outcome::Cancelled;
                return report;
            }

            state = match state {
                State::Validating { attempt } => {
                    if !self.validator.is_available() {
                        report.outcome = Outcome::ValidatorUnavailable;
                        return report;
                    }
                    report.attempts = attempt;
                    match self.validator.validate(&report.payload).await {
                        Validation::Valid => {
                            tracing::debug!(attempt, "diagram accepted");
                            report.outcome = Outcome::Accepted;
                            return report;
                        }
                        Validation::Unavailable => {
                            tracing::warn!(attempt, "validator unavailable, accepting as is");
                            report.outcome = Outcome::ValidatorUnavailable;
                            return report;
                        }
                        Validation::Invalid(diagnostic) => {
                            tracing::info!(attempt, max = self.max_attempts, "diagram failed validation");
                            report.last_diagnostic = Some(diagnostic.clone());
                            if attempt >= self.max_attempts {
                                report.outcome = Outcome::Exhausted;
                                return report;
                            }
                            State::Repairing {
                                attempt,
                                diagnostic,
                            }
                        }
                    }
                }
                State::Repairing {
                    attempt,
                    diagnostic,
                } => {
                    let feedback =
                        prompt::repair_feedback(&diagnostic, category, original_prompt);
                    match self.repair.repair(&report.payload, &feedback).await {
                        Ok(raw) => {
                            report.repairs += 1;
                            if let Some(next) = self.accept_repair(&raw) {
                                report.payload = next;
                            }
                        }
                        Err(RepairError::Unsupported) => {
                            tracing::info!("backend cannot refine, keeping current diagram");
                            report.outcome = Outcome::RefineUnsupported;
                            return report;
                        }
                        Err(RepairError::Failed(e)) => {
                            tracing::warn!(attempt, error = %e, "repair attempt failed");
                        }
                    }
                    State::Validating {
                        attempt: attempt + 1,
                    }
                }
            };
        }
    }

    /// Prefer the extracted diagram over raw output. Anything that is not a complete
    /// diagram (blank, or prose that only mentions the markers) keeps the current payload.
    fn accept_repair(&self, raw: &str) -> Option<String> {
        let extracted = extract(raw);
        let candidate = if extracted.is_empty() {
            raw.trim().to_string()
        } else {
            extracted.payload
        };
        if !looks_well_formed(&candidate) {
            tracing::info!(chars = candidate.len(), "repair output is not a diagram, ignoring it");
            return None;
        }
        Some(match self.sanitizer {
            Some(sanitizer) => sanitizer.sanitize(&candidate),
            None => candidate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct AlwaysInvalid {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyntaxValidator for AlwaysInvalid {
        fn is_available(&self) -> bool {
            true
        }

        async fn validate(&self, payload: &str) -> Validation {
            self.seen.lock().push(payload.to_string());
            Validation::Invalid("Syntax Error? (line 2)".into())
        }
    }

    struct Verdicts(Mutex<VecDeque<Validation>>);

    #[async_trait]
    impl SyntaxValidator for Verdicts {
        fn is_available(&self) -> bool {
            true
        }

        async fn validate(&self, _payload: &str) -> Validation {
            self.0.lock().pop_front().unwrap_or(Validation::Valid)
        }
    }

    struct Missing;

    #[async_trait]
    impl SyntaxValidator for Missing {
        fn is_available(&self) -> bool {
            false
        }

        async fn validate(&self, _payload: &str) -> Validation {
            Validation::Unavailable
        }
    }

    /// Replies in order; counts calls.
    struct Replies {
        replies: Mutex<VecDeque<Result<String, RepairError>>>,
        calls: Mutex<u32>,
    }

    impl Replies {
        fn new(replies: Vec<Result<String, RepairError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Repair for Replies {
        async fn repair(&self, _payload: &str, feedback: &str) -> Result<String, RepairError> {
            assert!(feedback.contains("Please correct ONLY the syntax errors"));
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or(Err(RepairError::Unsupported))
        }
    }

    const P0: &str = "@startuml\nA -> \n@enduml";
    const P1: &str = "@startuml\nA -> B\n@enduml";
    const P2: &str = "@startuml\nA -> B : hi\n@enduml";

    #[tokio::test]
    async fn exhausts_after_max_attempts_with_one_fewer_repairs() {
        let validator = AlwaysInvalid {
            seen: Mutex::new(vec![]),
        };
        let repair = Replies::new(vec![
            Ok(format!("Fixed:\n```plantuml\n{P1}\n```")),
            Ok(P2.to_string()),
        ]);
        let report = RepairLoop::new(&validator, &repair)
            .max_attempts(3)
            .validate_and_fix(P0, Some(DiagramCategory::Sequence), "login", &RunGuard::unbounded())
            .await;

        assert_eq!(*repair.calls.lock(), 2);
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.payload, P2);
        assert_eq!(report.attempts, 3);
        assert_eq!(*validator.seen.lock(), vec![P0, P1, P2]);
    }

    #[tokio::test]
    async fn unavailable_validator_accepts_unchanged() {
        let repair = Replies::new(vec![]);
        let report = RepairLoop::new(&Missing, &repair)
            .validate_and_fix(P0, None, "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.outcome, Outcome::ValidatorUnavailable);
        assert_eq!(report.payload, P0);
        assert_eq!(*repair.calls.lock(), 0);
    }

    #[tokio::test]
    async fn accepted_after_one_repair() {
        let validator = Verdicts(Mutex::new(
            vec![Validation::Invalid("bad".into()), Validation::Valid].into(),
        ));
        let repair = Replies::new(vec![Ok(P1.to_string())]);
        let report = RepairLoop::new(&validator, &repair)
            .validate_and_fix(P0, None, "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.outcome, Outcome::Accepted);
        assert_eq!(report.payload, P1);
        assert_eq!(report.repairs, 1);
    }

    #[tokio::test]
    async fn unsupported_refine_returns_last_payload() {
        let validator = AlwaysInvalid {
            seen: Mutex::new(vec![]),
        };
        let repair = Replies::new(vec![Err(RepairError::Unsupported)]);
        let report = RepairLoop::new(&validator, &repair)
            .validate_and_fix(P0, None, "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.outcome, Outcome::RefineUnsupported);
        assert_eq!(report.payload, P0);
        assert_eq!(*repair.calls.lock(), 1);
    }

    #[tokio::test]
    async fn transient_failure_keeps_payload_and_moves_on() {
        let validator = Verdicts(Mutex::new(
            vec![
                Validation::Invalid("bad".into()),
                Validation::Invalid("still bad".into()),
                Validation::Valid,
            ]
            .into(),
        ));
        let repair = Replies::new(vec![
            Err(RepairError::Failed(PipelineError::Cancelled)),
            Ok(P1.to_string()),
        ]);
        let report = RepairLoop::new(&validator, &repair)
            .validate_and_fix(P0, None, "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.outcome, Outcome::Accepted);
        assert_eq!(report.payload, P1);
        assert_eq!(report.repairs, 1);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn repaired_output_is_resanitized() {
        let validator = Verdicts(Mutex::new(vec![Validation::Invalid("bad".into())].into()));
        let repair = Replies::new(vec![Ok("@startuml\nClass Foo extends Bar\n@enduml".into())]);
        let report = RepairLoop::new(&validator, &repair)
            .sanitizer(Some(Sanitizer::for_category(DiagramCategory::Class)))
            .validate_and_fix(P0, Some(DiagramCategory::Class), "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.payload, "@startuml\nclass Foo\nFoo --|> Bar\n@enduml");
    }

    #[tokio::test]
    async fn prose_mentioning_markers_does_not_replace_the_diagram() {
        let validator = AlwaysInvalid {
            seen: Mutex::new(vec![]),
        };
        let original = "@startuml\nclass Order {\n  +id : int\n}\nOrder --> Item\n@enduml";
        let repair = Replies::new(vec![Ok(
            "I could not fix it. Please make sure your code sits between @startuml and @enduml tags."
                .to_string(),
        )]);
        let report = RepairLoop::new(&validator, &repair)
            .max_attempts(2)
            .validate_and_fix(original, Some(DiagramCategory::Class), "p", &RunGuard::unbounded())
            .await;

        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.repairs, 1);
        assert_eq!(report.payload, original);
        assert_eq!(*validator.seen.lock(), vec![original, original]);
    }

    #[tokio::test]
    async fn blank_repair_output_keeps_the_payload() {
        let validator = Verdicts(Mutex::new(vec![Validation::Invalid("bad".into())].into()));
        let repair = Replies::new(vec![Ok("   ".to_string())]);
        let report = RepairLoop::new(&validator, &repair)
            .validate_and_fix(P0, None, "p", &RunGuard::unbounded())
            .await;
        assert_eq!(report.outcome, Outcome::Accepted);
        assert_eq!(report.payload, P0);
    }

    #[tokio::test]
    async fn cancellation_returns_current_payload() {
        let validator = AlwaysInvalid {
            seen: Mutex::new(vec![]),
        };
        let repair = Replies::new(vec![]);
        let guard = RunGuard::unbounded();
        guard.token().cancel();
        let report = RepairLoop::new(&validator, &repair)
            .validate_and_fix(P0, None, "p", &guard)
            .await;
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.payload, P0);
        assert!(validator.seen.lock().is_empty());
    }
}
