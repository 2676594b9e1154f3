//! Ordered candidate fallback for one logical generation step.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cancel::RunGuard;
use crate::engine::TextGenerator;
use crate::error::{join_failures, BackendError, CandidateFailure, PipelineError, RepairError};

const PREVIEW_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ideation,
    Rendering,
    Validation,
    Repair,
    Explanation,
    CodeGeneration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Ideation => "ideation",
            Stage::Rendering => "rendering",
            Stage::Validation => "validation",
            Stage::Repair => "repair",
            Stage::Explanation => "explanation",
            Stage::CodeGeneration => "code generation",
        })
    }
}

/// Output of the first candidate that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub backend: String,
    pub text: String,
}

pub struct FallbackInvoker {
    generator: Arc<dyn TextGenerator>,
    call_timeout: Duration,
    debug_previews: bool,
}

impl FallbackInvoker {
    pub fn new(generator: Arc<dyn TextGenerator>, call_timeout: Duration) -> Self {
        Self {
            generator,
            call_timeout,
            debug_previews: false,
        }
    }

    pub fn with_debug_previews(mut self, enabled: bool) -> Self {
        self.debug_previews = enabled;
        self
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }

    /// Try `candidates` in order; the first answer wins, whatever its quality.
    pub async fn invoke(
        &self,
        stage: Stage,
        candidates: &[String],
        prompt: &str,
        guard: &RunGuard,
    ) -> Result<Generated, PipelineError> {
        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates(stage));
        }

        let mut failures = Vec::new();
        for backend in candidates {
            guard.check()?;
            let timeout = guard.budget(self.call_timeout);
            tracing::debug!(%stage, %backend, "trying candidate");

            match self.generator.generate(backend, prompt, timeout).await {
                Ok(text) => {
                    self.preview(stage, backend, &text);
                    return Ok(Generated {
                        backend: backend.clone(),
                        text,
                    });
                }
                Err(e) => {
                    tracing::warn!(%stage, %backend, error = %e, "candidate failed");
                    failures.push(CandidateFailure {
                        backend: backend.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::ExhaustedCandidates { stage, failures })
    }

    /// Same ordering rules as [`invoke`](Self::invoke), over the backends' refine
    /// capability. A backend reporting `Unsupported` ends the run immediately.
    pub async fn refine(
        &self,
        candidates: &[String],
        current: &str,
        feedback: &str,
        guard: &RunGuard,
    ) -> Result<Generated, RepairError> {
        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates(Stage::Repair).into());
        }

        let mut failures = Vec::new();
        for backend in candidates {
            guard.check()?;
            let timeout = guard.budget(self.call_timeout);

            match self
                .generator
                .refine(backend, current, feedback, timeout)
                .await
            {
                Ok(text) => {
                    self.preview(Stage::Repair, backend, &text);
                    return Ok(Generated {
                        backend: backend.clone(),
                        text,
                    });
                }
                Err(BackendError::Unsupported) => {
                    if !failures.is_empty() {
                        let earlier = join_failures(&failures);
                        tracing::warn!(%backend, %earlier, "refine unsupported after earlier candidates failed");
                    }
                    return Err(RepairError::Unsupported);
                }
                Err(e) => {
                    tracing::warn!(stage = %Stage::Repair, %backend, error = %e, "candidate failed");
                    failures.push(CandidateFailure {
                        backend: backend.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::ExhaustedCandidates {
            stage: Stage::Repair,
            failures,
        }
        .into())
    }

    fn preview(&self, stage: Stage, backend: &str, text: &str) {
        if self.debug_previews {
            let preview: String = text.chars().take(PREVIEW_CHARS).collect();
            tracing::info!(%stage, %backend, %preview, "model output");
        } else {
            tracing::debug!(%stage, %backend, chars = text.len(), "candidate answered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Replies per backend name; anything unlisted fails.
    #[derive(Default)]
    struct Scripted {
        replies: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn answering(pairs: &[(&str, &str)]) -> Self {
            Self {
                replies: pairs
                    .iter()
                    .map(|(b, r)| (b.to_string(), r.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(
            &self,
            backend: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, BackendError> {
            self.calls.lock().push(backend.to_string());
            self.replies
                .get(backend)
                .cloned()
                .ok_or_else(|| BackendError::Chat(format!("{backend} is down")))
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let generator = Arc::new(Scripted::answering(&[("b", "from b"), ("c", "from c")]));
        let invoker = FallbackInvoker::new(generator.clone(), Duration::from_secs(5));

        let out = invoker
            .invoke(Stage::Rendering, &names(&["a", "b", "c"]), "p", &RunGuard::unbounded())
            .await
            .unwrap();

        assert_eq!(out.backend, "b");
        assert_eq!(out.text, "from b");
        assert_eq!(*generator.calls.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn total_failure_names_every_candidate() {
        let invoker = FallbackInvoker::new(Arc::new(Scripted::default()), Duration::from_secs(5));
        let err = invoker
            .invoke(Stage::Ideation, &names(&["m1", "m2", "m1"]), "p", &RunGuard::unbounded())
            .await
            .unwrap_err();

        match &err {
            PipelineError::ExhaustedCandidates { stage, failures } => {
                assert_eq!(*stage, Stage::Ideation);
                assert_eq!(failures.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("m1: chat: m1 is down | m2: chat: m2 is down"));
    }

    #[tokio::test]
    async fn empty_list_is_rejected() {
        let invoker = FallbackInvoker::new(Arc::new(Scripted::default()), Duration::from_secs(5));
        let err = invoker
            .invoke(Stage::Rendering, &[], "p", &RunGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoCandidates(Stage::Rendering)));
    }

    #[tokio::test]
    async fn cancelled_guard_stops_before_calling() {
        let generator = Arc::new(Scripted::answering(&[("a", "x")]));
        let invoker = FallbackInvoker::new(generator.clone(), Duration::from_secs(5));
        let guard = RunGuard::unbounded();
        guard.token().cancel();

        let err = invoker
            .invoke(Stage::Rendering, &names(&["a"]), "p", &guard)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(generator.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn refine_without_support_is_unsupported() {
        let invoker = FallbackInvoker::new(
            Arc::new(Scripted::answering(&[("a", "x")])),
            Duration::from_secs(5),
        );
        let err = invoker
            .refine(&names(&["a", "b"]), "@startuml\n@enduml", "fix", &RunGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::Unsupported));
    }

    /// Refine fails transiently for names starting with "down", unsupported otherwise.
    struct FlakyRefine {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for FlakyRefine {
        async fn generate(&self, _: &str, _: &str, _: Duration) -> Result<String, BackendError> {
            Err(BackendError::Empty)
        }

        async fn refine(
            &self,
            backend: &str,
            _current: &str,
            _feedback: &str,
            _timeout: Duration,
        ) -> Result<String, BackendError> {
            self.calls.lock().push(backend.to_string());
            if backend.starts_with("down") {
                Err(BackendError::Timeout(Duration::from_secs(1)))
            } else {
                Err(BackendError::Unsupported)
            }
        }
    }

    #[tokio::test]
    async fn refine_reports_unsupported_after_a_transient_failure() {
        let generator = Arc::new(FlakyRefine {
            calls: Mutex::new(Vec::new()),
        });
        let invoker = FallbackInvoker::new(generator.clone(), Duration::from_secs(5));
        let err = invoker
            .refine(
                &names(&["down-1", "plain", "never"]),
                "@startuml\n@enduml",
                "fix",
                &RunGuard::unbounded(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepairError::Unsupported));
        assert_eq!(*generator.calls.lock(), vec!["down-1", "plain"]);
    }
}
