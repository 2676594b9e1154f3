//! Ideation → rendering.
//!
//! The stage decision keys on the prompt bundle's category, not the requested one, so a
//! catalog can route another category through the class pipeline.

use serde::Serialize;
use umlsmith_core::templates::NOTES_PLACEHOLDER;
use umlsmith_core::{CandidateOverrides, DiagramCategory, PipelinePrompts};

use crate::cancel::RunGuard;
use crate::error::PipelineError;
use crate::extract::{extract, Extraction};
use crate::fallback::{FallbackInvoker, Stage};
use crate::prompt;

/// Ordered candidate lists per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateSets {
    pub ideation: Vec<String>,
    pub rendering: Vec<String>,
    pub validation: Vec<String>,
}

impl CandidateSets {
    /// Per-request overrides replace the configured list of their stage.
    pub fn resolve(defaults: &CandidateSets, overrides: &CandidateOverrides) -> CandidateSets {
        let pick = |over: &Option<Vec<String>>, default: &Vec<String>| match over {
            Some(list) => list
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => default.clone(),
        };
        CandidateSets {
            ideation: pick(&overrides.ideation, &defaults.ideation),
            rendering: pick(&overrides.rendering, &defaults.rendering),
            validation: pick(&overrides.validation, &defaults.validation),
        }
    }

    /// Ideation falls back to the rendering list when it has none of its own.
    pub fn ideation_or_rendering(&self) -> &[String] {
        if self.ideation.is_empty() {
            &self.rendering
        } else {
            &self.ideation
        }
    }
}

/// Output of [`render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub payload: String,
    pub remainder: String,
    /// Ideation output, for two-stage runs.
    pub notes: Option<String>,
    pub backend: String,
}

pub async fn render(
    invoker: &FallbackInvoker,
    category: DiagramCategory,
    user_prompt: &str,
    prompts: &PipelinePrompts,
    candidates: &CandidateSets,
    guard: &RunGuard,
) -> Result<Rendered, PipelineError> {
    if prompts.category != DiagramCategory::Class {
        let rendering_prompt = match &prompts.rendering_prompt_template {
            Some(template) => template.clone(),
            None => prompt::default_rendering(prompts.category, user_prompt),
        };
        tracing::info!(%category, "rendering in a single stage");
        let generated = invoker
            .invoke(Stage::Rendering, &candidates.rendering, &rendering_prompt, guard)
            .await?;
        return Ok(finish(extract(&generated.text), None, generated.backend));
    }

    tracing::info!(%category, "running ideation stage");
    let ideation_prompt = match &prompts.ideation_prompt {
        Some(p) => p.clone(),
        None => prompt::default_class_ideation(user_prompt),
    };
    let notes = invoker
        .invoke(
            Stage::Ideation,
            candidates.ideation_or_rendering(),
            &ideation_prompt,
            guard,
        )
        .await?
        .text;

    let template = match &prompts.rendering_prompt_template {
        Some(t) => t.clone(),
        None => prompt::default_class_rendering(),
    };
    let rendering_prompt =
        if prompts.uses_notes_substitution || template.contains(NOTES_PLACEHOLDER) {
            prompt::substitute_notes(&template, &notes, user_prompt)
        } else {
            template
        };

    tracing::info!(%category, notes_len = notes.len(), "running rendering stage");
    let generated = invoker
        .invoke(Stage::Rendering, &candidates.rendering, &rendering_prompt, guard)
        .await?;
    Ok(finish(extract(&generated.text), Some(notes), generated.backend))
}

fn finish(extraction: Extraction, notes: Option<String>, backend: String) -> Rendered {
    if extraction.is_empty() {
        tracing::warn!(%backend, "model output contained no diagram");
    }
    Rendered {
        payload: extraction.payload,
        remainder: extraction.remainder,
        notes,
        backend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TextGenerator;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Records every (backend, prompt) pair; answers by prompt prefix.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TextGenerator for Recorder {
        async fn generate(&self, backend: &str, prompt: &str, _: Duration) -> Result<String, BackendError> {
            self.calls.lock().push((backend.to_string(), prompt.to_string()));
            if prompt.starts_with("IDEATE") {
                Ok("{\"entities\":[\"Order\"]}".into())
            } else {
                Ok("```plantuml\n@startuml\nclass Order\n@enduml\n```\nOrder is the root.".into())
            }
        }
    }

    fn sets(ideation: &[&str], rendering: &[&str]) -> CandidateSets {
        CandidateSets {
            ideation: ideation.iter().map(|s| s.to_string()).collect(),
            rendering: rendering.iter().map(|s| s.to_string()).collect(),
            validation: vec![],
        }
    }

    #[tokio::test]
    async fn class_runs_ideation_then_substitutes_notes() {
        let recorder = Arc::new(Recorder::default());
        let invoker = FallbackInvoker::new(recorder.clone(), Duration::from_secs(5));
        let prompts = PipelinePrompts {
            category: DiagramCategory::Class,
            ideation_prompt: Some("IDEATE shop".into()),
            rendering_prompt_template: Some("RENDER {analyst_notes} for {original_prompt}".into()),
            uses_notes_substitution: true,
        };

        let out = render(
            &invoker,
            DiagramCategory::Eerd,
            "shop",
            &prompts,
            &sets(&["thinker"], &["drawer"]),
            &RunGuard::unbounded(),
        )
        .await
        .unwrap();

        let calls = recorder.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "thinker");
        assert_eq!(calls[1].0, "drawer");
        assert_eq!(calls[1].1, "RENDER {\"entities\":[\"Order\"]} for shop");
        assert_eq!(out.payload, "@startuml\nclass Order\n@enduml");
        assert_eq!(out.remainder, "Order is the root.");
        assert_eq!(out.notes.as_deref(), Some("{\"entities\":[\"Order\"]}"));
    }

    #[tokio::test]
    async fn ideation_uses_rendering_candidates_when_unset() {
        let recorder = Arc::new(Recorder::default());
        let invoker = FallbackInvoker::new(recorder.clone(), Duration::from_secs(5));
        let prompts = PipelinePrompts::empty(DiagramCategory::Class);

        render(&invoker, DiagramCategory::Class, "shop", &prompts, &sets(&[], &["drawer"]), &RunGuard::unbounded())
            .await
            .unwrap();

        let calls = recorder.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(b, _)| b == "drawer"));
        assert!(calls[1].1.contains("shop"));
    }

    #[tokio::test]
    async fn non_class_goes_straight_to_rendering() {
        let recorder = Arc::new(Recorder::default());
        let invoker = FallbackInvoker::new(recorder.clone(), Duration::from_secs(5));
        let prompts = PipelinePrompts::empty(DiagramCategory::State);

        let out = render(
            &invoker,
            DiagramCategory::State,
            "a turnstile",
            &prompts,
            &sets(&["thinker"], &["drawer"]),
            &RunGuard::unbounded(),
        )
        .await
        .unwrap();

        let calls = recorder.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "drawer");
        assert!(calls[0].1.contains("a turnstile"));
        assert!(out.notes.is_none());
    }

    #[test]
    fn overrides_replace_only_their_stage() {
        let defaults = sets(&["i1"], &["r1", "r2"]);
        let overrides = CandidateOverrides {
            rendering: Some(vec![" openai/gpt-4o ".into(), "".into()]),
            ..CandidateOverrides::default()
        };
        let resolved = CandidateSets::resolve(&defaults, &overrides);
        assert_eq!(resolved.ideation, vec!["i1"]);
        assert_eq!(resolved.rendering, vec!["openai/gpt-4o"]);
    }
}
