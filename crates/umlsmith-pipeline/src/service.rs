//! Request-level orchestration: route, render, clean, validate, persist, record.
//! Edits of one diagram (refine, undo, redo) run one at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as EditLock, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use umlsmith_core::{
    BuiltinCatalog, CommandSnapshot, DiagramArtifact, DiagramCategory, DiagramRepository,
    EditRecord, FileDiagramStore, GenerationRequest, HistoryStore, PromptCatalog, Restored,
    Settings,
};

use crate::availability::BackendCatalog;
use crate::cancel::RunGuard;
use crate::engine::{BackendKind, EngineConfig, LlmRunner, TextGenerator};
use crate::error::{BackendError, PipelineError, RepairError};
use crate::extract::{extract, looks_well_formed};
use crate::fallback::{FallbackInvoker, Stage};
use crate::prompt;
use crate::repair::{InvokerRepair, Outcome, RepairLoop, SyntaxValidator};
use crate::router;
use crate::sanitize::Sanitizer;
use crate::stages::{self, CandidateSets};
use crate::validator::{NoValidator, PlantUmlValidator};

/// Tunables for the pipeline, usually derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub candidates: CandidateSets,
    pub default_kind: BackendKind,
    pub call_timeout: Duration,
    /// Whole-request budget. `None` = only per-call timeouts apply.
    pub deadline: Option<Duration>,
    pub max_repair_attempts: u32,
    pub sanitizer_enabled: bool,
    pub debug_previews: bool,
    pub discovery_ttl: Duration,
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            candidates: CandidateSets {
                ideation: settings.ideation_models.clone(),
                rendering: settings.uml_models.clone(),
                validation: settings.validation_models.clone(),
            },
            default_kind: BackendKind::parse(&settings.backend).unwrap_or(BackendKind::Ollama),
            call_timeout: Duration::from_secs(settings.timeout_secs),
            deadline: settings.deadline_secs.map(Duration::from_secs),
            max_repair_attempts: settings.max_repair_attempts,
            sanitizer_enabled: settings.sanitizer_enabled,
            debug_previews: settings.debug_previews,
            discovery_ttl: Duration::from_secs(settings.discovery_ttl_secs),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A stored diagram plus how its validation ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramResult {
    pub diagram: DiagramArtifact,
    pub validation: Outcome,
    pub attempts: u32,
    pub repairs: u32,
}

/// Result of undo or redo.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMove {
    pub diagram_id: String,
    pub command_id: String,
    pub payload: String,
    pub message: String,
}

/// Free text a model produced about a stored diagram (explanation or code).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramText {
    pub diagram_id: String,
    pub backend: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendListing {
    pub default_kind: BackendKind,
    pub ideation: Vec<String>,
    pub rendering: Vec<String>,
    pub validation: Vec<String>,
    /// Models the local host reported; `None` when discovery has not succeeded.
    pub discovered: Option<Vec<String>>,
}

pub struct DiagramService {
    invoker: FallbackInvoker,
    availability: Arc<BackendCatalog>,
    prompts: Arc<dyn PromptCatalog>,
    validator: Arc<dyn SyntaxValidator>,
    diagrams: Arc<dyn DiagramRepository>,
    history: Arc<HistoryStore>,
    options: PipelineOptions,
    shutdown: CancellationToken,
    /// Serializes read-modify-record sequences per diagram.
    edit_locks: Mutex<HashMap<String, Arc<EditLock<()>>>>,
}

pub struct ServiceBuilder {
    generator: Arc<dyn TextGenerator>,
    options: PipelineOptions,
    prompts: Arc<dyn PromptCatalog>,
    validator: Arc<dyn SyntaxValidator>,
    diagrams: Option<Arc<dyn DiagramRepository>>,
    history: Option<Arc<HistoryStore>>,
    shutdown: CancellationToken,
}

impl ServiceBuilder {
    pub fn prompts(mut self, prompts: Arc<dyn PromptCatalog>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SyntaxValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn diagrams(mut self, diagrams: Arc<dyn DiagramRepository>) -> Self {
        self.diagrams = Some(diagrams);
        self
    }

    pub fn history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Cancelling this token stops every in-flight request.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> DiagramService {
        let availability = Arc::new(BackendCatalog::new(
            self.generator.clone(),
            self.options.default_kind,
            self.options.discovery_ttl,
        ));
        DiagramService {
            invoker: FallbackInvoker::new(self.generator, self.options.call_timeout)
                .with_debug_previews(self.options.debug_previews),
            availability,
            prompts: self.prompts,
            validator: self.validator,
            diagrams: self
                .diagrams
                .unwrap_or_else(|| Arc::new(umlsmith_core::MemoryDiagramStore::new())),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(HistoryStore::in_memory())),
            options: self.options,
            shutdown: self.shutdown,
            edit_locks: Mutex::new(HashMap::new()),
        }
    }
}

impl DiagramService {
    /// In-memory stores, built-in prompts and no syntax checker until configured otherwise.
    pub fn builder(generator: Arc<dyn TextGenerator>, options: PipelineOptions) -> ServiceBuilder {
        ServiceBuilder {
            generator,
            options,
            prompts: Arc::new(BuiltinCatalog),
            validator: Arc::new(NoValidator),
            diagrams: None,
            history: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Production wiring: `llm` backends, PlantUML jar, JSON stores under `root`.
    pub fn from_settings(
        settings: &Settings,
        root: impl Into<PathBuf>,
        shutdown: CancellationToken,
    ) -> Result<Self, BackendError> {
        let root = root.into();
        let runner = LlmRunner::new(EngineConfig::from_settings(settings))?;
        Ok(Self::builder(Arc::new(runner), PipelineOptions::from_settings(settings))
            .validator(Arc::new(PlantUmlValidator::from_settings(settings)))
            .diagrams(Arc::new(FileDiagramStore::new(&root)))
            .history(Arc::new(HistoryStore::persistent(&root)))
            .shutdown(shutdown)
            .build())
    }

    fn guard(&self) -> RunGuard {
        RunGuard::new(self.shutdown.child_token(), self.options.deadline)
    }

    fn sanitizer(&self, category: DiagramCategory) -> Option<Sanitizer> {
        self.options
            .sanitizer_enabled
            .then(|| Sanitizer::for_category(category))
    }

    fn available(&self, sets: CandidateSets) -> CandidateSets {
        self.availability.ensure_fresh();
        CandidateSets {
            ideation: self.availability.filter(&sets.ideation),
            rendering: self.availability.filter(&sets.rendering),
            validation: self.availability.filter(&sets.validation),
        }
    }

    /// Lock a diagram for editing and read its current state under the lock.
    async fn lock_diagram(
        &self,
        diagram_id: &str,
    ) -> Result<(OwnedMutexGuard<()>, DiagramArtifact), PipelineError> {
        // Unknown ids never get a lock entry.
        self.get_diagram(diagram_id)?;
        let lock = self
            .edit_locks
            .lock()
            .entry(diagram_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        let diagram = self.get_diagram(diagram_id)?;
        Ok((guard, diagram))
    }

    fn class_context(&self, project_id: &str) -> Option<String> {
        match self.diagrams.list_project(project_id) {
            Ok(diagrams) => diagrams
                .into_iter()
                .filter(|d| d.category == DiagramCategory::Class && !d.payload.trim().is_empty())
                .max_by_key(|d| d.updated_at)
                .map(|d| d.payload),
            Err(e) => {
                tracing::warn!(project_id, error = %e, "cannot load class diagram context");
                None
            }
        }
    }

    /// Natural-language request to a validated, stored diagram.
    pub async fn generate_diagram(
        &self,
        request: GenerationRequest,
    ) -> Result<DiagramResult, PipelineError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(PipelineError::InvalidRequest("prompt is required".into()));
        }
        if request.project_id.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("projectId is required".into()));
        }
        let hint = request
            .category_hint
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        if let Some(hint) = hint {
            hint.parse::<DiagramCategory>()
                .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
        }

        let category = router::classify(prompt, hint);
        let guard = self.guard();
        tracing::info!(%category, project_id = %request.project_id, "generating diagram");

        let context = if self.prompts.wants_class_context(category) {
            self.class_context(&request.project_id)
        } else {
            None
        };
        let bundle = self
            .prompts
            .pipeline_prompts(category, prompt, context.as_deref());
        let sets =
            self.available(CandidateSets::resolve(&self.options.candidates, &request.overrides));

        let rendered =
            stages::render(&self.invoker, category, prompt, &bundle, &sets, &guard).await?;
        let mut payload = rendered.payload;
        if let Some(checked) = self
            .llm_validate(&sets.validation, prompt, rendered.notes.as_deref(), &payload, &guard)
            .await
        {
            payload = checked;
        }

        let sanitizer = self.sanitizer(category);
        if let Some(sanitizer) = sanitizer {
            payload = sanitizer.sanitize(&payload);
        }

        let repair = InvokerRepair {
            invoker: &self.invoker,
            candidates: &sets.rendering,
            guard: &guard,
        };
        let report = RepairLoop::new(self.validator.as_ref(), &repair)
            .max_attempts(self.options.max_repair_attempts)
            .sanitizer(sanitizer)
            .validate_and_fix(&payload, Some(category), prompt, &guard)
            .await;

        let name = match request.name.trim() {
            "" => format!("Untitled {} diagram", category.as_str().replace('_', " ")),
            n => n.to_string(),
        };
        let mut diagram = DiagramArtifact::new(
            request.project_id.trim(),
            request.owner_id.trim(),
            name,
            category,
            report.payload,
        );
        diagram.explanation = rendered.remainder;
        self.diagrams.put(&diagram)?;

        tracing::info!(
            diagram_id = %diagram.id,
            outcome = ?report.outcome,
            repairs = report.repairs,
            "diagram stored"
        );
        Ok(DiagramResult {
            diagram,
            validation: report.outcome,
            attempts: report.attempts,
            repairs: report.repairs,
        })
    }

    /// Optional second-opinion pass. Only a well-formed answer replaces the candidate.
    async fn llm_validate(
        &self,
        candidates: &[String],
        prompt: &str,
        notes: Option<&str>,
        payload: &str,
        guard: &RunGuard,
    ) -> Option<String> {
        if candidates.is_empty() || payload.is_empty() {
            return None;
        }
        let request = prompt::validation_prompt(prompt, notes, payload);
        match self
            .invoker
            .invoke(Stage::Validation, candidates, &request, guard)
            .await
        {
            Ok(generated) => {
                let checked = extract(&generated.text).payload;
                if looks_well_formed(&checked) {
                    Some(checked)
                } else {
                    tracing::info!(backend = %generated.backend, "validation answer discarded");
                    None
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "llm validation skipped");
                None
            }
        }
    }

    /// Apply free-form feedback to a stored diagram and record the edit.
    pub async fn refine_diagram(
        &self,
        diagram_id: &str,
        feedback: &str,
        actor_id: Option<&str>,
    ) -> Result<DiagramResult, PipelineError> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(PipelineError::InvalidRequest("feedback is required".into()));
        }
        let (_edit, mut diagram) = self.lock_diagram(diagram_id).await?;
        let before = diagram.payload.clone();
        let guard = self.guard();
        let sets = self.available(self.options.candidates.clone());

        let raw = match self
            .invoker
            .refine(&sets.rendering, &before, feedback, &guard)
            .await
        {
            Ok(generated) => generated.text,
            Err(RepairError::Unsupported) => {
                let request = prompt::refine_request(&before, feedback);
                self.invoker
                    .invoke(Stage::Rendering, &sets.rendering, &request, &guard)
                    .await?
                    .text
            }
            Err(RepairError::Failed(e)) => return Err(e),
        };
        let extracted = extract(&raw);
        let mut payload = if extracted.is_empty() {
            raw.trim().to_string()
        } else {
            extracted.payload
        };

        let sanitizer = self.sanitizer(diagram.category);
        if let Some(sanitizer) = sanitizer {
            payload = sanitizer.sanitize(&payload);
        }
        let repair = InvokerRepair {
            invoker: &self.invoker,
            candidates: &sets.rendering,
            guard: &guard,
        };
        let report = RepairLoop::new(self.validator.as_ref(), &repair)
            .max_attempts(self.options.max_repair_attempts)
            .sanitizer(sanitizer)
            .validate_and_fix(&payload, Some(diagram.category), feedback, &guard)
            .await;

        diagram.set_payload(report.payload);
        if !extracted.remainder.is_empty() {
            diagram.explanation = extracted.remainder;
        }
        self.diagrams.put(&diagram)?;

        let command_id = uuid::Uuid::new_v4().to_string();
        self.history.record_edit(EditRecord {
            diagram_id: &diagram.id,
            actor_id: actor_id.unwrap_or(&diagram.owner_id),
            project_id: &diagram.project_id,
            command_id: &command_id,
            timestamp: Utc::now().timestamp_millis(),
            payload_before: &before,
            payload_after: &diagram.payload,
        })?;
        tracing::info!(diagram_id, %command_id, repairs = report.repairs, "diagram refined");

        Ok(DiagramResult {
            diagram,
            validation: report.outcome,
            attempts: report.attempts,
            repairs: report.repairs,
        })
    }

    pub async fn undo(&self, diagram_id: &str) -> Result<HistoryMove, PipelineError> {
        let (_edit, diagram) = self.lock_diagram(diagram_id).await?;
        let restored = self
            .history
            .undo(diagram_id)?
            .ok_or(PipelineError::NothingToUndo)?;
        self.restore(diagram, restored, "Undo successful")
    }

    pub async fn redo(&self, diagram_id: &str) -> Result<HistoryMove, PipelineError> {
        let (_edit, diagram) = self.lock_diagram(diagram_id).await?;
        let restored = self
            .history
            .redo(diagram_id)?
            .ok_or(PipelineError::NothingToRedo)?;
        self.restore(diagram, restored, "Redo successful")
    }

    fn restore(
        &self,
        mut diagram: DiagramArtifact,
        restored: Restored,
        message: &str,
    ) -> Result<HistoryMove, PipelineError> {
        diagram.set_payload(restored.payload.clone());
        self.diagrams.put(&diagram)?;
        tracing::info!(diagram_id = %restored.diagram_id, command_id = %restored.command_id, "{message}");
        Ok(HistoryMove {
            diagram_id: restored.diagram_id,
            command_id: restored.command_id,
            payload: restored.payload,
            message: message.to_string(),
        })
    }

    /// Short natural-language explanation of a stored diagram.
    pub async fn explain_diagram(&self, diagram_id: &str) -> Result<DiagramText, PipelineError> {
        let diagram = self.get_diagram(diagram_id)?;
        let request = prompt::explain_request(&diagram.payload);
        self.describe(Stage::Explanation, &diagram, &request).await
    }

    /// Source code implementing a stored diagram, in `language` when given.
    pub async fn generate_code(
        &self,
        diagram_id: &str,
        language: Option<&str>,
    ) -> Result<DiagramText, PipelineError> {
        let diagram = self.get_diagram(diagram_id)?;
        let request = prompt::code_request(&diagram.payload, language);
        self.describe(Stage::CodeGeneration, &diagram, &request).await
    }

    /// One fallback call over the rendering candidates about an existing diagram.
    async fn describe(
        &self,
        stage: Stage,
        diagram: &DiagramArtifact,
        request: &str,
    ) -> Result<DiagramText, PipelineError> {
        if diagram.payload.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(format!(
                "diagram {} has no PlantUML",
                diagram.id
            )));
        }
        let guard = self.guard();
        let sets = self.available(self.options.candidates.clone());
        let generated = self
            .invoker
            .invoke(stage, &sets.rendering, request, &guard)
            .await?;
        tracing::info!(diagram_id = %diagram.id, %stage, backend = %generated.backend, "diagram described");
        Ok(DiagramText {
            diagram_id: diagram.id.clone(),
            backend: generated.backend,
            text: generated.text.trim().to_string(),
        })
    }

    pub fn history(&self, diagram_id: &str) -> Result<Vec<CommandSnapshot>, PipelineError> {
        Ok(self.history.snapshots(diagram_id)?)
    }

    pub fn get_diagram(&self, diagram_id: &str) -> Result<DiagramArtifact, PipelineError> {
        self.diagrams
            .get(diagram_id)?
            .ok_or_else(|| PipelineError::DiagramNotFound(diagram_id.to_string()))
    }

    pub async fn list_backends(&self) -> BackendListing {
        self.availability.refresh().await;
        BackendListing {
            default_kind: self.options.default_kind,
            ideation: self.options.candidates.ideation.clone(),
            rendering: self.options.candidates.rendering.clone(),
            validation: self.options.candidates.validation.clone(),
            discovered: self.availability.known(),
        }
    }
}
