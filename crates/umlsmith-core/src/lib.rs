pub mod error;
pub mod history;
pub mod rules;
pub mod templates;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use error::StoreError;
pub use history::{CommandSnapshot, EditRecord, HistoryStore, Restored};
pub use templates::{BuiltinCatalog, PromptCatalog};

// --- Types ---

/// Diagram grammar requested by the user. Closed set: adding one is a variant addition.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DiagramCategory {
    Class,
    Sequence,
    UseCase,
    Activity,
    Component,
    State,
    Eerd,
}

impl DiagramCategory {
    pub const ALL: [DiagramCategory; 7] = [
        DiagramCategory::Class,
        DiagramCategory::Sequence,
        DiagramCategory::UseCase,
        DiagramCategory::Activity,
        DiagramCategory::Component,
        DiagramCategory::State,
        DiagramCategory::Eerd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiagramCategory::Class => "class",
            DiagramCategory::Sequence => "sequence",
            DiagramCategory::UseCase => "use_case",
            DiagramCategory::Activity => "activity",
            DiagramCategory::Component => "component",
            DiagramCategory::State => "state",
            DiagramCategory::Eerd => "eerd",
        }
    }

    /// Lenient token parse used for hints and in-prompt markers.
    pub fn parse(token: &str) -> Option<Self> {
        let normalized = token.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "class" => Some(DiagramCategory::Class),
            "sequence" => Some(DiagramCategory::Sequence),
            "use_case" | "usecase" => Some(DiagramCategory::UseCase),
            "activity" => Some(DiagramCategory::Activity),
            "component" => Some(DiagramCategory::Component),
            "state" | "state_machine" => Some(DiagramCategory::State),
            "eerd" | "erd" | "er" | "entity_relationship" => Some(DiagramCategory::Eerd),
            _ => None,
        }
    }

    /// Categories whose grammar is class-like (`class`/`interface` declarations).
    pub fn is_class_like(self) -> bool {
        matches!(self, DiagramCategory::Class | DiagramCategory::Eerd)
    }
}

impl fmt::Display for DiagramCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown diagram type: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for DiagramCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Prompt bundle for one category, produced by a [`PromptCatalog`].
///
/// `category` is the pipeline the bundle is written for, which may differ from the
/// requested category (EERD prompts ride the class pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePrompts {
    pub category: DiagramCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideation_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering_prompt_template: Option<String>,
    #[serde(default)]
    pub uses_notes_substitution: bool,
}

impl PipelinePrompts {
    /// A bundle with no catalog text: the pipeline falls back to its built-in prompts.
    pub fn empty(category: DiagramCategory) -> Self {
        Self {
            category,
            ideation_prompt: None,
            rendering_prompt_template: None,
            uses_notes_substitution: false,
        }
    }
}

/// Per-stage candidate overrides supplied with a request. `None` keeps the configured list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideation: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub name: String,
    pub project_id: String,
    pub owner_id: String,
    /// Raw category hint; classified by the router, never trusted blindly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_hint: Option<String>,
    #[serde(default)]
    pub overrides: CandidateOverrides,
}

/// A persisted diagram. The pipeline only produces and consumes `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramArtifact {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub name: String,
    pub category: DiagramCategory,
    pub payload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub explanation: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiagramArtifact {
    pub fn new(
        project_id: impl Into<String>,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        category: DiagramCategory,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            owner_id: owner_id.into(),
            name: name.into(),
            category,
            payload: payload.into(),
            explanation: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the payload and bump `updated_at`.
    pub fn set_payload(&mut self, payload: impl Into<String>) {
        self.payload = payload.into();
        self.updated_at = Utc::now();
    }
}

// --- Storage ---

/// Resolve the global data directory (~/.umlsmith/).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".umlsmith")
}

/// Write `data` to `path` through a temp file + rename so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, data: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, data).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Read and decode a JSON record. Missing files are `Ok(None)`.
/// Record ids become file names, so only `[A-Za-z0-9_-]` is accepted.
pub(crate) fn checked_id(id: &str) -> Result<&str, StoreError> {
    let ok = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(id)
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Diagram-record persistence consumed by the pipeline.
pub trait DiagramRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<DiagramArtifact>, StoreError>;
    fn put(&self, diagram: &DiagramArtifact) -> Result<(), StoreError>;
    fn list_project(&self, project_id: &str) -> Result<Vec<DiagramArtifact>, StoreError>;
}

/// One JSON file per diagram under `<root>/diagrams/`.
#[derive(Debug, Clone)]
pub struct FileDiagramStore {
    root: PathBuf,
}

impl FileDiagramStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self) -> PathBuf {
        self.root.join("diagrams")
    }

    fn path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.dir().join(format!("{}.json", checked_id(id)?)))
    }
}

impl DiagramRepository for FileDiagramStore {
    fn get(&self, id: &str) -> Result<Option<DiagramArtifact>, StoreError> {
        read_json(&self.path(id)?)
    }

    fn put(&self, diagram: &DiagramArtifact) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(diagram)?;
        write_atomic(&self.path(&diagram.id)?, &json)
    }

    fn list_project(&self, project_id: &str) -> Result<Vec<DiagramArtifact>, StoreError> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut diagrams = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<DiagramArtifact>(&path) {
                Ok(Some(d)) if d.project_id == project_id => diagrams.push(d),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable diagram record"),
            }
        }
        diagrams.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(diagrams)
    }
}

/// Process-local diagram store.
#[derive(Debug, Default)]
pub struct MemoryDiagramStore {
    items: DashMap<String, DiagramArtifact>,
}

impl MemoryDiagramStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiagramRepository for MemoryDiagramStore {
    fn get(&self, id: &str) -> Result<Option<DiagramArtifact>, StoreError> {
        Ok(self.items.get(id).map(|d| d.clone()))
    }

    fn put(&self, diagram: &DiagramArtifact) -> Result<(), StoreError> {
        self.items.insert(diagram.id.clone(), diagram.clone());
        Ok(())
    }

    fn list_project(&self, project_id: &str) -> Result<Vec<DiagramArtifact>, StoreError> {
        let mut diagrams: Vec<DiagramArtifact> = self
            .items
            .iter()
            .filter(|d| d.project_id == project_id)
            .map(|d| d.clone())
            .collect();
        diagrams.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(diagrams)
    }
}

// --- Settings ---

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
pub const DEFAULT_IDEATION_MODELS: &str = "deepseek-coder-v2:latest, llama3.1:70b";
pub const DEFAULT_UML_MODELS: &str = "llama3-code:latest, codellama:7b";

/// Process configuration: `~/.umlsmith/settings.json` overlaid by environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Backend kind used for bare model names ("ollama", "openai", ...).
    pub backend: String,
    /// API keys keyed by backend kind.
    pub api_keys: HashMap<String, String>,
    pub ollama_host: String,
    pub ideation_models: Vec<String>,
    pub uml_models: Vec<String>,
    pub validation_models: Vec<String>,
    /// Per backend call.
    pub timeout_secs: u64,
    /// Outer budget for a whole generate/refine request. `None` = unbounded.
    pub deadline_secs: Option<u64>,
    pub plantuml_jar: Option<String>,
    pub java_cmd: String,
    pub validator_timeout_secs: u64,
    pub max_repair_attempts: u32,
    pub sanitizer_enabled: bool,
    pub discovery_ttl_secs: u64,
    pub debug_previews: bool,
    /// Owner recorded on diagrams created through this process.
    pub owner: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            api_keys: HashMap::new(),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            ideation_models: parse_candidates(DEFAULT_IDEATION_MODELS),
            uml_models: parse_candidates(DEFAULT_UML_MODELS),
            validation_models: vec![],
            timeout_secs: 180,
            deadline_secs: None,
            plantuml_jar: None,
            java_cmd: "java".to_string(),
            validator_timeout_secs: 60,
            max_repair_attempts: 5,
            sanitizer_enabled: true,
            discovery_ttl_secs: 60,
            debug_previews: false,
            owner: "local".to_string(),
        }
    }
}

impl Settings {
    /// Overlay environment variables on top of `self`. Unparseable values are ignored.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::with_env`] with an injectable lookup.
    pub fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("UMLSMITH_BACKEND") {
            self.backend = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = non_empty("UMLSMITH_API_KEY") {
            self.api_keys.insert(self.backend.clone(), v);
        }
        for (kind, key) in [
            ("openai", "OPENAI_API_KEY"),
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("google", "GOOGLE_API_KEY"),
            ("groq", "GROQ_API_KEY"),
            ("mistral", "MISTRAL_API_KEY"),
            ("deepseek", "DEEPSEEK_API_KEY"),
            ("xai", "XAI_API_KEY"),
        ] {
            if let Some(v) = non_empty(key) {
                self.api_keys.entry(kind.to_string()).or_insert(v);
            }
        }
        if let Some(v) = non_empty("OLLAMA_HOST") {
            self.ollama_host = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = non_empty("OLLAMA_IDEATION_MODELS") {
            self.ideation_models = parse_candidates(&v);
        }
        if let Some(v) = non_empty("OLLAMA_UML_MODELS") {
            self.uml_models = parse_candidates(&v);
        }
        if let Some(v) = non_empty("OLLAMA_VALIDATION_MODELS") {
            self.validation_models = parse_candidates(&v);
        }
        if let Some(v) = non_empty("UMLSMITH_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.timeout_secs = v;
        }
        if let Some(v) = non_empty("UMLSMITH_DEADLINE_SECS").and_then(|v| v.trim().parse().ok()) {
            self.deadline_secs = Some(v).filter(|secs: &u64| *secs > 0);
        }
        if let Some(v) = non_empty("PLANTUML_JAR_PATH").or_else(|| non_empty("PLANTUML_JAR")) {
            self.plantuml_jar = Some(v);
        }
        if let Some(v) = non_empty("PLANTUML_JAVA_CMD") {
            self.java_cmd = v;
        }
        if let Some(v) = non_empty("PLANTUML_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.validator_timeout_secs = v;
        }
        if let Some(v) =
            non_empty("UMLSMITH_MAX_REPAIR_ATTEMPTS").and_then(|v| v.trim().parse().ok())
        {
            self.max_repair_attempts = v;
        }
        if let Some(v) = non_empty("ENABLE_PLANTUML_SANITIZER") {
            self.sanitizer_enabled = is_truthy(&v);
        }
        if let Some(v) =
            non_empty("UMLSMITH_DISCOVERY_TTL_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.discovery_ttl_secs = v;
        }
        if let Some(v) = non_empty("OLLAMA_PIPELINE_DEBUG") {
            self.debug_previews = is_truthy(&v);
        }
        self
    }

    pub fn api_key(&self, kind: &str) -> Option<&str> {
        self.api_keys
            .get(kind)
            .map(String::as_str)
            .filter(|k| !k.is_empty())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split a comma- or semicolon-separated model list, dropping blanks.
pub fn parse_candidates(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Read settings from disk. A missing or malformed file yields the defaults.
pub fn read_settings() -> Settings {
    match read_json::<Settings>(&settings_path()) {
        Ok(Some(settings)) => settings,
        Ok(None) => Settings::default(),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed settings file");
            Settings::default()
        }
    }
}

pub fn write_settings(settings: &Settings) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(settings)?;
    write_atomic(&settings_path(), &json)
}
