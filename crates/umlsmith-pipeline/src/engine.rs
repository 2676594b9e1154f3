use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage;
use serde::{Deserialize, Serialize};

use umlsmith_core::Settings;

use crate::error::BackendError;
use crate::prompt;

/// Supported text-generation services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAI,
    Anthropic,
    Google,
    Groq,
    Mistral,
    DeepSeek,
    XAI,
}

impl BackendKind {
    pub const ALL: [BackendKind; 8] = [
        BackendKind::Ollama,
        BackendKind::OpenAI,
        BackendKind::Anthropic,
        BackendKind::Google,
        BackendKind::Groq,
        BackendKind::Mistral,
        BackendKind::DeepSeek,
        BackendKind::XAI,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::OpenAI => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Google => "google",
            BackendKind::Groq => "groq",
            BackendKind::Mistral => "mistral",
            BackendKind::DeepSeek => "deepseek",
            BackendKind::XAI => "xai",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(BackendKind::Ollama),
            "openai" | "azure-openai" | "azure_openai" => Some(BackendKind::OpenAI),
            "anthropic" | "claude" => Some(BackendKind::Anthropic),
            "google" | "gemini" => Some(BackendKind::Google),
            "groq" => Some(BackendKind::Groq),
            "mistral" => Some(BackendKind::Mistral),
            "deepseek" => Some(BackendKind::DeepSeek),
            "xai" | "grok" | "gronk" => Some(BackendKind::XAI),
            _ => None,
        }
    }

    fn llm_backend(self) -> LLMBackend {
        match self {
            BackendKind::Ollama => LLMBackend::Ollama,
            BackendKind::OpenAI => LLMBackend::OpenAI,
            BackendKind::Anthropic => LLMBackend::Anthropic,
            BackendKind::Google => LLMBackend::Google,
            BackendKind::Groq => LLMBackend::Groq,
            BackendKind::Mistral => LLMBackend::Mistral,
            BackendKind::DeepSeek => LLMBackend::DeepSeek,
            BackendKind::XAI => LLMBackend::XAI,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate identifier: `kind/model`, or a bare model name on the default kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId {
    pub kind: BackendKind,
    pub model: String,
}

impl BackendId {
    pub fn parse(raw: &str, default_kind: BackendKind) -> Result<Self, BackendError> {
        let raw = raw.trim();
        // Only a known kind counts as a prefix; Ollama model names may contain '/'.
        let (kind, model) = match raw.split_once('/') {
            Some((prefix, rest)) => match BackendKind::parse(prefix) {
                Some(kind) => (kind, rest.trim()),
                None => (default_kind, raw),
            },
            None => (default_kind, raw),
        };
        if model.is_empty() {
            return Err(BackendError::InvalidId(raw.to_string()));
        }
        Ok(Self {
            kind,
            model: model.to_string(),
        })
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.model)
    }
}

/// Connection settings for one backend kind. Unset fields use the `llm` crate defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_kind: BackendKind,
    pub backends: HashMap<BackendKind, BackendConfig>,
    /// Timeout for the Ollama model-listing request.
    pub discovery_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let default_kind = BackendKind::parse(&settings.backend).unwrap_or_else(|| {
            tracing::warn!(backend = %settings.backend, "unknown backend kind, using ollama");
            BackendKind::Ollama
        });

        let mut backends = HashMap::new();
        for kind in BackendKind::ALL {
            let mut config = BackendConfig {
                api_key: settings.api_key(kind.as_str()).map(str::to_string),
                ..BackendConfig::default()
            };
            if kind == BackendKind::Ollama {
                config.base_url = Some(settings.ollama_host.clone());
            }
            backends.insert(kind, config);
        }

        Self {
            default_kind,
            backends,
            discovery_timeout: Duration::from_secs(5),
        }
    }

    pub fn backend(&self, kind: BackendKind) -> BackendConfig {
        self.backends.get(&kind).cloned().unwrap_or_default()
    }

    fn ollama_host(&self) -> String {
        self.backend(BackendKind::Ollama)
            .base_url
            .unwrap_or_else(|| umlsmith_core::DEFAULT_OLLAMA_HOST.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// The generation services the pipeline consumes.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        backend: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, BackendError>;

    /// Model names the local host can serve. `Unsupported` means "no discovery".
    async fn list_backends(&self) -> Result<Vec<String>, BackendError> {
        Err(BackendError::Unsupported)
    }

    /// Rewrite `current` according to `feedback`.
    async fn refine(
        &self,
        _backend: &str,
        _current: &str,
        _feedback: &str,
        _timeout: Duration,
    ) -> Result<String, BackendError> {
        Err(BackendError::Unsupported)
    }
}

/// [`TextGenerator`] over the `llm` crate, with Ollama discovery through its HTTP API.
pub struct LlmRunner {
    config: EngineConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl LlmRunner {
    pub fn new(config: EngineConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.discovery_timeout)
            .build()
            .map_err(|e| BackendError::Build(e.to_string()))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn chat(&self, id: &BackendId, system: Option<&str>, user_msg: &str) -> Result<String, BackendError> {
        let backend = self.config.backend(id.kind);

        let mut builder = LLMBuilder::new()
            .backend(id.kind.llm_backend())
            .model(&id.model);

        if let Some(system) = system {
            builder = builder.system(system);
        }
        if let Some(key) = backend.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.api_key(key);
        }
        if let Some(url) = &backend.base_url {
            builder = builder.base_url(url);
        }
        if let Some(temperature) = backend.temperature {
            builder = builder.temperature(temperature);
        }

        let llm = builder
            .build()
            .map_err(|e| BackendError::Build(e.to_string()))?;

        let messages = vec![ChatMessage::user().content(user_msg).build()];

        let response = llm
            .chat(&messages)
            .await
            .map_err(|e| BackendError::Chat(e.to_string()))?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(BackendError::Empty),
        }
    }
}

#[async_trait]
impl TextGenerator for LlmRunner {
    async fn generate(
        &self,
        backend: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let id = BackendId::parse(backend, self.config.default_kind)?;
        tracing::debug!(backend = %id, prompt_len = prompt.len(), "sending prompt");
        tokio::time::timeout(timeout, self.chat(&id, None, prompt))
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
    }

    async fn list_backends(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.config.ollama_host());
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BackendError::Discovery(e.to_string()))?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Discovery(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn refine(
        &self,
        backend: &str,
        current: &str,
        feedback: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let id = BackendId::parse(backend, self.config.default_kind)?;
        let user_msg = prompt::refine_request(current, feedback);
        tokio::time::timeout(
            timeout,
            self.chat(&id, Some(prompt::REFINE_SYSTEM), &user_msg),
        )
        .await
        .map_err(|_| BackendError::Timeout(timeout))?
    }
}
