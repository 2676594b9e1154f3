use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use umlsmith_core::{CandidateOverrides, GenerationRequest, Settings};
use umlsmith_pipeline::{DiagramService, PipelineError};

const DEFAULT_PROJECT: &str = "default";

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct GenerateRequest {
    /// Natural-language description of the diagram to produce
    prompt: String,
    /// Display name stored with the diagram
    #[serde(default)]
    name: Option<String>,
    /// Project the diagram belongs to. Sequence diagrams use the project's class diagram as context. Defaults to "default".
    #[serde(default)]
    project_id: Option<String>,
    /// One of class, sequence, use_case, activity, component, state, eerd. Inferred from the prompt when omitted.
    #[serde(default)]
    diagram_type: Option<String>,
    /// Ordered model ids for the ideation stage, e.g. ["llama3.1:70b", "openai/gpt-4o-mini"]. Replaces the configured list for this call.
    #[serde(default)]
    ideation_models: Option<Vec<String>>,
    /// Ordered model ids for the rendering stage. Replaces the configured list for this call.
    #[serde(default)]
    rendering_models: Option<Vec<String>>,
    /// Ordered model ids for the optional LLM review pass. An empty list disables it for this call.
    #[serde(default)]
    validation_models: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RefineRequest {
    /// ID returned by generate_diagram
    diagram_id: String,
    /// The change to apply, in plain language
    feedback: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DiagramIdRequest {
    /// ID returned by generate_diagram
    diagram_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct CodeRequest {
    /// ID returned by generate_diagram
    diagram_id: String,
    /// Target language, e.g. "rust" or "java". The model picks one when omitted.
    #[serde(default)]
    language: Option<String>,
}

impl GenerateRequest {
    fn into_generation(self, owner: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            name: self.name.unwrap_or_default(),
            project_id: self
                .project_id
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            owner_id: owner.to_string(),
            category_hint: self.diagram_type,
            overrides: CandidateOverrides {
                ideation: self.ideation_models,
                rendering: self.rendering_models,
                validation: self.validation_models,
            },
        }
    }
}

// --- Server ---

#[derive(Clone)]
pub struct UmlsmithServer {
    service: Arc<DiagramService>,
    owner: String,
    tool_router: ToolRouter<Self>,
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    match serde_json::to_string_pretty(value) {
        Ok(json) => Ok(CallToolResult::success(vec![Content::text(json)])),
        Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
            "Failed to encode result: {e}"
        ))])),
    }
}

fn error_result(e: PipelineError) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
}

#[tool_router]
impl UmlsmithServer {
    pub fn new(service: Arc<DiagramService>, owner: String) -> Self {
        Self {
            service,
            owner,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Generate a PlantUML diagram from a natural-language prompt. Routes to a diagram type, falls back across candidate models, cleans the output, validates it with PlantUML when available and repairs syntax errors. Returns {diagram: {id, projectId, name, category, payload, explanation, createdAt, updatedAt}, validation, attempts, repairs}."
    )]
    async fn generate_diagram(
        &self,
        Parameters(req): Parameters<GenerateRequest>,
    ) -> Result<CallToolResult, McpError> {
        let request = req.into_generation(&self.owner);
        match self.service.generate_diagram(request).await {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Apply feedback to a stored diagram. The result is validated and repaired like a generation, and the change is recorded so undo can revert it."
    )]
    async fn refine_diagram(
        &self,
        Parameters(req): Parameters<RefineRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .service
            .refine_diagram(&req.diagram_id, &req.feedback, Some(&self.owner))
            .await
        {
            Ok(result) => json_result(&result),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Revert the last refinement of a diagram. Returns {diagramId, commandId, payload, message}.")]
    async fn undo(&self, Parameters(req): Parameters<DiagramIdRequest>) -> Result<CallToolResult, McpError> {
        match self.service.undo(&req.diagram_id).await {
            Ok(moved) => json_result(&moved),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Re-apply the refinement most recently reverted by undo. A refinement made after undo discards what could be redone.")]
    async fn redo(&self, Parameters(req): Parameters<DiagramIdRequest>) -> Result<CallToolResult, McpError> {
        match self.service.redo(&req.diagram_id).await {
            Ok(moved) => json_result(&moved),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Get a stored diagram with its current PlantUML payload")]
    fn get_diagram(
        &self,
        Parameters(req): Parameters<DiagramIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.service.get_diagram(&req.diagram_id) {
            Ok(diagram) => json_result(&diagram),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "List the edit history of a diagram, oldest first. Exactly one entry has isCurrent=true once the diagram has been refined."
    )]
    fn get_history(
        &self,
        Parameters(req): Parameters<DiagramIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.service.history(&req.diagram_id) {
            Ok(history) if history.is_empty() => Ok(CallToolResult::success(vec![Content::text(
                "No edits recorded. Use refine_diagram to change the diagram.",
            )])),
            Ok(history) => json_result(&history),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Explain a stored diagram in a few plain sentences. Returns {diagramId, backend, text}.")]
    async fn explain_diagram(
        &self,
        Parameters(req): Parameters<DiagramIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.service.explain_diagram(&req.diagram_id).await {
            Ok(text) => json_result(&text),
            Err(e) => error_result(e),
        }
    }

    #[tool(
        description = "Generate source code that implements a stored diagram, in the requested language when given. Returns {diagramId, backend, text}."
    )]
    async fn generate_code(
        &self,
        Parameters(req): Parameters<CodeRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .service
            .generate_code(&req.diagram_id, req.language.as_deref())
            .await
        {
            Ok(text) => json_result(&text),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Show the configured model lists per stage and the models the local Ollama host serves")]
    async fn list_backends(&self) -> Result<CallToolResult, McpError> {
        let listing = self.service.list_backends().await;
        json_result(&listing)
    }
}

#[tool_handler]
impl ServerHandler for UmlsmithServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = format!(
            "{}\n\n## Workflow\n{}\n\n## PlantUML Rules\n{}",
            INSTRUCTIONS,
            umlsmith_core::rules::WORKFLOW,
            umlsmith_core::rules::RULES
        );
        ServerInfo {
            instructions: Some(instructions.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

const INSTRUCTIONS: &str = "umlsmith turns natural-language requests into PlantUML diagrams \
(class, sequence, use_case, activity, component, state, eerd). Diagrams are stored with an \
id; refine them with feedback instead of regenerating, and use undo/redo to move through \
the edit history.";

fn init_tracing() {
    // stdout carries the MCP transport.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("umlsmith_core=info,umlsmith_pipeline=info,umlsmith_mcp=info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_settings() -> Settings {
    umlsmith_core::read_settings().with_env()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let settings = load_settings();
    let shutdown = CancellationToken::new();
    let service = DiagramService::from_settings(
        &settings,
        umlsmith_core::data_dir(),
        shutdown.clone(),
    )?;
    tracing::info!(
        backend = %settings.backend,
        rendering = ?settings.uml_models,
        "umlsmith-mcp starting"
    );

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling in-flight requests");
            on_signal.cancel();
        }
    });

    let server = UmlsmithServer::new(Arc::new(service), settings.owner.clone())
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "MCP server error"))?;
    server.waiting().await?;
    shutdown.cancel();
    Ok(())
}
