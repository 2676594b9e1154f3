//! Per-category prompt catalog.
//!
//! The pipeline treats these strings as opaque. The only contract is the pair of
//! placeholders below: a rendering template that contains [`NOTES_PLACEHOLDER`] gets the
//! ideation output substituted in, and [`PROMPT_PLACEHOLDER`] gets the user prompt.

use crate::{rules, DiagramCategory, PipelinePrompts};

pub const NOTES_PLACEHOLDER: &str = "{analyst_notes}";
pub const PROMPT_PLACEHOLDER: &str = "{original_prompt}";

/// Resolves the prompt bundle for a category.
pub trait PromptCatalog: Send + Sync {
    /// Whether the category's prompts want the project's class diagram as context.
    fn wants_class_context(&self, _category: DiagramCategory) -> bool {
        false
    }

    fn pipeline_prompts(
        &self,
        category: DiagramCategory,
        user_prompt: &str,
        class_context: Option<&str>,
    ) -> PipelinePrompts;
}

/// The prompt set shipped with umlsmith.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinCatalog;

impl PromptCatalog for BuiltinCatalog {
    fn wants_class_context(&self, category: DiagramCategory) -> bool {
        category == DiagramCategory::Sequence
    }

    fn pipeline_prompts(
        &self,
        category: DiagramCategory,
        user_prompt: &str,
        class_context: Option<&str>,
    ) -> PipelinePrompts {
        match category {
            DiagramCategory::Class => PipelinePrompts {
                category: DiagramCategory::Class,
                ideation_prompt: Some(class_ideation(user_prompt)),
                rendering_prompt_template: Some(class_rendering()),
                uses_notes_substitution: true,
            },
            // EERD rides the class pipeline: JSON entity model first, then PlantUML.
            DiagramCategory::Eerd => PipelinePrompts {
                category: DiagramCategory::Class,
                ideation_prompt: Some(eerd_ideation(user_prompt)),
                rendering_prompt_template: Some(eerd_rendering()),
                uses_notes_substitution: true,
            },
            DiagramCategory::Sequence => single(category, sequence(user_prompt, class_context)),
            DiagramCategory::UseCase => single(category, use_case(user_prompt)),
            DiagramCategory::Activity => single(category, activity(user_prompt)),
            DiagramCategory::Component => single(category, component(user_prompt)),
            DiagramCategory::State => single(category, state(user_prompt)),
        }
    }
}

fn single(category: DiagramCategory, rendering: String) -> PipelinePrompts {
    PipelinePrompts {
        category,
        ideation_prompt: None,
        rendering_prompt_template: Some(rendering),
        uses_notes_substitution: false,
    }
}

const OUTPUT_ONLY: &str = "Output ONLY valid PlantUML wrapped by @startuml and @enduml, \
with no markdown fences and no commentary.\n";

fn class_ideation(user_prompt: &str) -> String {
    format!(
        "You are a senior software architect.\n\
Describe the domain model of the system below as strict JSON. Do not write explanations.\n\n\
JSON format:\n\
{{\n\
  \"boundedContexts\": [{{\n\
    \"name\": \"string\",\n\
    \"entities\": [{{\"name\": \"string\", \"attributes\": [{{\"name\": \"string\", \"type\": \"string\"}}], \
\"operations\": [{{\"name\": \"string\"}}]}}],\n\
    \"services\": [{{\"name\": \"string\", \"operations\": [{{\"name\": \"string\"}}]}}],\n\
    \"relationships\": [{{\"from\": \"string\", \"to\": \"string\", \
\"type\": \"association|aggregation|composition|inheritance\"}}]\n\
  }}]\n\
}}\n\n\
System description:\n{user_prompt}"
    )
}

fn class_rendering() -> String {
    format!(
        "You are an expert PlantUML class-diagram generator.\n\
Convert the JSON domain model below into a PlantUML class diagram.\n\
{OUTPUT_ONLY}\
Mapping:\n\
- entities -> class; services -> class with <<service>> stereotype\n\
- attributes -> fields; operations -> methods\n\
- association -> A --> B; aggregation -> A o-- B; composition -> A *-- B; inheritance -> A <|-- B\n\n\
Rules:\n{rules}\n\n\
JSON domain model:\n{NOTES_PLACEHOLDER}\n\n\
Original request:\n{PROMPT_PLACEHOLDER}\n",
        rules = rules::RULES
    )
}

fn eerd_ideation(user_prompt: &str) -> String {
    format!(
        "You are a data modeling expert.\n\
Describe the entities of an Enhanced Entity Relationship Diagram for the system below as \
strict JSON. Do not write explanations.\n\n\
JSON format:\n\
{{\n\
  \"entities\": [{{\"name\": \"string\", \"attributes\": [{{\"name\": \"string\", \"type\": \"string\", \
\"role\": \"pk|fk|regular\"}}], \"constraints\": [{{\"name\": \"string\", \"columns\": [\"string\"]}}], \
\"subtypes\": [\"string\"]}}],\n\
  \"relationships\": [{{\"from\": \"string\", \"to\": \"string\", \
\"type\": \"identifying|non_identifying|inheritance\", \"cardinalityFrom\": \"0..1|1|0..*|1..*\", \
\"cardinalityTo\": \"0..1|1|0..*|1..*\"}}]\n\
}}\n\n\
System description:\n{user_prompt}"
    )
}

fn eerd_rendering() -> String {
    format!(
        "You are an expert PlantUML author emulating Enhanced Entity Relationship Diagrams \
with entity syntax.\n\
{OUTPUT_ONLY}\
Mapping:\n\
- each entity -> `entity Name {{ ... }}` with PK attributes first marked {{PK}}, FK attributes marked {{FK}}\n\
- separate key attributes, other attributes and constraints with `--`\n\
- constraints -> methods such as `+unique_email(email)`\n\
- identifying -> A *-- B; non_identifying -> A -- B; inheritance -> A <|-- B\n\
- quote cardinalities on both ends: A \"1\" -- \"0..*\" B\n\n\
JSON model:\n{NOTES_PLACEHOLDER}\n"
    )
}

fn sequence(user_prompt: &str, class_context: Option<&str>) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("You are an expert in PlantUML sequence diagrams.\n");
    out.push_str(OUTPUT_ONLY);
    out.push_str("- Define participants explicitly at the top; aliases contain no spaces.\n");
    out.push_str("- Include only participants that send or receive messages.\n");
    out.push_str("- Focus on the key interactions and lifelines.\n\n");
    out.push_str("System description:\n");
    out.push_str(user_prompt);
    out.push('\n');
    if let Some(context) = class_context.filter(|c| !c.trim().is_empty()) {
        out.push_str("\nUse this class diagram of the same project as context for participants and messages:\n");
        out.push_str(context);
        out.push('\n');
    }
    out
}

fn use_case(user_prompt: &str) -> String {
    format!(
        "You are a PlantUML use-case expert.\n\
{OUTPUT_ONLY}\
- Declare actors with `actor` and use cases with `(Name)` or `usecase UC as \"Name\"`.\n\
- Connect actors to use cases with `-->`; use `<|--` for actor generalization and `.>` with \
<<include>>/<<extend>> labels.\n\
- Wrap the system boundary in `rectangle` or `package`; boundary names contain no spaces.\n\n\
Generate the use-case diagram for:\n{user_prompt}\n"
    )
}

fn activity(user_prompt: &str) -> String {
    format!(
        "You are a PlantUML activity-diagram expert.\n\
{OUTPUT_ONLY}\
- Use the new activity syntax: `start`, `:Action;`, `if (cond) then (yes) ... else (no) ... endif`, \
`fork ... fork again ... end fork`, `stop`.\n\
- Use swimlanes `|Actor|` only when several actors take part.\n\n\
Generate the activity diagram for:\n{user_prompt}\n"
    )
}

fn component(user_prompt: &str) -> String {
    format!(
        "You are a PlantUML component-diagram expert.\n\
{OUTPUT_ONLY}\
- Declare components with `component` or `[Name]` and interfaces with `interface` or `()`.\n\
- Group with `package` or `node`; show dependencies with `-->` and provided interfaces with `--`.\n\
- Do not use C4 macros or `!include`.\n\n\
Generate the component diagram for:\n{user_prompt}\n"
    )
}

fn state(user_prompt: &str) -> String {
    format!(
        "You are a UML expert specializing in state machines.\n\
{OUTPUT_ONLY}\
- Use `state` blocks and `[*]` for initial and final states.\n\
- Write transitions as `A --> B : event / action`.\n\
- Avoid class or component keywords.\n\n\
Generate the state diagram for:\n{user_prompt}\n"
    )
}
