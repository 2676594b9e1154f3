//! Built-in prompts, used when the catalog leaves a slot empty, plus the prompts the
//! pipeline itself composes (repair feedback, refine, LLM validation).

use umlsmith_core::templates::{NOTES_PLACEHOLDER, PROMPT_PLACEHOLDER};
use umlsmith_core::{rules, DiagramCategory};

pub const REFINE_SYSTEM: &str =
    "You edit PlantUML diagrams. Reply with the complete updated diagram between @startuml and @enduml.";

pub fn default_class_ideation(user_prompt: &str) -> String {
    format!(
        "You are a software analyst. Identify the bounded contexts, entities (with attributes and \
operations), services and relationships of the system below. Answer as compact JSON.\n\n\
System description:\n{user_prompt}"
    )
}

pub fn default_class_rendering() -> String {
    format!(
        "Turn the analysis below into a PlantUML class diagram.\n\
Output only PlantUML between @startuml and @enduml.\n\n\
{rules}\n\n\
Analysis:\n{NOTES_PLACEHOLDER}\n\n\
Request:\n{PROMPT_PLACEHOLDER}\n",
        rules = rules::RULES
    )
}

/// Single-stage prompt for a category the catalog had no template for.
pub fn default_rendering(category: DiagramCategory, user_prompt: &str) -> String {
    let guidance = match category {
        DiagramCategory::Sequence => "Declare participants first, then the messages between them.",
        DiagramCategory::UseCase => "Use actors, use cases and a system boundary rectangle.",
        DiagramCategory::Activity => "Use start/stop, :action; nodes and if/else branches.",
        DiagramCategory::Component => "Use components, interfaces and packages with dependencies.",
        DiagramCategory::State => "Use states, [*] start and end markers and labelled transitions.",
        DiagramCategory::Class | DiagramCategory::Eerd => {
            "Declare every class or entity explicitly and use explicit relationship lines."
        }
    };
    format!(
        "Write a PlantUML {category} diagram for the request below.\n\
{guidance}\n\
Output only PlantUML between @startuml and @enduml.\n\n\
Request:\n{user_prompt}\n",
        category = category.as_str().replace('_', " ")
    )
}

/// Fill the notes and original-prompt placeholders of a rendering template.
pub fn substitute_notes(template: &str, notes: &str, original_prompt: &str) -> String {
    template
        .replace(NOTES_PLACEHOLDER, notes)
        .replace(PROMPT_PLACEHOLDER, original_prompt)
}

/// Feedback handed to the repair step after a failed validation.
pub fn repair_feedback(
    diagnostic: &str,
    category: Option<DiagramCategory>,
    original_prompt: &str,
) -> String {
    let diagnostic = match diagnostic.trim() {
        "" => "Unknown validator error",
        d => d,
    };
    let category = category.map_or("unspecified", DiagramCategory::as_str);
    format!(
        "The PlantUML diagram failed validation with the following error:\n{diagnostic}\n\n\
Diagram type: {category}\n\
Original user request:\n{original_prompt}\n\n\
Please correct ONLY the syntax errors while keeping the semantics intact. \
Respond with valid PlantUML between @startuml and @enduml."
    )
}

/// User message for a refine call: current diagram plus the requested change.
pub fn refine_request(current: &str, feedback: &str) -> String {
    format!(
        "Given this PlantUML diagram:\n\n{current}\n\n\
Apply the following refinement or feedback:\n{feedback}\n\
Return the updated PlantUML code only."
    )
}

pub fn explain_request(payload: &str) -> String {
    format!("Explain this UML model briefly:\n\n{payload}")
}

/// Diagram-to-code prompt. Without a language the model picks one that fits the diagram.
pub fn code_request(payload: &str, language: Option<&str>) -> String {
    let target = match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(language) => format!("Write the code in {language}."),
        None => "Choose a language that fits the diagram.".to_string(),
    };
    format!(
        "Convert the PlantUML diagram into clean, well-structured code. {target} \
Choose reasonable defaults for types and keep output concise.\n\n\
PlantUML:\n{payload}"
    )
}

/// Second-opinion prompt for the optional LLM validation pass.
pub fn validation_prompt(original_prompt: &str, notes: Option<&str>, candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len() + 1024);
    out.push_str(
        "You review PlantUML diagrams. Check the candidate below against the request. \
Fix syntax errors, undeclared endpoints and missing relationships. If it is already \
correct, repeat it unchanged. Output only PlantUML between @startuml and @enduml.\n\n",
    );
    out.push_str("Request:\n");
    out.push_str(original_prompt);
    out.push_str("\n\n");
    if let Some(notes) = notes.filter(|n| !n.trim().is_empty()) {
        out.push_str("Analyst notes:\n");
        out.push_str(notes);
        out.push_str("\n\n");
    }
    out.push_str("Candidate:\n");
    out.push_str(candidate);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_fills_both_placeholders() {
        let filled = substitute_notes(&default_class_rendering(), "{\"entities\":[]}", "a shop");
        assert!(filled.contains("{\"entities\":[]}"));
        assert!(filled.contains("a shop"));
        assert!(!filled.contains(NOTES_PLACEHOLDER));
        assert!(!filled.contains(PROMPT_PLACEHOLDER));
    }

    #[test]
    fn repair_feedback_defaults_blank_parts() {
        let text = repair_feedback("  ", None, "draw a cat");
        assert!(text.contains("Unknown validator error"));
        assert!(text.contains("Diagram type: unspecified"));
        assert!(text.contains("draw a cat"));

        let text = repair_feedback("Syntax Error? (line 3)", Some(DiagramCategory::UseCase), "p");
        assert!(text.contains("Syntax Error? (line 3)"));
        assert!(text.contains("Diagram type: use_case"));
    }

    #[test]
    fn validation_prompt_skips_empty_notes() {
        assert!(!validation_prompt("p", Some(" "), "@startuml\n@enduml").contains("Analyst notes"));
        assert!(validation_prompt("p", Some("n"), "@startuml\n@enduml").contains("Analyst notes:\nn"));
    }

    #[test]
    fn code_request_names_the_language_when_given() {
        let diagram = "@startuml\nclass A\n@enduml";
        assert!(code_request(diagram, Some("Rust")).contains("Write the code in Rust."));
        let open = code_request(diagram, Some("  "));
        assert!(open.contains("Choose a language that fits the diagram."));
        assert!(open.ends_with(diagram));
    }
}
