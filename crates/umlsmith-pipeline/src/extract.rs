use std::sync::OnceLock;

use regex::Regex;

const START: &str = "@startuml";
const END: &str = "@enduml";

/// Diagram text pulled out of a model answer, and whatever followed it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extraction {
    pub payload: String,
    pub remainder: String,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)```[ \t]*(?:plantuml|puml|uml)[ \t]*\r?\n(.*?)```").unwrap()
    })
}

/// Extract the diagram from free-form model output.
///
/// A tagged code fence wins; otherwise the first `@startuml` through the first following
/// `@enduml`. Neither gives an empty payload and the whole text as remainder.
pub fn extract(text: &str) -> Extraction {
    if let Some(caps) = fence_re().captures(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            return Extraction::default();
        };
        return Extraction {
            payload: body.as_str().trim().to_string(),
            remainder: text[whole.end()..].trim().to_string(),
        };
    }

    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();
    if let Some(start) = lower.find(START) {
        if let Some(end) = lower[start..].find(END).map(|i| start + i + END.len()) {
            let rest = text[end..].trim();
            let rest = rest.strip_prefix("```").unwrap_or(rest);
            return Extraction {
                payload: text[start..end].trim().to_string(),
                remainder: rest.trim().to_string(),
            };
        }
    }

    Extraction {
        payload: String::new(),
        remainder: text.trim().to_string(),
    }
}

/// Cheap structural check: start marker first, end marker last, something in between.
pub fn looks_well_formed(text: &str) -> bool {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    match (lines.first(), lines.last()) {
        (Some(first), Some(last)) if lines.len() >= 2 => {
            first.to_ascii_lowercase().starts_with(START)
                && last.to_ascii_lowercase().starts_with(END)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_payload_is_returned_as_is() {
        let clean = "@startuml\nA --> B\n@enduml";
        let out = extract(clean);
        assert_eq!(out.payload, clean);
        assert_eq!(out.remainder, "");
        assert_eq!(extract(&out.payload), out);
    }

    #[test]
    fn fenced_block_with_chatter_around_it() {
        let out = extract("Sure! ```uml\n@startuml\nA->B\n@enduml\n```\nHope that helps");
        assert_eq!(out.payload, "@startuml\nA->B\n@enduml");
        assert_eq!(out.remainder, "Hope that helps");
    }

    #[test]
    fn fence_tags_are_case_insensitive() {
        let out = extract("```PlantUML\n@startuml\nclass A\n@enduml\n```");
        assert_eq!(out.payload, "@startuml\nclass A\n@enduml");
    }

    #[test]
    fn markers_without_fence() {
        let out = extract("Here you go:\n@StartUml\nclass A\n@EndUml\nThe class A models...");
        assert_eq!(out.payload, "@StartUml\nclass A\n@EndUml");
        assert_eq!(out.remainder, "The class A models...");
    }

    #[test]
    fn untagged_fence_around_markers_is_stripped_from_remainder() {
        let out = extract("```\n@startuml\nA -> B\n@enduml\n```\nExplanation");
        assert_eq!(out.payload, "@startuml\nA -> B\n@enduml");
        assert_eq!(out.remainder, "Explanation");
    }

    #[test]
    fn no_diagram_gives_empty_payload() {
        let out = extract("  I cannot draw that.  ");
        assert!(out.is_empty());
        assert_eq!(out.remainder, "I cannot draw that.");
    }

    #[test]
    fn well_formedness() {
        assert!(looks_well_formed("\n@startuml\nA -> B\n@enduml\n"));
        assert!(looks_well_formed("@startuml\n@enduml"));
        assert!(!looks_well_formed("@startuml"));
        assert!(!looks_well_formed("A -> B\n@enduml"));
        assert!(!looks_well_formed("@startuml\nA -> B"));
        assert!(!looks_well_formed(""));
    }
}
