use std::sync::OnceLock;

use regex::Regex;
use umlsmith_core::DiagramCategory;

/// How a keyword is matched against the lowercased prompt.
enum Keyword {
    Phrase(&'static str),
    Word(&'static str),
}

/// Evaluated in order; the first hit wins.
const KEYWORDS: &[(Keyword, DiagramCategory)] = &[
    (Keyword::Phrase("sequence diagram"), DiagramCategory::Sequence),
    (Keyword::Phrase("sequence flow"), DiagramCategory::Sequence),
    (Keyword::Phrase("use case diagram"), DiagramCategory::UseCase),
    (Keyword::Phrase("use-case diagram"), DiagramCategory::UseCase),
    (Keyword::Phrase("activity diagram"), DiagramCategory::Activity),
    (Keyword::Phrase("component diagram"), DiagramCategory::Component),
    (Keyword::Phrase("state diagram"), DiagramCategory::State),
    (Keyword::Phrase("state machine"), DiagramCategory::State),
    (Keyword::Phrase("entity relationship"), DiagramCategory::Eerd),
    (Keyword::Word("erd"), DiagramCategory::Eerd),
    (Keyword::Word("eerd"), DiagramCategory::Eerd),
];

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)diagram\s*type\s*:\s*([a-z][a-z_\- ]*[a-z])").unwrap())
}

fn keyword_matches(keyword: &Keyword, lower: &str) -> bool {
    match keyword {
        Keyword::Phrase(phrase) => lower.contains(phrase),
        Keyword::Word(word) => lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| w == *word),
    }
}

/// `DiagramType: <token>` embedded anywhere in the prompt.
fn marker(prompt: &str) -> Option<DiagramCategory> {
    let token = marker_re().captures(prompt)?.get(1)?.as_str();
    // The capture may run into the next words ("state please"); try shrinking from the right.
    let words: Vec<&str> = token.split_whitespace().collect();
    (1..=words.len())
        .rev()
        .find_map(|n| DiagramCategory::parse(&words[..n].join(" ")))
}

/// Pick the category for a request. A hint that does not name a category is ignored here;
/// callers that must reject it do so before classifying.
pub fn classify(prompt: &str, hint: Option<&str>) -> DiagramCategory {
    if let Some(category) = hint
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .and_then(DiagramCategory::parse)
    {
        return category;
    }

    if let Some(category) = marker(prompt) {
        return category;
    }

    let lower = prompt.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(keyword, _)| keyword_matches(keyword, &lower))
        .map(|(_, category)| *category)
        .unwrap_or(DiagramCategory::Class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_picks_sequence() {
        assert_eq!(
            classify("Generate a sequence diagram for checkout", None),
            DiagramCategory::Sequence
        );
    }

    #[test]
    fn explicit_hint_wins_over_everything() {
        assert_eq!(
            classify("DiagramType: state. A sequence diagram please", Some("activity")),
            DiagramCategory::Activity
        );
    }

    #[test]
    fn marker_beats_keywords() {
        assert_eq!(
            classify("diagramtype: use_case\nlike a sequence diagram", None),
            DiagramCategory::UseCase
        );
        assert_eq!(
            classify("Diagram Type: State Machine for a turnstile", None),
            DiagramCategory::State
        );
    }

    #[test]
    fn blank_or_unknown_hint_falls_through() {
        assert_eq!(
            classify("model the component diagram of the API", Some("  ")),
            DiagramCategory::Component
        );
        assert_eq!(
            classify("an activity diagram for onboarding", Some("mindmap")),
            DiagramCategory::Activity
        );
    }

    #[test]
    fn erd_needs_a_whole_word() {
        assert_eq!(classify("ERD for a library", None), DiagramCategory::Eerd);
        assert_eq!(classify("the nerdy bookshop", None), DiagramCategory::Class);
    }

    #[test]
    fn default_is_class() {
        assert_eq!(classify("a blog with posts and comments", None), DiagramCategory::Class);
    }
}
