//! Deterministic clean-up of generated PlantUML.
//!
//! Rules target known generator quirks and are free to grow. The one hard invariant is the
//! guardrail: if a pass would lower the number of relationship lines, the input is
//! returned untouched.

use std::sync::OnceLock;

use regex::Regex;
use umlsmith_core::DiagramCategory;

const PLACEHOLDER_PHRASES: &[&str] = &[
    "rest of your code remains the same",
    "rest of the code remains the same",
    "rest of your code remains unchanged",
    "rest of the code remains unchanged",
    "rest of the diagram remains the same",
];

const DROPPED_DIRECTIVES: &[&str] = &["!include", "includeurl", "layout ", "layout_"];

fn declaration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*)(Class|CLASS|Interface|INTERFACE)\b").unwrap())
}

fn inline_inherit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(\s*)(class|interface)\s+([A-Za-z0-9_]+)\s*(\bextends\b|\bimplements\b|:)\s*(.*)$")
            .unwrap()
    })
}

fn edge_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([-.o<>*]*[-.][-.o<>*]*)\|[^|\n]+\|").unwrap())
}

fn quoted_connector_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(\s*\S+)\s+"([^"]+)"\s+(\S+)(.*)$"#).unwrap())
}

fn relationship_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = concat!(
            r#"^\s*[\w\])"*:.]+"#,
            r#"\s*(?:"[^"]*"\s*)?"#,
            r#""?(?:<\|?|<<?|\*|o|\+)?"#,
            r"(?:-+|\.+)(?:\[[^\]]*\])?(?:-+|\.+)?",
            r"(?:\|?>>?|\*|o|\+)?",
            r#"(?:\|[^|]*\|)?"?"#,
            r#"\s*(?:"[^"]*"\s*)?"#,
            r#"[\w\[(":]"#,
        );
        Regex::new(pattern).unwrap()
    })
}

/// Number of lines shaped like `A <connector> B`, optionally labelled or with multiplicities.
pub fn count_relationships(text: &str) -> usize {
    let re = relationship_re();
    text.lines().filter(|line| re.is_match(line)).count()
}

fn is_connector(token: &str) -> bool {
    token.contains(['-', '.'])
        && token
            .chars()
            .all(|c| matches!(c, '-' | '.' | 'o' | '<' | '>' | '*' | '|'))
}

fn is_placeholder(line: &str) -> bool {
    let lower = line.to_lowercase();
    PLACEHOLDER_PHRASES.iter().any(|p| lower.contains(p))
}

fn is_dropped_directive(line: &str) -> bool {
    let lower = line.trim_start().to_lowercase();
    DROPPED_DIRECTIVES.iter().any(|d| lower.starts_with(d))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Extends,
    Implements,
    Colon,
}

impl Relation {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "extends" => Some(Relation::Extends),
            "implements" => Some(Relation::Implements),
            ":" => Some(Relation::Colon),
            _ => None,
        }
    }

    fn arrow(self, is_interface: bool) -> &'static str {
        match (self, is_interface) {
            (Relation::Implements, _) => "..|>",
            (Relation::Extends, true) => "..|>",
            (Relation::Extends, false) | (Relation::Colon, _) => "--|>",
        }
    }
}

/// An inline-inheritance declaration split into its block opener and connector lines.
struct InlineInheritance {
    opener: String,
    connectors: Vec<String>,
    /// Whether the opener leaves a `{` block open.
    opens_block: bool,
}

fn rewrite_inline_inheritance(line: &str) -> Option<InlineInheritance> {
    let caps = inline_inherit_re().captures(line)?;
    let indent = caps.get(1)?.as_str();
    let keyword = caps.get(2)?.as_str().to_ascii_lowercase();
    let name = caps.get(3)?.as_str();
    let first = Relation::parse(caps.get(4)?.as_str().trim())?;
    let rest = caps.get(5)?.as_str();

    let (clauses, tail) = match rest.find('{') {
        Some(i) => (&rest[..i], Some(&rest[i..])),
        None => (rest, None),
    };

    let is_interface = keyword == "interface";
    let mut relation = first;
    let mut decorations = Vec::new();
    let mut connectors = Vec::new();
    for token in clauses.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
        if let Some(next) = Relation::parse(token) {
            relation = next;
            continue;
        }
        // Drop generic arguments: `Repository<User>` inherits from `Repository`.
        let parent = token.split('<').next().unwrap_or(token);
        if !parent.is_empty() && parent.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            connectors.push(format!("{indent}{name} {} {parent}", relation.arrow(is_interface)));
        } else {
            decorations.push(token);
        }
    }
    if connectors.is_empty() {
        return None;
    }

    let mut opener = format!("{indent}{keyword} {name}");
    for decoration in decorations {
        opener.push(' ');
        opener.push_str(decoration);
    }
    let opens_block = match tail {
        Some(tail) => {
            opener.push(' ');
            opener.push_str(tail.trim_end());
            brace_delta(tail) > 0
        }
        None => false,
    };

    Some(InlineInheritance {
        opener,
        connectors,
        opens_block,
    })
}

fn brace_delta(line: &str) -> i32 {
    line.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

fn strip_edge_labels(line: &str) -> String {
    edge_label_re().replace_all(line, "$1").into_owned()
}

fn unquote_connector(line: &str) -> Option<String> {
    let caps = quoted_connector_re().captures(line)?;
    let token = caps.get(2)?.as_str();
    if !is_connector(token) {
        return None;
    }
    Some(format!(
        "{} {} {}{}",
        caps.get(1)?.as_str(),
        token,
        caps.get(3)?.as_str(),
        caps.get(4)?.as_str()
    ))
}

/// Rule set for one diagram dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    class_rules: bool,
}

impl Sanitizer {
    /// Class-style dialects get declaration and inheritance rewrites on top of the
    /// dialect-neutral rules.
    pub fn for_category(category: DiagramCategory) -> Self {
        Self {
            class_rules: category.is_class_like(),
        }
    }

    pub fn sanitize(&self, payload: &str) -> String {
        let out = self.apply(payload);
        let before = count_relationships(payload);
        let after = count_relationships(&out);
        if after < before {
            tracing::warn!(before, after, "sanitizer dropped relationships, keeping original");
            return payload.to_string();
        }
        out
    }

    fn apply(&self, payload: &str) -> String {
        let mut out: Vec<String> = Vec::new();
        // Connectors waiting for their block to close, keyed by the depth the block opened at.
        let mut pending: Vec<(i32, Vec<String>)> = Vec::new();
        let mut depth = 0i32;

        for raw in payload.lines() {
            if is_placeholder(raw) {
                continue;
            }
            if self.class_rules && is_dropped_directive(raw) {
                continue;
            }

            let mut line = raw.to_string();
            if self.class_rules {
                line = declaration_re()
                    .replace(&line, |caps: &regex::Captures<'_>| {
                        format!("{}{}", &caps[1], caps[2].to_ascii_lowercase())
                    })
                    .into_owned();

                if let Some(rewrite) = rewrite_inline_inheritance(&line) {
                    out.push(rewrite.opener);
                    if rewrite.opens_block {
                        pending.push((depth, rewrite.connectors));
                        depth += 1;
                    } else {
                        out.extend(rewrite.connectors);
                    }
                    continue;
                }
            }

            line = strip_edge_labels(&line);
            if let Some(unquoted) = unquote_connector(&line) {
                line = unquoted;
            }

            depth += brace_delta(&line);
            out.push(line);
            while pending.last().is_some_and(|(opened_at, _)| depth <= *opened_at) {
                if let Some((_, connectors)) = pending.pop() {
                    out.extend(connectors);
                }
            }
        }

        // Unclosed blocks: flush before the end marker.
        if !pending.is_empty() {
            let at = out
                .iter()
                .rposition(|l| l.trim_start().to_ascii_lowercase().starts_with("@enduml"))
                .unwrap_or(out.len());
            let leftovers: Vec<String> = pending.into_iter().rev().flat_map(|(_, c)| c).collect();
            out.splice(at..at, leftovers);
        }

        out.join("\n")
    }
}

/// Sanitize with the rules for `category`.
pub fn sanitize(payload: &str, category: DiagramCategory) -> String {
    Sanitizer::for_category(category).sanitize(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn class(payload: &str) -> String {
        sanitize(payload, DiagramCategory::Class)
    }

    #[test]
    fn counts_common_connectors() {
        let text = "@startuml\nA --> B\nC <|-- D\nE ..|> F\nG \"1\" *-- \"0..*\" H\nI -[#red]-> J : x\n\
                    K->L: hi\nclass M {\n  - id : int\n}\n' N --> O\n@enduml";
        assert_eq!(count_relationships(text), 6);
    }

    #[test]
    fn drops_placeholder_and_directive_lines() {
        let input = "@startuml\n!include <C4/C4_Container>\nLAYOUT_TOP_DOWN()\nclass A\n\
                     ' ... rest of the code remains the same\n@enduml";
        assert_eq!(class(input), "@startuml\nclass A\n@enduml");
    }

    #[test]
    fn directives_survive_outside_class_dialects() {
        let input = "@startuml\n!include common.puml\n[A] --> [B]\n@enduml";
        assert_eq!(sanitize(input, DiagramCategory::Component), input);
    }

    #[test]
    fn lowercases_declaration_keywords() {
        assert_eq!(
            class("@startuml\nClass Order {\n}\n  INTERFACE Payable\n@enduml"),
            "@startuml\nclass Order {\n}\n  interface Payable\n@enduml"
        );
    }

    #[test]
    fn inline_inheritance_without_block() {
        assert_eq!(
            class("@startuml\nclass Dog extends Animal\n@enduml"),
            "@startuml\nclass Dog\nDog --|> Animal\n@enduml"
        );
    }

    #[test]
    fn inline_inheritance_defers_connectors_past_the_block() {
        let input = "@startuml\nclass Dog extends Animal implements Pet, Named {\n  +bark()\n}\n@enduml";
        assert_eq!(
            class(input),
            "@startuml\nclass Dog {\n  +bark()\n}\nDog --|> Animal\nDog ..|> Pet\nDog ..|> Named\n@enduml"
        );
    }

    #[test]
    fn interface_extends_uses_realization_arrow() {
        assert_eq!(
            class("@startuml\ninterface Repo : Base\ninterface Cache extends Store\n@enduml"),
            "@startuml\ninterface Repo\nRepo --|> Base\ninterface Cache\nCache ..|> Store\n@enduml"
        );
    }

    #[test]
    fn unclosed_block_flushes_before_end_marker() {
        assert_eq!(
            class("@startuml\nclass A extends B {\n  +x\n@enduml"),
            "@startuml\nclass A {\n  +x\nA --|> B\n@enduml"
        );
    }

    #[test]
    fn strips_mermaid_style_edge_labels() {
        assert_eq!(
            sanitize("@startuml\nA -->|calls| B\n@enduml", DiagramCategory::Sequence),
            "@startuml\nA --> B\n@enduml"
        );
    }

    #[test]
    fn unquotes_bare_connectors_only() {
        assert_eq!(
            class("@startuml\nOrder \"o--\" Item\nA \"1\" -- \"*\" B\n@enduml"),
            "@startuml\nOrder o-- Item\nA \"1\" -- \"*\" B\n@enduml"
        );
    }

    #[test]
    fn clean_diagram_is_unchanged() {
        let clean = "@startuml\nclass A {\n  +run()\n}\nclass B\nA --> B : uses\n@enduml";
        assert_eq!(class(clean), clean);
    }

    #[test]
    fn guardrail_keeps_input_when_relationships_would_be_lost() {
        let input = "@startuml\nA --> B ' rest of the code remains the same\nC --> D\n@enduml";
        assert_eq!(class(input), input);
    }

    proptest! {
        #[test]
        fn never_reduces_relationships(
            lines in proptest::collection::vec(
                prop_oneof![
                    Just("A --> B".to_string()),
                    Just("A -->|x| B".to_string()),
                    Just("A \"--\" B".to_string()),
                    Just("Class Foo extends Bar {".to_string()),
                    Just("class Baz implements Qux".to_string()),
                    Just("}".to_string()),
                    Just("!include x".to_string()),
                    Just("X --> Y rest of your code remains the same".to_string()),
                    "[ -~]{0,30}",
                ],
                0..12,
            ),
            class_like in any::<bool>(),
        ) {
            let input = lines.join("\n");
            let category = if class_like { DiagramCategory::Class } else { DiagramCategory::State };
            let out = sanitize(&input, category);
            prop_assert!(count_relationships(&out) >= count_relationships(&input));
        }
    }
}
