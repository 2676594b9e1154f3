/// PlantUML authoring rules shared by the class-style prompts and the MCP server instructions.
pub const RULES: &str = "\
1. Output only PlantUML between @startuml and @enduml. No markdown fences, no commentary \
before @startuml or after @enduml.\n\
2. Declare every structured element with an explicit keyword (`class Foo { ... }`, \
`interface Bar`, `enum Baz`). Never open a block like `Foo {` without the keyword.\n\
3. Write relationships as explicit connector lines, never inline: `--` or `-->` for \
associations and dependencies, `<|--` for inheritance, `..|>` for interface implementation, \
`o--` for aggregation, `*--` for composition. Do not write `class Foo extends Bar`.\n\
4. Do not quote connectors (`A \"o--\" B` is invalid) and do not put labels inside arrows \
(`A -->|ok| B` is Mermaid, not PlantUML). Put labels after a colon: `A --> B : ok`.\n\
5. Every arrow endpoint must be declared and every brace must be balanced.\n\
6. Do not emit `!include` or `LAYOUT_*` directives: they belong to C4 and break plain diagrams.\n\
7. Never abbreviate with placeholders like `... (rest of your code remains the same)`. Repeat \
the full diagram.";

/// Workflow notes for clients driving the pipeline through MCP.
pub const WORKFLOW: &str = "\
1. `generate_diagram` turns a natural-language request into a validated PlantUML diagram. Pass \
`diagram_type` when the user named one; otherwise it is inferred from the prompt.\n\
2. `refine_diagram` applies feedback to a stored diagram. Each refinement is recorded so it can \
be reverted with `undo` and re-applied with `redo`.\n\
3. A new refinement after an undo discards the undone steps; `redo` then has nothing to apply.\n\
4. `list_backends` shows the configured model lists per stage and, when discovery succeeded, \
the models the local Ollama host actually serves.";
