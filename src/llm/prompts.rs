//! Prompt template store.
//!
//! Templates ship embedded in the binary; a prompts directory can override
//! any of them by file name (`<name>.j2`). Rendering uses minijinja with all
//! JSON-heavy variables pre-serialized to strings by the caller, so templates
//! only ever interpolate scalars and small lists.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

/// Template names recognized by the store, paired with their embedded sources.
const TEMPLATES: [(&str, &str); 5] = [
    ("orchestration", include_str!("../../prompts/orchestration.j2")),
    ("planner", include_str!("../../prompts/planner.j2")),
    ("sql_generation", include_str!("../../prompts/sql_generation.j2")),
    (
        "response_formatter",
        include_str!("../../prompts/response_formatter.j2"),
    ),
    ("pricing", include_str!("../../prompts/pricing.j2")),
];

/// Compiled prompt templates.
pub struct PromptStore {
    env: Environment<'static>,
}

impl PromptStore {
    /// Build a store from the embedded templates only.
    pub fn builtin() -> Result<Self> {
        Self::new(None)
    }

    /// Build a store, overriding embedded templates with `<name>.j2` files
    /// from `overrides` where present.
    pub fn new(overrides: Option<&Path>) -> Result<Self> {
        let mut env = Environment::new();

        for (name, source) in TEMPLATES {
            let override_path = overrides.map(|dir| dir.join(format!("{}.j2", name)));
            match override_path {
                Some(path) if path.is_file() => {
                    let content = std::fs::read_to_string(&path)
                        .context(format!("Failed to read prompt override: {:?}", path))?;
                    env.add_template_owned(name.to_string(), content)
                        .context(format!("Invalid prompt template: {:?}", path))?;
                }
                _ => {
                    env.add_template(name, source)
                        .context(format!("Invalid embedded prompt template: {}", name))?;
                }
            }
        }

        Ok(Self { env })
    }

    /// Render a template by name with the given context.
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .context(format!("Unknown prompt template: {}", name))?;
        template
            .render(ctx)
            .context(format!("Failed to render prompt template: {}", name))
    }
}
