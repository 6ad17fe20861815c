//! Template engine for every markdown file the loop writes.
//!
//! Templates live in `io/templates/` and are compiled into the binary. Block
//! tags are trimmed so the sources can stay readable.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

pub const TASK: &str = "task";
pub const PROGRESS: &str = "progress";
pub const ERROR: &str = "error";
pub const CONTEXT: &str = "context";
pub const ENVIRONMENT: &str = "environment";
pub const PROMPT: &str = "prompt";
pub const TRANSCRIPT: &str = "transcript";

const TEMPLATES: [(&str, &str); 7] = [
    (TASK, include_str!("templates/task.md")),
    (PROGRESS, include_str!("templates/progress.md")),
    (ERROR, include_str!("templates/error.md")),
    (CONTEXT, include_str!("templates/context.md")),
    (ENVIRONMENT, include_str!("templates/environment.md")),
    (PROMPT, include_str!("templates/prompt.md")),
    (TRANSCRIPT, include_str!("templates/transcript.md")),
];

/// Wrapper around a minijinja environment holding the built-in templates.
#[derive(Debug)]
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        for (name, source) in TEMPLATES {
            env.add_template(name, source)
                .with_context(|| format!("compile template '{name}'"))?;
        }
        Ok(Self { env })
    }

    /// Render a named template with any serializable context.
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load template '{name}'"))?;
        template
            .render(ctx)
            .with_context(|| format!("render template '{name}'"))
    }
}
