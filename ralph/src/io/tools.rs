//! Agent invocation table: how each tool receives the prompt.
//!
//! Dispatch never matches on tool names; adding a tool means adding a
//! [`ToolSpec`] entry (built in here, or `[tools.<name>]` in `ralph.toml`).

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Placeholder replaced by the prompt text inside tool arguments.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// How the prompt reaches the agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Substituted into the argument list via [`PROMPT_PLACEHOLDER`].
    #[default]
    Arg,
    /// Written to the child's standard input.
    Stdin,
}

/// Invocation strategy for one agent tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: InputMode,
}

impl ToolSpec {
    fn new(program: &str, args: &[&str], input: InputMode) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            input,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.program.trim().is_empty() {
            bail!("tool '{name}': program must be non-empty");
        }
        let has_placeholder = self.args.iter().any(|arg| arg.contains(PROMPT_PLACEHOLDER));
        if self.input == InputMode::Arg && !has_placeholder {
            bail!("tool '{name}': input = \"arg\" requires a {PROMPT_PLACEHOLDER} argument");
        }
        Ok(())
    }

    /// Argument list with the placeholder substituted.
    pub fn render_args(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PROMPT_PLACEHOLDER, prompt))
            .collect()
    }

    /// Bytes to feed on stdin, if this tool reads the prompt there.
    pub fn stdin_payload<'a>(&self, prompt: &'a str) -> Option<&'a [u8]> {
        match self.input {
            InputMode::Stdin => Some(prompt.as_bytes()),
            InputMode::Arg => None,
        }
    }
}

/// Lookup table from tool name to [`ToolSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// Built-in agents.
    pub fn builtin() -> Self {
        let mut tools = BTreeMap::new();
        tools.insert(
            "claude".to_string(),
            ToolSpec::new(
                "claude",
                &["-p", PROMPT_PLACEHOLDER, "--dangerously-skip-permissions"],
                InputMode::Arg,
            ),
        );
        tools.insert(
            "gemini".to_string(),
            ToolSpec::new("gemini", &["--yolo"], InputMode::Stdin),
        );
        tools.insert(
            "copilot".to_string(),
            ToolSpec::new(
                "copilot",
                &["-p", PROMPT_PLACEHOLDER, "--allow-all-tools"],
                InputMode::Arg,
            ),
        );
        tools.insert(
            "codex".to_string(),
            ToolSpec::new(
                "codex",
                &[
                    "exec",
                    "--skip-git-repo-check",
                    "--sandbox",
                    "danger-full-access",
                    "-",
                ],
                InputMode::Stdin,
            ),
        );
        Self { tools }
    }

    /// Built-ins plus configured entries (configured entries win).
    pub fn with_overrides(overrides: &BTreeMap<String, ToolSpec>) -> Result<Self> {
        let mut registry = Self::builtin();
        for (name, spec) in overrides {
            spec.validate(name)?;
            registry.tools.insert(name.clone(), spec.clone());
        }
        Ok(registry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Resolve a tool, failing for unknown names.
    pub fn get(&self, name: &str) -> Result<&ToolSpec> {
        self.tools.get(name).ok_or_else(|| {
            anyhow!(
                "unknown agent '{name}' (known: {})",
                self.names().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_valid() {
        let registry = ToolRegistry::builtin();
        for name in ["claude", "gemini", "copilot", "codex"] {
            let spec = registry.get(name).expect("builtin");
            spec.validate(name).expect("valid builtin");
        }
    }

    #[test]
    fn unknown_tool_lists_known_names() {
        let err = ToolRegistry::builtin().get("clippy").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown agent 'clippy'"));
        assert!(msg.contains("claude"));
    }

    #[test]
    fn arg_mode_substitutes_prompt() {
        let registry = ToolRegistry::builtin();
        let claude = registry.get("claude").expect("claude");
        assert_eq!(
            claude.render_args("do it"),
            vec!["-p", "do it", "--dangerously-skip-permissions"]
        );
        assert_eq!(claude.stdin_payload("do it"), None);
    }

    #[test]
    fn stdin_mode_feeds_prompt() {
        let registry = ToolRegistry::builtin();
        let gemini = registry.get("gemini").expect("gemini");
        assert_eq!(gemini.render_args("do it"), vec!["--yolo"]);
        assert_eq!(gemini.stdin_payload("do it"), Some("do it".as_bytes()));
    }

    #[test]
    fn overrides_add_and_replace_tools() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "claude".to_string(),
            ToolSpec::new("claude-dev", &["--print", PROMPT_PLACEHOLDER], InputMode::Arg),
        );
        overrides.insert(
            "local".to_string(),
            ToolSpec::new("sh", &["-c", "cat"], InputMode::Stdin),
        );
        let registry = ToolRegistry::with_overrides(&overrides).expect("registry");
        assert_eq!(registry.get("claude").expect("claude").program, "claude-dev");
        assert!(registry.contains("local"));
        assert!(registry.contains("gemini"));
    }

    #[test]
    fn arg_mode_without_placeholder_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "broken".to_string(),
            ToolSpec::new("agent", &["--run"], InputMode::Arg),
        );
        let err = ToolRegistry::with_overrides(&overrides).unwrap_err();
        assert!(err.to_string().contains("requires a {prompt} argument"));
    }
}
