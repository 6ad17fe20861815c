//! Loop configuration loaded from `ralph.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::tools::ToolSpec;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "ralph.toml";

/// Loop configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Agent used when none is named on the command line.
    pub default_agent: String,

    /// Literal the agent must print to stdout to mark a task done.
    pub completion_token: String,

    /// Pause between attempts, in milliseconds.
    pub pause_ms: u64,

    /// Session directory, relative to the working directory.
    pub session_dir: PathBuf,

    /// Audit log path, relative to the working directory.
    pub audit_log: PathBuf,

    /// Lines of `git diff --stat` kept in the context file.
    pub context_diff_lines: usize,

    /// Display truncation for signatures in console lines and tables.
    pub preview_chars: usize,

    /// Extra or replacement agent tools.
    pub tools: BTreeMap<String, ToolSpec>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            default_agent: "claude".to_string(),
            completion_token: "RALPH_DONE".to_string(),
            pause_ms: 2_000,
            session_dir: PathBuf::from(".ralph"),
            audit_log: PathBuf::from("ralph.log"),
            context_diff_lines: 40,
            preview_chars: 160,
            tools: BTreeMap::new(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_agent.trim().is_empty() {
            return Err(anyhow!("default_agent must be non-empty"));
        }
        if self.completion_token.trim().is_empty() {
            return Err(anyhow!("completion_token must be non-empty"));
        }
        if self.session_dir.as_os_str().is_empty() {
            return Err(anyhow!("session_dir must be non-empty"));
        }
        if self.audit_log.as_os_str().is_empty() {
            return Err(anyhow!("audit_log must be non-empty"));
        }
        if self.preview_chars == 0 {
            return Err(anyhow!("preview_chars must be > 0"));
        }
        for (name, spec) in &self.tools {
            spec.validate(name)?;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load the explicit config (which must exist) or `ralph.toml` under `workdir`.
pub fn resolve_config(explicit: Option<&Path>, workdir: &Path) -> Result<LoopConfig> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} not found", path.display());
            }
            load_config(path)
        }
        None => load_config(&workdir.join(DEFAULT_CONFIG_FILE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tools::InputMode;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph.toml");
        fs::write(
            &path,
            r#"
completion_token = "<done/>"
pause_ms = 0

[tools.local]
program = "sh"
args = ["-c", "cat"]
input = "stdin"
"#,
        )
        .expect("write");

        let cfg = resolve_config(None, temp.path()).expect("load");
        assert_eq!(cfg.completion_token, "<done/>");
        assert_eq!(cfg.pause_ms, 0);
        assert_eq!(cfg.session_dir, PathBuf::from(".ralph"));
        let local = cfg.tools.get("local").expect("local tool");
        assert_eq!(local.input, InputMode::Stdin);
        assert_eq!(local.args, vec!["-c", "cat"]);
    }

    #[test]
    fn blank_token_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ralph.toml");
        fs::write(&path, "completion_token = \"  \"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("completion_token must be non-empty"));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("nope.toml");
        let err = resolve_config(Some(&missing), temp.path()).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
