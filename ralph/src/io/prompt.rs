//! Stable prompt handed to the agent on every attempt.
//!
//! The prompt never embeds task text, counters or errors. It points at the
//! session files, which carry everything that changes between attempts, so
//! the same text works for every tool and every retry.

use anyhow::Result;
use minijinja::context;

use crate::core::digest::short_hash;
use crate::io::render::{self, Renderer};
use crate::io::state_files::FileRefs;

/// A rendered prompt plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    content: String,
    hash: String,
}

impl PromptPack {
    pub fn build(renderer: &Renderer, files: &FileRefs, token: &str) -> Result<Self> {
        let content = renderer.render(
            render::PROMPT,
            context! {
                files => files,
                token => token,
            },
        )?;
        let hash = short_hash(&content);
        Ok(Self { content, hash })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Short hash used to correlate transcripts with the prompt text.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}
