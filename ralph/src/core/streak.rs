//! Repeat-streak tracking keyed by failure-signature equality.

use std::collections::BTreeMap;

/// Task-scoped failure bookkeeping.
///
/// Consecutive failures with an equal signature grow the streak; a different
/// signature resets it to 1. All state is dropped by [`FailureTracker::reset`]
/// when the task changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureTracker {
    counts: BTreeMap<String, u32>,
    last_signature: Option<String>,
    streak: u32,
    last_context: Option<String>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the updated repeat streak.
    pub fn observe(&mut self, signature: &str, context: &str) -> u32 {
        *self.counts.entry(signature.to_string()).or_insert(0) += 1;
        self.streak = match self.last_signature.as_deref() {
            Some(prev) if prev == signature => self.streak + 1,
            _ => 1,
        };
        self.last_signature = Some(signature.to_string());
        self.last_context = Some(context.to_string());
        self.streak
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn last_signature(&self) -> Option<&str> {
        self.last_signature.as_deref()
    }

    pub fn last_context(&self) -> Option<&str> {
        self.last_context.as_deref()
    }

    /// Occurrences of each signature for the current task, in signature order.
    pub fn counts(&self) -> &BTreeMap<String, u32> {
        &self.counts
    }

    pub fn count(&self, signature: &str) -> u32 {
        self.counts.get(signature).copied().unwrap_or(0)
    }
}
