//! Reduce raw agent output to a verdict, a stable failure signature, and the
//! full diagnostic context fed back to the next attempt.
//!
//! Signature derivation:
//!
//! 1. Pick the source text: stderr when it has non-blank content, else stdout.
//! 2. Normalize each line: timestamps, UUIDs, absolute paths, long hex runs,
//!    durations and numbers of 5+ digits become placeholders; whitespace is
//!    collapsed. Case is preserved.
//! 3. The first normalized line matching [`ERROR_LINE_RE`] is the excerpt:
//!    `exit <code>: <excerpt>`, cut to [`MAX_SIGNATURE_CHARS`].
//! 4. Without a matching line, hash the last [`HASH_TAIL_LINES`] normalized
//!    lines: `exit <code>: #<hash>`.
//!
//! The zero-exit/missing-token case always maps to [`TOKEN_MISSING_SIGNATURE`].

use std::sync::LazyLock;

use regex::Regex;

use crate::core::digest::short_hash;
use crate::core::types::ExecOutcome;

/// Upper bound on signature length (chars).
pub const MAX_SIGNATURE_CHARS: usize = 120;
/// Normalized lines hashed when no error-pattern line exists.
pub const HASH_TAIL_LINES: usize = 20;
/// Signature for "exit 0 without the completion token".
pub const TOKEN_MISSING_SIGNATURE: &str = "token-missing";

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:error|fatal|panic(?:ked)?|exception|traceback|failed|failure|denied|not found|cannot|unable to)\b",
    )
    .expect("error pattern is valid")
});

/// Replacements applied in order; later patterns see earlier placeholders.
static NORMALIZERS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<ts>",
        ),
        (r"\b\d{1,2}:\d{2}:\d{2}(?:[.,]\d+)?\b", "<ts>"),
        (
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            "<uuid>",
        ),
        (r"[A-Za-z]:\\(?:[\w.\-]+\\)*[\w.\-]+", "<path>"),
        (r"(?:/[\w.\-@+]+){2,}/?", "<path>"),
        (r"\b(?:0x)?[0-9a-fA-F]{8,}\b", "<hex>"),
        (r"\b\d+(?:\.\d+)?\s?(?:ms|us|µs|ns|s|secs?|seconds?)\b", "<dur>"),
        (r"\b\d{5,}\b", "<n>"),
        (r"\s+", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("normalizer pattern is valid"),
            replacement,
        )
    })
    .collect()
});

/// Classified failure: a comparable signature plus the unabridged context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub signature: String,
    pub context: String,
}

/// Outcome of classifying one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(FailureReport),
}

/// Classify an attempt against the required completion token.
///
/// Success requires exit code zero and `token` verbatim somewhere in stdout.
pub fn classify(outcome: &ExecOutcome, token: &str) -> Verdict {
    if outcome.exit_code == 0 {
        if outcome.stdout.contains(token) {
            return Verdict::Success;
        }
        return Verdict::Failure(FailureReport {
            signature: TOKEN_MISSING_SIGNATURE.to_string(),
            context: token_missing_context(outcome, token),
        });
    }

    let source = if outcome.stderr.trim().is_empty() {
        &outcome.stdout
    } else {
        &outcome.stderr
    };
    Verdict::Failure(FailureReport {
        signature: signature_for(outcome.exit_code, source),
        context: exit_failure_context(outcome),
    })
}

/// Deterministic signature for a non-zero exit with the given output.
pub fn signature_for(exit_code: i32, source: &str) -> String {
    let lines: Vec<String> = source
        .lines()
        .map(normalize_line)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        return format!("exit {exit_code}: no output");
    }
    if let Some(line) = lines.iter().find(|line| ERROR_LINE_RE.is_match(line)) {
        return truncate_chars(&format!("exit {exit_code}: {line}"), MAX_SIGNATURE_CHARS);
    }
    let tail_start = lines.len().saturating_sub(HASH_TAIL_LINES);
    let tail = lines[tail_start..].join("\n");
    format!("exit {exit_code}: #{}", short_hash(&tail))
}

/// Replace volatile fragments of a line with stable placeholders.
pub fn normalize_line(line: &str) -> String {
    let mut normalized = line.to_string();
    for (re, replacement) in NORMALIZERS.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }
    normalized.trim().to_string()
}

/// Display-only shortening for console and log previews.
///
/// Never apply this to context that is stored or fed back to the agent.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut = truncate_chars(&flat, max_chars.saturating_sub(3));
    cut.push_str("...");
    cut
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn exit_failure_context(outcome: &ExecOutcome) -> String {
    format!(
        "Agent exited with code {} after {} ms.\n\n{}",
        outcome.exit_code,
        outcome.duration_ms,
        output_sections(outcome, &["stderr", "stdout"]),
    )
}

fn token_missing_context(outcome: &ExecOutcome, token: &str) -> String {
    format!(
        "Agent exited with code 0 after {} ms but the completion token `{token}` was not \
         found in stdout.\nThe task is not verified. Either the work is unfinished or the \
         token was not printed verbatim.\n\n{}",
        outcome.duration_ms,
        output_sections(outcome, &["stdout", "stderr"]),
    )
}

fn output_sections(outcome: &ExecOutcome, order: &[&str]) -> String {
    let mut buf = String::new();
    for name in order {
        let body = match *name {
            "stdout" => outcome.stdout.as_str(),
            _ => outcome.stderr.as_str(),
        };
        buf.push_str(&format!("--- {name} ---\n"));
        if body.is_empty() {
            buf.push_str("(empty)\n");
        } else {
            buf.push_str(body);
            if !body.ends_with('\n') {
                buf.push('\n');
            }
        }
    }
    buf
}
