//! Command normalization: fingerprints, base commands, and templates.
//!
//! A fingerprint collapses trivially-varying parts of a command (paths,
//! numbers, quoted strings) so that pattern learning generalizes, while
//! keeping literal operators so `tar xf` and `tar cf` stay distinct. The
//! template is a coarser normalization used for streak counting ("same
//! shape, different files"), and the base command keys the option cache.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DOUBLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]*""#).unwrap());
static SINGLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'[^']*'").unwrap());
static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// Normalize a command for fingerprinting: trim, collapse whitespace runs,
/// empty out quoted runs, replace digit runs with `N`.
#[must_use]
pub fn normalize(cmd: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(cmd.trim(), " ");
    let no_dquotes = DOUBLE_QUOTED.replace_all(&collapsed, "\"\"");
    let no_quotes = SINGLE_QUOTED.replace_all(&no_dquotes, "''");
    DIGIT_RUN.replace_all(&no_quotes, "N").into_owned()
}

/// Stable 16-hex-char fingerprint of a command's normalized form.
#[must_use]
pub fn fingerprint(cmd: &str) -> String {
    let digest = Sha256::digest(normalize(cmd).as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// The leading program name of a command: first whitespace token of the
/// normalized form, last path segment if it contains `/`.
#[must_use]
pub fn base_command(cmd: &str) -> String {
    let normalized = normalize(cmd);
    let first = normalized.split_whitespace().next().unwrap_or("");
    match first.rsplit('/').next() {
        Some(seg) if !seg.is_empty() => seg.to_string(),
        _ => first.to_string(),
    }
}

/// Coarse command shape for streak counting: tokens that look like paths,
/// globs, filenames, or numbers become `*`; option tokens are kept.
#[must_use]
pub fn template(cmd: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(cmd.trim(), " ");
    collapsed
        .split(' ')
        .map(|token| {
            if token.starts_with('-') || !is_variable_token(token) {
                token
            } else {
                "*"
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a token varies between invocations of the same command shape.
fn is_variable_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    // Paths, globs, and extension-bearing filenames.
    token.contains('/')
        || token.contains('*')
        || token.contains('?')
        || (token.contains('.') && token.len() > 1)
}
