//! Task snapshot rendering and ANSI handling.
//!
//! Snapshots are rendered as plain text with a colored status line:
//!
//! ```text
//! <output verbatim, trailing newlines stripped>
//! [error] <error>
//! [<STATUS> task_id=<id> elapsed=<s>s <extras>]
//! [warning: A.L.A.N.: ...]
//! [info: A.L.A.N.: ...]
//! ```
//!
//! COMPLETED turns into FAILED when the final pipestatus entry is
//! non-zero. Observation snippets stored in A.L.A.N. are ANSI-stripped
//! here too, so the learning store holds visible text only.

use crate::alan::{Insight, InsightLevel};
use crate::executor::{TaskSnapshot, TaskStatus};

const C_GREEN: &str = "\x1b[32m";
const C_RED: &str = "\x1b[31m";
const C_YELLOW: &str = "\x1b[33m";
const C_CYAN: &str = "\x1b[36m";
const C_DIM: &str = "\x1b[2m";
const C_RESET: &str = "\x1b[0m";

/// Render one task snapshot plus its insight lines.
#[must_use]
pub fn render_snapshot(snapshot: &TaskSnapshot, insights: &[Insight]) -> String {
    let mut text = String::new();

    let body = snapshot.output.trim_end_matches(['\n', '\r']);
    if !body.is_empty() {
        text.push_str(body);
        text.push('\n');
    } else if snapshot.status == TaskStatus::Completed && snapshot.truncated_chars == 0 {
        text.push_str(&format!("{C_DIM}(no output){C_RESET}\n"));
    }

    if snapshot.truncated_chars > 0 {
        text.push_str(&format!(
            "{C_DIM}[output truncated: {} more chars, zsh_poll returns the rest]{C_RESET}\n",
            snapshot.truncated_chars
        ));
    }

    if let Some(error) = &snapshot.error {
        text.push_str(&format!("{C_RED}[error]{C_RESET} {error}\n"));
    }

    text.push_str(&status_line(snapshot));
    text.push('\n');

    for (level, message) in insights {
        let line = match level {
            InsightLevel::Warning => {
                format!("{C_YELLOW}[warning: A.L.A.N.: {message}]{C_RESET}")
            }
            InsightLevel::Info => format!("{C_DIM}[info: A.L.A.N.: {message}]{C_RESET}"),
        };
        text.push_str(&line);
        text.push('\n');
    }

    text.trim_end_matches('\n').to_string()
}

fn status_line(snapshot: &TaskSnapshot) -> String {
    let elapsed = snapshot.elapsed_seconds;
    let id = &snapshot.task_id;

    match snapshot.status {
        TaskStatus::Running => {
            let stdin = if snapshot.has_stdin { "yes" } else { "no" };
            format!(
                "[{C_CYAN}RUNNING{C_RESET} task_id={id} elapsed={elapsed:.1}s stdin={stdin}; \
                 use zsh_poll for updates]"
            )
        }
        TaskStatus::Completed => {
            let pipestatus = snapshot.pipestatus.clone().unwrap_or_default();
            let failed = pipestatus.last().copied().unwrap_or(0) != 0;
            let (color, word) = if failed {
                (C_RED, "FAILED")
            } else {
                (C_GREEN, "COMPLETED")
            };
            let exit = snapshot
                .exit_code
                .or_else(|| pipestatus.last().copied())
                .unwrap_or(-1);
            let extras = if pipestatus.len() > 1 {
                let joined = pipestatus
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                format!("exit={exit} pipestatus=[{joined}]")
            } else {
                format!("exit={exit}")
            };
            format!("[{color}{word}{C_RESET} task_id={id} elapsed={elapsed:.1}s {extras}]")
        }
        TaskStatus::Timeout => {
            format!("[{C_YELLOW}TIMEOUT{C_RESET} task_id={id} elapsed={elapsed:.1}s]")
        }
        TaskStatus::Killed => {
            format!("[{C_YELLOW}KILLED{C_RESET} task_id={id} elapsed={elapsed:.1}s]")
        }
        TaskStatus::Error => {
            format!("[{C_RED}ERROR{C_RESET} task_id={id} elapsed={elapsed:.1}s]")
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal escape stripping
// ---------------------------------------------------------------------------

/// Drop terminal control sequences, keeping only the visible text.
///
/// A small scanner rather than a pattern: on ESC it consumes one sequence
/// according to its introducer (CSI runs to a final byte in `@`..`~`, OSC
/// runs to BEL or `ESC \`, charset selection takes one designator, any
/// other escape is two bytes), and a backspace erases the character in
/// front of it (overstrike bold).
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    let mut visible = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    for b in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&b) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    let mut pending_st = false;
                    for b in chars.by_ref() {
                        if b == '\x07' || (pending_st && b == '\\') {
                            break;
                        }
                        pending_st = b == '\x1b';
                    }
                }
                Some('(') | Some(')') => {
                    chars.next();
                }
                _ => {}
            },
            '\x08' => {
                visible.pop();
            }
            _ => visible.push(c),
        }
    }
    visible
}
