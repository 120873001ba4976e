//! Allow-list gate for shell commands requested by the remote agent.
//!
//! The gate is a pure predicate: it never executes anything and never fails.
//! A command line passes only when every chained segment, including command
//! substitution bodies, starts with an allow-listed executable. Anything the
//! gate cannot parse is rejected.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// `NAME=value` prefix tokens that precede the executable word.
static ASSIGNMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("assignment regex"));

/// Redirection tokens (`>out`, `2>&1`, `<in`) appearing before any executable.
static REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]*[<>]").expect("redirect regex"));

/// Case-sensitive allow-list of executable names.
#[derive(Debug, Clone)]
pub struct CommandGate {
    allowed: BTreeSet<String>,
}

impl CommandGate {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the whole command line may run.
    ///
    /// Splits on `;`, newline, `&`, `&&`, `||`, `|` and on backtick / `$( )`
    /// substitution bodies, then requires every segment's leading executable
    /// (path prefix stripped) to be allow-listed. A single disallowed segment
    /// anywhere rejects the entire line.
    pub fn is_allowed(&self, command_line: &str) -> bool {
        let mut segments = Vec::new();
        if !split_segments(command_line, &mut segments) {
            return false;
        }
        let segments: Vec<&String> = segments.iter().filter(|s| !s.trim().is_empty()).collect();
        if segments.is_empty() {
            return false;
        }
        segments.iter().all(|segment| {
            leading_executable(segment).is_some_and(|exe| self.allowed.contains(&exe))
        })
    }
}

/// Split a command line into shell-level segments.
///
/// Substitution bodies (`` `...` `` and `$(...)`) are split recursively into
/// segments of their own. Returns `false` for input the gate cannot parse
/// (unbalanced quotes, unmatched substitution delimiters).
fn split_segments(input: &str, out: &mut Vec<String>) -> bool {
    let chars: Vec<char> = input.chars().collect();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            current.push(c);
            i += 1;
            continue;
        }
        match c {
            '\'' if !in_double => {
                in_single = true;
                current.push(c);
                i += 1;
            }
            '"' => {
                in_double = !in_double;
                current.push(c);
                i += 1;
            }
            '\\' => {
                current.push(c);
                if i + 1 < chars.len() {
                    current.push(chars[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            // Backtick substitution runs even inside double quotes.
            '`' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j] != '`' {
                    j += 1;
                }
                if j >= chars.len() {
                    return false;
                }
                let inner: String = chars[i + 1..j].iter().collect();
                if !split_segments(&inner, out) {
                    return false;
                }
                current.push(' ');
                i = j + 1;
            }
            '$' if i + 1 < chars.len() && chars[i + 1] == '(' => {
                let mut depth = 1usize;
                let mut j = i + 2;
                while j < chars.len() && depth > 0 {
                    match chars[j] {
                        '(' => depth += 1,
                        ')' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                if depth != 0 {
                    return false;
                }
                let inner: String = chars[i + 2..j - 1].iter().collect();
                if !split_segments(&inner, out) {
                    return false;
                }
                current.push(' ');
                i = j;
            }
            ';' | '\n' | '&' | '|' if !in_double => {
                out.push(std::mem::take(&mut current));
                if (c == '&' || c == '|') && i + 1 < chars.len() && chars[i + 1] == c {
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    if in_single || in_double {
        return false;
    }
    out.push(current);
    true
}

/// Extract the leading executable name from one segment.
///
/// Skips `NAME=value` environment assignments; a redirection before any
/// executable token yields `None` (fail closed). Surrounding quotes and any
/// path prefix are stripped from the executable word.
fn leading_executable(segment: &str) -> Option<String> {
    for token in segment.split_whitespace() {
        if ASSIGNMENT_RE.is_match(token) {
            continue;
        }
        if REDIRECT_RE.is_match(token) {
            return None;
        }
        let token = token.trim_matches(|ch| ch == '"' || ch == '\'');
        let exe = token.rsplit('/').next().unwrap_or(token);
        if exe.is_empty() {
            return None;
        }
        return Some(exe.to_string());
    }
    None
}
