//! Auto-print rewriting for submitted cells.
//!
//! Interactive notebooks echo the value of a trailing bare expression, the
//! way the Python REPL does. The worker only ever `exec`s whole blocks, so the
//! final top-level statement is rewritten to compile in `'single'` mode, which
//! routes its value through `sys.displayhook`. The rewrite applies only when
//! the interpreter's own parser accepts that statement as one expression.

use std::borrow::Cow;

use serde::Serialize;

const DEFINITION_PREFIXES: &[&str] = &["def ", "def\t", "async def ", "class ", "class\t", "@"];

/// A proposed rewrite of a cell's final top-level statement.
///
/// Whether the statement really is a single expression is left to the
/// interpreter that will run the cell; only its own parser answers that
/// reliably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoPrint {
    /// Source of the final statement, lines joined with `\n`
    pub candidate: String,
    /// The whole cell with the candidate replaced by a displaying statement
    pub rewritten: String,
}

/// Finds the final top-level statement of `code` and prepares its rewrite.
///
/// `None` when the cell is blank, ends in a definition, or its last
/// statement starts indented.
pub fn plan(code: &str) -> Option<AutoPrint> {
    let lines: Vec<&str> = code.lines().collect();

    let mut end = lines.len();
    while end > 0 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    if end == 0 {
        return None;
    }

    // Walk back over indented continuation lines to the statement's first line.
    let mut start = end - 1;
    while start > 0 && is_continuation(lines[start]) {
        start -= 1;
    }

    let candidate = lines[start..end].join("\n");
    if candidate.starts_with(char::is_whitespace)
        || DEFINITION_PREFIXES.iter().any(|p| candidate.starts_with(p))
    {
        return None;
    }

    let mut rewritten = lines[..start].join("\n");
    if start > 0 {
        rewritten.push('\n');
    }
    rewritten.push_str(&display_statement(&candidate));
    Some(AutoPrint {
        candidate,
        rewritten,
    })
}

/// Rewrites the final top-level statement of `code` so its value is displayed.
///
/// `is_expression` decides whether the candidate statement parses as exactly
/// one expression statement. The input comes back unchanged (borrowed,
/// byte-identical) when there is no candidate or the check says no.
pub fn auto_print(code: &str, is_expression: impl FnOnce(&str) -> bool) -> Cow<'_, str> {
    match plan(code) {
        Some(plan) if is_expression(&plan.candidate) => Cow::Owned(plan.rewritten),
        _ => Cow::Borrowed(code),
    }
}

fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t'])
}

fn display_statement(statement: &str) -> String {
    format!(
        "exec(compile('{}' + '\\n', '<cell>', 'single'))",
        escape_single_quoted(statement)
    )
}

/// Escapes text for embedding in a single-quoted Python string literal.
/// The literal must stay on one line and must not terminate early.
fn escape_single_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\u0027"),
            '\n' => out.push_str("\\u000a"),
            '\r' => out.push_str("\\u000d"),
            _ => out.push(ch),
        }
    }
    out
}
