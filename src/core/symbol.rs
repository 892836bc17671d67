use std::path::Path;

use regex::Regex;

use crate::core::error::{AgentError, Result};

/// Lift a single named declaration out of source text by brace/paren
/// tracking.
///
/// This is cheap static slicing, not a parser: it finds the first line that
/// opens a matching declaration, then counts `{}` and `()` while respecting
/// string literals. Chained member access continued on a following line may
/// over-include; exotic source is best-effort by design.
pub fn extract_symbol(source: &str, name: &str, path: &Path) -> Result<String> {
    let lines: Vec<&str> = source.lines().collect();
    let pattern = declaration_pattern(name);

    let start = lines
        .iter()
        .position(|line| pattern.is_match(line.trim_start()))
        .ok_or_else(|| AgentError::SymbolNotFound {
            path: path.to_path_buf(),
            name: name.to_string(),
        })?;

    let mut brace_depth = 0i64;
    let mut paren_depth = 0i64;
    let mut state = StringState::None;

    for (i, line) in lines.iter().enumerate().skip(start) {
        scan_line(line, &mut brace_depth, &mut paren_depth, &mut state);

        if brace_depth > 0 || paren_depth > 0 || state != StringState::None {
            continue;
        }

        let trimmed = line.trim_end();
        let terminated = trimmed.ends_with(';') || trimmed.ends_with('}');
        let continues = lines
            .get(i + 1)
            .is_some_and(|next| next.trim_start().starts_with('.'));

        if terminated || !continues {
            return Ok(lines[start..=i].join("\n"));
        }
    }

    // No end found: everything from the start to end of file.
    Ok(lines[start..].join("\n"))
}

/// Declaration starters, each with optional `export`, `async`, `abstract`
/// prefixes.
fn declaration_pattern(name: &str) -> Regex {
    let n = regex::escape(name);
    let pattern = format!(
        r"^(?:export\s+)?(?:(?:(?:abstract\s+)?class|interface|enum)\s+{n}\b|type\s+{n}\s*(?:<[^>]*>)?\s*=|(?:async\s+)?function\s+{n}\s*(?:<[^>]*>)?\s*\(|(?:const|let|var)\s+{n}\s*(?::[^=\n]*)?=)"
    );
    Regex::new(&pattern).expect("declaration pattern must compile")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringState {
    None,
    Single,
    Double,
    Backtick,
}

/// Count braces and parens on one line, skipping the contents of single,
/// double, and back-tick string literals with backslash escapes. Back-tick
/// literals span lines; the others reset at end of line.
fn scan_line(line: &str, braces: &mut i64, parens: &mut i64, state: &mut StringState) {
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match *state {
            StringState::None => match c {
                '{' => *braces += 1,
                '}' => *braces -= 1,
                '(' => *parens += 1,
                ')' => *parens -= 1,
                '\'' => *state = StringState::Single,
                '"' => *state = StringState::Double,
                '`' => *state = StringState::Backtick,
                _ => {}
            },
            StringState::Single => match c {
                '\\' => {
                    chars.next();
                }
                '\'' => *state = StringState::None,
                _ => {}
            },
            StringState::Double => match c {
                '\\' => {
                    chars.next();
                }
                '"' => *state = StringState::None,
                _ => {}
            },
            StringState::Backtick => match c {
                '\\' => {
                    chars.next();
                }
                '`' => *state = StringState::None,
                _ => {}
            },
        }
    }

    // Unterminated quote literals do not leak across lines
    if *state == StringState::Single || *state == StringState::Double {
        *state = StringState::None;
    }
}
