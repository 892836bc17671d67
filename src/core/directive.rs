use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// A directive embedded in an agent body, with the exact span it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    /// Byte offset into the body before any expansion
    pub index: usize,
    /// The exact substring to be replaced
    pub original: String,
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Single file, optionally a 1-indexed inclusive line range
    File {
        path: String,
        line_range: Option<(usize, usize)>,
    },
    /// Glob pattern (contains `*`, `?`, or `[`)
    Glob { pattern: String },
    /// Named declaration extracted from a source file
    Symbol { path: String, name: String },
    /// http/https URL import
    Url { url: String },
    /// Inline shell command
    Command { text: String },
    /// Top-level fenced code block whose first line is a shebang
    ExecFence {
        info_string: String,
        shebang: String,
        code: String,
    },
}

/// Context classification of the body: maximal `normal` substrings where
/// directives may match, plus the start offsets of top-level fenced blocks
/// (the only positions where an `ExecFence` may begin).
#[derive(Debug, Default)]
pub struct SafeScan {
    pub safe_ranges: Vec<Range<usize>>,
    pub unsafe_starts: Vec<usize>,
    fences: Vec<FenceBlock>,
}

/// A top-level fenced code block recorded by the scanner.
#[derive(Debug, Clone)]
struct FenceBlock {
    /// Byte offset of the opening fence line
    start: usize,
    /// End of the block: past the closing fence line, excluding its newline
    end: usize,
    info_string: String,
    /// Span of the code between the fence lines (may be empty)
    code: Range<usize>,
}

// The canonical file-token form. Paths begin with `~`, `.`, or `/` and run
// to the next whitespace.
static FILE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(~?[./][^\s]+)").unwrap());

static URL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(https?://[^\s]+)").unwrap());

static SYMBOL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)#([A-Za-z_$][A-Za-z0-9_$]*)$").unwrap());

static LINE_RANGE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+):(\d+)-(\d+)$").unwrap());

/// Classify every byte of the body as normal, fenced-code, or inline-code
/// context, in a single left-to-right pass.
pub fn scan_contexts(body: &str) -> SafeScan {
    let mut scan = SafeScan::default();
    let mut open_fence: Option<(char, usize, usize, String, usize)> = None;
    // (fence_char, fence_len, start_offset, info_string, code_start)
    let mut safe_from: Option<usize> = None;
    let mut offset = 0usize;

    let mut flush_safe = |scan: &mut SafeScan, from: &mut Option<usize>, upto: usize| {
        if let Some(start) = from.take()
            && start < upto
        {
            scan.safe_ranges.push(start..upto);
        }
    };

    for line in body.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let stripped = line.strip_suffix('\n').unwrap_or(line);
        let stripped = stripped.strip_suffix('\r').unwrap_or(stripped);

        if let Some((ch, len, start, ref info, code_start)) = open_fence {
            // Close on a line starting with at least as many fence chars of
            // the same kind.
            let closes = stripped.chars().take_while(|c| *c == ch).count() >= len;
            if closes {
                scan.fences.push(FenceBlock {
                    start,
                    end: line_start + stripped.len(),
                    info_string: info.clone(),
                    code: code_start..line_start,
                });
                open_fence = None;
            }
            continue;
        }

        if let Some((ch, len, info)) = fence_open(stripped) {
            flush_safe(&mut scan, &mut safe_from, line_start);
            scan.unsafe_starts.push(line_start);
            open_fence = Some((ch, len, line_start, info, offset));
            continue;
        }

        // Normal line: track inline-code spans within it.
        let mut inline_open: Option<usize> = None;
        for (i, b) in line.bytes().enumerate() {
            let pos = line_start + i;
            match inline_open {
                None => {
                    if b == b'`' {
                        flush_safe(&mut scan, &mut safe_from, pos);
                        inline_open = Some(pos);
                    } else if safe_from.is_none() {
                        safe_from = Some(pos);
                    }
                }
                Some(_) => {
                    if b == b'`' {
                        // Closing backtick is part of the inline span
                        inline_open = None;
                    } else if b == b'\n' {
                        // Newline forces a return to normal
                        inline_open = None;
                        safe_from = Some(pos);
                    }
                }
            }
        }
    }

    // Unterminated fence runs to end of body.
    if let Some((_, _, start, info, code_start)) = open_fence {
        scan.fences.push(FenceBlock {
            start,
            end: body.len(),
            info_string: info,
            code: code_start..body.len(),
        });
    }
    flush_safe(&mut scan, &mut safe_from, body.len());

    scan
}

/// Fence openers: up to three leading spaces, then >= 3 backticks or tildes,
/// then the info string.
fn fence_open(line: &str) -> Option<(char, usize, String)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let ch = rest.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = rest.chars().take_while(|c| *c == ch).count();
    if len < 3 {
        return None;
    }
    let info = rest[len..].trim().to_string();
    // Backtick info strings containing backticks are inline code, not fences
    if ch == '`' && info.contains('`') {
        return None;
    }
    Some((ch, len, info))
}

/// Parse the body into its ordered directive list. Pure; no I/O.
pub fn parse_directives(body: &str) -> Vec<Spanned> {
    let scan = scan_contexts(body);
    let mut out = Vec::new();

    for range in &scan.safe_ranges {
        let slice = &body[range.clone()];
        for caps in URL_TOKEN.captures_iter(slice) {
            let m = caps.get(0).unwrap();
            let (token, trimmed_len) = trim_trailing_punct(caps.get(1).unwrap().as_str());
            out.push(Spanned {
                index: range.start + m.start(),
                original: body[range.start + m.start()..range.start + m.start() + 1 + trimmed_len]
                    .to_string(),
                directive: Directive::Url {
                    url: token.to_string(),
                },
            });
        }
        for caps in FILE_TOKEN.captures_iter(slice) {
            let m = caps.get(0).unwrap();
            let (token, trimmed_len) = trim_trailing_punct(caps.get(1).unwrap().as_str());
            if token.is_empty() {
                continue;
            }
            out.push(Spanned {
                index: range.start + m.start(),
                original: body[range.start + m.start()..range.start + m.start() + 1 + trimmed_len]
                    .to_string(),
                directive: classify_path_token(token),
            });
        }
    }

    out.extend(find_inline_commands(body, &scan));
    out.extend(find_exec_fences(body, &scan));

    out.sort_by_key(|s| s.index);
    out
}

/// Quick check used by the orchestrator to skip resolution entirely.
pub fn has_directives(body: &str) -> bool {
    !parse_directives(body).is_empty()
}

/// Trim sentence punctuation from the end of a matched token so prose like
/// `See @./src/*.ts.` yields `./src/*.ts`. Returns the token and its length.
fn trim_trailing_punct(token: &str) -> (&str, usize) {
    let trimmed = token.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
    (trimmed, trimmed.len())
}

fn classify_path_token(token: &str) -> Directive {
    if token.contains(['*', '?', '[']) {
        return Directive::Glob {
            pattern: token.to_string(),
        };
    }
    if let Some(caps) = SYMBOL_SUFFIX.captures(token) {
        return Directive::Symbol {
            path: caps[1].to_string(),
            name: caps[2].to_string(),
        };
    }
    if let Some(caps) = LINE_RANGE_SUFFIX.captures(token) {
        let start: usize = caps[2].parse().unwrap_or(1);
        let end: usize = caps[3].parse().unwrap_or(start);
        return Directive::File {
            path: caps[1].to_string(),
            line_range: Some((start, end)),
        };
    }
    Directive::File {
        path: token.to_string(),
        line_range: None,
    }
}

/// Inline commands: `` !`cmd` `` with a fence of one or more backticks.
/// The `!` must sit in normal context; the content may contain shorter
/// backtick runs than the fence and must stay on one line.
fn find_inline_commands(body: &str, scan: &SafeScan) -> Vec<Spanned> {
    let mut out = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'!' || !in_safe(scan, i) {
            i += 1;
            continue;
        }
        let fence_start = i + 1;
        let fence_len = bytes[fence_start..]
            .iter()
            .take_while(|b| **b == b'`')
            .count();
        if fence_len == 0 {
            i += 1;
            continue;
        }
        let content_start = fence_start + fence_len;
        match find_closing_run(body, content_start, fence_len) {
            Some((close_start, close_end)) => {
                let text = body[content_start..close_start].to_string();
                out.push(Spanned {
                    index: i,
                    original: body[i..close_end].to_string(),
                    directive: Directive::Command { text },
                });
                i = close_end;
            }
            None => i = content_start,
        }
    }

    out
}

/// Find the next backtick run of exactly `len` backticks before a newline.
/// Returns (run_start, run_end).
fn find_closing_run(body: &str, from: usize, len: usize) -> Option<(usize, usize)> {
    let bytes = body.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => return None,
            b'`' => {
                let run = bytes[i..].iter().take_while(|b| **b == b'`').count();
                if run == len {
                    return Some((i, i + run));
                }
                i += run;
            }
            _ => i += 1,
        }
    }
    None
}

fn in_safe(scan: &SafeScan, index: usize) -> bool {
    scan.safe_ranges.iter().any(|r| r.contains(&index))
}

/// Executable fences: top-level fenced blocks whose first code line starts
/// with `#!`. Nested fences were never recorded by the scanner, so only
/// top-level blocks can match here.
fn find_exec_fences(body: &str, scan: &SafeScan) -> Vec<Spanned> {
    let mut out = Vec::new();
    for fence in &scan.fences {
        let code_text = &body[fence.code.clone()];
        let mut lines = code_text.lines();
        let Some(first) = lines.next() else { continue };
        if !first.starts_with("#!") {
            continue;
        }
        let language = fence
            .info_string
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        let rest: String = lines.collect::<Vec<_>>().join("\n");
        out.push(Spanned {
            index: fence.start,
            original: body[fence.start..fence.end].to_string(),
            directive: Directive::ExecFence {
                info_string: language,
                shebang: first.to_string(),
                code: rest,
            },
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(body: &str) -> Vec<Directive> {
        parse_directives(body)
            .into_iter()
            .map(|s| s.directive)
            .collect()
    }

    // === Span invariants ===

    #[test]
    fn test_spans_match_source_and_ascend() {
        let body = "Read @./a.md then run !`echo hi` and fetch @https://x.io/d.md\n";
        let directives = parse_directives(body);
        assert_eq!(directives.len(), 3);
        let mut last_end = 0;
        for d in &directives {
            assert_eq!(&body[d.index..d.index + d.original.len()], d.original);
            assert!(d.index >= last_end, "spans must not overlap");
            last_end = d.index + d.original.len();
        }
    }

    #[test]
    fn test_empty_body() {
        assert!(parse_directives("").is_empty());
    }

    #[test]
    fn test_body_of_only_a_fence_without_shebang() {
        let body = "```md\n@./secret.txt\n```\n";
        assert!(parse_directives(body).is_empty());
    }

    // === File/glob/symbol/range classification ===

    #[test]
    fn test_plain_file_import() {
        let body = "See @./notes.md for details";
        assert_eq!(
            kinds(body),
            vec![Directive::File {
                path: "./notes.md".to_string(),
                line_range: None
            }]
        );
    }

    #[test]
    fn test_home_and_absolute_paths() {
        let body = "@~/todo.md and @/etc/hosts";
        assert_eq!(
            kinds(body),
            vec![
                Directive::File {
                    path: "~/todo.md".to_string(),
                    line_range: None
                },
                Directive::File {
                    path: "/etc/hosts".to_string(),
                    line_range: None
                },
            ]
        );
    }

    #[test]
    fn test_glob_classification() {
        assert_eq!(
            kinds("Bundle @./src/*.ts here"),
            vec![Directive::Glob {
                pattern: "./src/*.ts".to_string()
            }]
        );
        assert_eq!(
            kinds("Bundle @./src/file?.ts here"),
            vec![Directive::Glob {
                pattern: "./src/file?.ts".to_string()
            }]
        );
    }

    #[test]
    fn test_trailing_sentence_punctuation_trimmed() {
        let directives = parse_directives("See @./src/*.ts.");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].original, "@./src/*.ts");
        assert_eq!(
            directives[0].directive,
            Directive::Glob {
                pattern: "./src/*.ts".to_string()
            }
        );
    }

    #[test]
    fn test_symbol_slice() {
        assert_eq!(
            kinds("Check @./src/api.ts#fetchUser now"),
            vec![Directive::Symbol {
                path: "./src/api.ts".to_string(),
                name: "fetchUser".to_string()
            }]
        );
    }

    #[test]
    fn test_line_range() {
        assert_eq!(
            kinds("Read @./src/main.rs:10-42 closely"),
            vec![Directive::File {
                path: "./src/main.rs".to_string(),
                line_range: Some((10, 42))
            }]
        );
    }

    #[test]
    fn test_url_import() {
        assert_eq!(
            kinds("Fetch @https://example.com/spec.md now"),
            vec![Directive::Url {
                url: "https://example.com/spec.md".to_string()
            }]
        );
    }

    #[test]
    fn test_bare_at_without_path_prefix_ignored() {
        assert!(parse_directives("mail me at user@example.com").is_empty());
    }

    // === Inline commands ===

    #[test]
    fn test_inline_command() {
        let directives = parse_directives("Status: !`git status` done");
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].original, "!`git status`");
        assert_eq!(
            directives[0].directive,
            Directive::Command {
                text: "git status".to_string()
            }
        );
    }

    #[test]
    fn test_inline_command_with_double_fence() {
        let directives = parse_directives("Run !``echo `hostname` `` now");
        assert_eq!(directives.len(), 1);
        assert_eq!(
            directives[0].directive,
            Directive::Command {
                text: "echo `hostname` ".to_string()
            }
        );
    }

    #[test]
    fn test_unclosed_inline_command_ignored() {
        assert!(parse_directives("Broken !`no closing fence\nnext line").is_empty());
    }

    // === Context gating ===

    #[test]
    fn test_directives_inside_fences_ignored() {
        let body = "See @./src/*.ts.\n\n```md\nExample: @./secret.txt\n```\n";
        let directives = parse_directives(body);
        assert_eq!(directives.len(), 1);
        assert_eq!(
            directives[0].directive,
            Directive::Glob {
                pattern: "./src/*.ts".to_string()
            }
        );
    }

    #[test]
    fn test_directives_inside_inline_code_ignored() {
        assert!(parse_directives("Literal `@./x.md` stays").is_empty());
        assert!(parse_directives("Literal `!`").is_empty());
    }

    #[test]
    fn test_tilde_fences() {
        let body = "~~~\n@./hidden.md\n~~~\n@./visible.md\n";
        assert_eq!(
            kinds(body),
            vec![Directive::File {
                path: "./visible.md".to_string(),
                line_range: None
            }]
        );
    }

    #[test]
    fn test_fence_close_requires_same_char_and_length() {
        // A shorter run does not close; a tilde run does not close backticks.
        let body = "````\n```\n~~~~\n@./still-inside.md\n````\n";
        assert!(parse_directives(body).is_empty());
    }

    // === Exec fences ===

    #[test]
    fn test_exec_fence_detected_at_top_level() {
        let body = "Now:\n```ts\n#!/usr/bin/env node\nconsole.log(1)\n```\n";
        let directives = parse_directives(body);
        assert_eq!(directives.len(), 1);
        match &directives[0].directive {
            Directive::ExecFence {
                info_string,
                shebang,
                code,
            } => {
                assert_eq!(info_string, "ts");
                assert_eq!(shebang, "#!/usr/bin/env node");
                assert_eq!(code, "console.log(1)");
            }
            other => panic!("expected exec fence, got {other:?}"),
        }
        assert_eq!(
            directives[0].original,
            "```ts\n#!/usr/bin/env node\nconsole.log(1)\n```"
        );
    }

    #[test]
    fn test_exec_fence_index_is_an_unsafe_start() {
        let body = "Intro\n```sh\n#!/bin/sh\necho ok\n```\n";
        let scan = scan_contexts(body);
        let directives = parse_directives(body);
        assert_eq!(directives.len(), 1);
        assert!(scan.unsafe_starts.contains(&directives[0].index));
    }

    #[test]
    fn test_fence_without_shebang_is_not_executable() {
        let body = "```sh\necho ok\n```\n";
        assert!(parse_directives(body).is_empty());
    }

    #[test]
    fn test_nested_fence_never_executes() {
        // The outer fence is four backticks; the inner three-backtick block
        // with a shebang is plain content.
        let body = "````md\n```sh\n#!/bin/sh\nrm -rf /\n```\n````\n";
        assert!(parse_directives(body).is_empty());
    }

    #[test]
    fn test_unterminated_fence_runs_to_eof() {
        let body = "```sh\n#!/bin/sh\necho ok\n";
        let directives = parse_directives(body);
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].original, body);
    }

    #[test]
    fn test_indented_fence_opens() {
        let body = "   ```sh\n#!/bin/sh\necho hi\n```\n";
        assert_eq!(parse_directives(body).len(), 1);
    }

    #[test]
    fn test_four_space_indent_is_not_a_fence() {
        let body = "    ```sh\n@./still-normal.md\n";
        // The "fence" is an indented code block we do not model, so the
        // body stays normal and the file token matches.
        assert_eq!(
            kinds(body),
            vec![Directive::File {
                path: "./still-normal.md".to_string(),
                line_range: None
            }]
        );
    }

    // === Safe-range structure ===

    #[test]
    fn test_safe_ranges_exclude_fences() {
        let body = "a\n```\nb\n```\nc\n";
        let scan = scan_contexts(body);
        for r in &scan.safe_ranges {
            assert!(!body[r.clone()].contains("```"));
        }
        assert_eq!(scan.unsafe_starts.len(), 1);
        assert_eq!(scan.unsafe_starts[0], 2);
    }

    #[test]
    fn test_ordering_is_ascending_by_index() {
        let body = "!`b` then @./a.md\n```sh\n#!/bin/sh\ntrue\n```\n";
        let directives = parse_directives(body);
        let indices: Vec<usize> = directives.iter().map(|d| d.index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
        assert_eq!(directives.len(), 3);
    }
}
