use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_yaml::{Mapping, Value};

use crate::core::document::scalar_to_string;

/// Front-matter keys that steer the outer tool and never become template
/// variable defaults.
pub const INTERNAL_KEYS: &[&str] = &["_interactive", "_i", "_cwd", "_subcommand"];

/// Flags consumed by the outer tool and never forwarded to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HijackedFlags {
    pub command: Option<String>,
    pub interactive: bool,
    pub dry_run: bool,
    pub trust: bool,
    pub no_cache: bool,
    pub cwd: Option<PathBuf>,
}

/// The remaining CLI after the agent file argument, split into hijacked
/// flags, template-variable flags, passthrough flags, and positionals.
#[derive(Debug, Clone, Default)]
pub struct ParsedArgs {
    pub hijacked: HijackedFlags,
    /// `--_name value` / `--_name=value` bindings, names keep the `_`
    pub var_flags: Vec<(String, String)>,
    /// Unrecognized flags (with their values), forwarded to the driver
    pub passthrough: Vec<String>,
    /// Bare positional arguments
    pub positionals: Vec<String>,
}

/// Extract hijacked and template-variable flags from the raw argument list.
pub fn parse_remaining_args(args: &[String]) -> ParsedArgs {
    let mut parsed = ParsedArgs::default();
    let mut i = 0usize;

    while i < args.len() {
        let arg = args[i].as_str();
        let next_value = |i: usize| -> Option<String> {
            args.get(i + 1)
                .filter(|v| !v.starts_with('-'))
                .cloned()
        };

        match arg {
            "--_command" | "-_c" => {
                if let Some(v) = next_value(i) {
                    parsed.hijacked.command = Some(v);
                    i += 1;
                }
            }
            "--_interactive" | "-_i" => parsed.hijacked.interactive = true,
            "--_dry-run" => parsed.hijacked.dry_run = true,
            "--_trust" => parsed.hijacked.trust = true,
            "--_no-cache" => parsed.hijacked.no_cache = true,
            "--_cwd" => {
                if let Some(v) = next_value(i) {
                    parsed.hijacked.cwd = Some(PathBuf::from(v));
                    i += 1;
                }
            }
            _ if arg.starts_with("--_command=") => {
                parsed.hijacked.command =
                    Some(arg["--_command=".len()..].to_string());
            }
            _ if arg.starts_with("--_cwd=") => {
                parsed.hijacked.cwd = Some(PathBuf::from(&arg["--_cwd=".len()..]));
            }
            _ if arg.starts_with("--_") => {
                // Template-variable flag: --_name value, --_name=value, or
                // a bare --_name meaning "true"
                let body = &arg[2..];
                if let Some((name, value)) = body.split_once('=') {
                    parsed.var_flags.push((name.to_string(), value.to_string()));
                } else if let Some(v) = next_value(i) {
                    parsed.var_flags.push((body.to_string(), v));
                    i += 1;
                } else {
                    parsed.var_flags.push((body.to_string(), "true".to_string()));
                }
            }
            _ if arg.starts_with('-') => {
                parsed.passthrough.push(arg.to_string());
                // A following non-flag token is this flag's value
                if !arg.contains('=')
                    && let Some(v) = next_value(i)
                {
                    parsed.passthrough.push(v);
                    i += 1;
                }
            }
            _ => parsed.positionals.push(arg.to_string()),
        }
        i += 1;
    }

    parsed
}

/// Assemble the variable binding set, lowest to highest precedence:
/// `_`-prefixed front-matter defaults (excluding internal keys), CLI
/// variable flags, positionals as `_1..` plus `_args`, and piped stdin as
/// `_stdin`.
pub fn build_bindings(
    config: &Mapping,
    parsed: &ParsedArgs,
    stdin: Option<String>,
) -> BTreeMap<String, String> {
    let mut bindings = BTreeMap::new();

    for (key, value) in config {
        let Some(key) = key.as_str() else { continue };
        let name = if let Some(rest) = key.strip_prefix('$') {
            // `$name` (non-positional) declares the `_name` default too
            if rest.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            format!("_{rest}")
        } else if key.starts_with('_') && !INTERNAL_KEYS.contains(&key) {
            key.to_string()
        } else {
            continue;
        };
        if let Some(v) = scalar_to_string(value) {
            bindings.insert(name, v);
        }
    }

    for (name, value) in &parsed.var_flags {
        bindings.insert(name.clone(), value.clone());
    }

    for (i, value) in parsed.positionals.iter().enumerate() {
        bindings.insert(format!("_{}", i + 1), value.clone());
    }
    if !parsed.positionals.is_empty() {
        bindings.insert("_args".to_string(), format_args_list(&parsed.positionals));
    }

    if let Some(stdin) = stdin {
        bindings.insert("_stdin".to_string(), stdin);
    }

    bindings
}

/// Interactive-mode detection from front matter: any presence of
/// `_interactive`/`_i` that is not literally `false` activates it (a bare
/// `_i:` YAML key counts).
pub fn config_interactive(config: &Mapping) -> bool {
    for key in ["_interactive", "_i"] {
        if let Some(value) = config.get(key) {
            return !matches!(value, Value::Bool(false));
        }
    }
    false
}

fn format_args_list(positionals: &[String]) -> String {
    positionals
        .iter()
        .map(|p| {
            if p.contains(char::is_whitespace) {
                format!("\"{p}\"")
            } else {
                p.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
