use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::core::document::scalar_to_string;

/// Keys consumed by the outer tool and never forwarded as flags.
const SYSTEM_KEYS: &[&str] = &["args"];

static POSITIONAL_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\d+$").unwrap());

/// The argv derived from merged front matter, ready for the orchestrator to
/// assemble around passthrough flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledArgs {
    /// `_subcommand` prefix, inserted before all other argv
    pub subcommand: Vec<String>,
    /// Flags compiled from config keys
    pub flags: Vec<String>,
    /// Positional section, with `$N` flag mappings applied
    pub positionals: Vec<String>,
}

impl CompiledArgs {
    /// The full argv, in order: subcommand, flags, positionals.
    pub fn into_argv(self, passthrough: &[String]) -> Vec<String> {
        let mut argv = self.subcommand;
        argv.extend(self.flags);
        argv.extend(passthrough.iter().cloned());
        argv.extend(self.positionals);
        argv
    }
}

/// Map merged config + the consumed-template-variable set + the positional
/// array onto driver argv.
pub fn compile(
    config: &Mapping,
    consumed_vars: &BTreeSet<String>,
    positionals: &[String],
) -> CompiledArgs {
    let mut flags = Vec::new();

    for (key, value) in config {
        let Some(key) = key.as_str() else { continue };

        if SYSTEM_KEYS.contains(&key) {
            continue;
        }
        if POSITIONAL_KEY.is_match(key) {
            // Positional mappings are consumed by the positional section
            continue;
        }
        if key.starts_with('$') {
            // Template-variable declarations
            continue;
        }
        if key.starts_with('_') {
            // Internal directives and template-variable defaults
            continue;
        }
        if consumed_vars.contains(key) {
            // Keys referenced by the template are data, not flags
            continue;
        }
        if key == "env" && value.is_mapping() {
            // Mapping form sets process environment, not an arg
            continue;
        }

        match value {
            Value::Null => {}
            Value::Bool(false) => {}
            Value::Bool(true) => flags.push(flag_for(key)),
            Value::Sequence(items) => {
                for item in items {
                    if let Some(s) = scalar_to_string(item) {
                        flags.push(flag_for(key));
                        flags.push(s);
                    }
                }
            }
            Value::Mapping(_) => {
                tracing::debug!("config key `{key}` has a mapping value, skipping");
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    flags.push(flag_for(key));
                    flags.push(s);
                }
            }
        }
    }

    CompiledArgs {
        subcommand: subcommand_prefix(config),
        flags,
        positionals: positional_section(config, positionals),
    }
}

/// Environment additions from the `env` mapping form.
pub fn env_additions(config: &Mapping) -> Vec<(String, String)> {
    let Some(env) = config.get("env").and_then(Value::as_mapping) else {
        return Vec::new();
    };
    env.iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?;
            let value = scalar_to_string(v)?;
            Some((key.to_string(), value))
        })
        .collect()
}

/// Consume the positionals array: each `$N`-declared index is emitted as a
/// flag, everything else trails as a raw positional.
fn positional_section(config: &Mapping, positionals: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for (i, value) in positionals.iter().enumerate() {
        let mapping_key = format!("${}", i + 1);
        let mapped = config.get(mapping_key.as_str()).and_then(scalar_to_string);
        match mapped {
            Some(flagname) => {
                out.push(flag_for(&flagname));
                out.push(value.clone());
            }
            None => out.push(value.clone()),
        }
    }
    out
}

fn subcommand_prefix(config: &Mapping) -> Vec<String> {
    match config.get("_subcommand") {
        Some(Value::Sequence(items)) => {
            items.iter().filter_map(scalar_to_string).collect()
        }
        Some(other) => scalar_to_string(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Single-character keys emit `-k`, everything else `--key`.
fn flag_for(key: &str) -> String {
    if key.chars().count() == 1 {
        format!("-{key}")
    } else {
        format!("--{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(src: &str) -> Mapping {
        serde_yaml::from_str(src).unwrap()
    }

    fn no_vars() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_print_mode_defaults() {
        let c = config("print: true\n");
        let compiled = compile(&c, &no_vars(), &["Say hi.".to_string()]);
        assert_eq!(
            compiled.into_argv(&[]),
            vec!["--print".to_string(), "Say hi.".to_string()]
        );
    }

    #[test]
    fn test_scalar_values_emit_flag_value_pairs() {
        let c = config("model: opus\ntemperature: 0.5\ncount: 3\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(
            compiled.flags,
            vec!["--model", "opus", "--temperature", "0.5", "--count", "3"]
        );
    }

    #[test]
    fn test_single_character_keys_use_short_flags() {
        let c = config("p: true\nm: opus\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.flags, vec!["-p", "-m", "opus"]);
    }

    #[test]
    fn test_false_and_null_skipped() {
        let c = config("verbose: false\nquiet: null\nkeep: true\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.flags, vec!["--keep"]);
    }

    #[test]
    fn test_list_values_repeat_the_flag() {
        let c = config("allow: [read, write]\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.flags, vec!["--allow", "read", "--allow", "write"]);
    }

    #[test]
    fn test_internal_and_dollar_keys_skipped() {
        let c = config(
            "$1: prompt\n$name: default\n_interactive: true\n_cwd: /tmp\n_custom: x\nargs: ignored\nreal: yes_flag\n",
        );
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.flags, vec!["--real", "yes_flag"]);
    }

    #[test]
    fn test_consumed_template_vars_skipped() {
        let c = config("model: opus\nlang: fr\n");
        let consumed: BTreeSet<String> = ["lang".to_string()].into();
        let compiled = compile(&c, &consumed, &[]);
        assert_eq!(compiled.flags, vec!["--model", "opus"]);
    }

    #[test]
    fn test_env_mapping_skipped_env_list_passes_through() {
        let c = config("env:\n  KEY: value\n");
        assert!(compile(&c, &no_vars(), &[]).flags.is_empty());
        assert_eq!(env_additions(&c), vec![("KEY".to_string(), "value".to_string())]);

        let c = config("env: [A=1, B=2]\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.flags, vec!["--env", "A=1", "--env", "B=2"]);
        assert!(env_additions(&c).is_empty());
    }

    #[test]
    fn test_positional_mapping() {
        // $1 maps the first positional (the rendered prompt) onto --prompt
        let c = config("$1: prompt\nsilent: true\n");
        let compiled = compile(
            &c,
            &no_vars(),
            &["Translate hola to English.".to_string()],
        );
        assert_eq!(
            compiled.into_argv(&[]),
            vec![
                "--silent".to_string(),
                "--prompt".to_string(),
                "Translate hola to English.".to_string(),
            ]
        );
    }

    #[test]
    fn test_unmapped_positionals_trail_raw() {
        let c = config("$1: prompt\n");
        let compiled = compile(
            &c,
            &no_vars(),
            &["first".to_string(), "second".to_string()],
        );
        assert_eq!(compiled.positionals, vec!["--prompt", "first", "second"]);
    }

    #[test]
    fn test_subcommand_prefix_string() {
        let c = config("_subcommand: exec\nmodel: gpt-5\n");
        let compiled = compile(&c, &no_vars(), &["go".to_string()]);
        assert_eq!(
            compiled.into_argv(&[]),
            vec!["exec", "--model", "gpt-5", "go"]
        );
    }

    #[test]
    fn test_subcommand_prefix_list() {
        let c = config("_subcommand: [chat, oneshot]\n");
        let compiled = compile(&c, &no_vars(), &[]);
        assert_eq!(compiled.subcommand, vec!["chat", "oneshot"]);
    }

    #[test]
    fn test_passthrough_flags_sit_between_flags_and_positionals() {
        let c = config("print: true\n");
        let compiled = compile(&c, &no_vars(), &["prompt".to_string()]);
        let argv = compiled.into_argv(&["--model".to_string(), "opus".to_string()]);
        assert_eq!(argv, vec!["--print", "--model", "opus", "prompt"]);
    }

    #[test]
    fn test_output_never_contains_internal_keys() {
        let c = config(
            "_subcommand: exec\n$1: prompt\n_foo: bar\n$opt: d\nargs: x\nmodel: m\n",
        );
        let consumed: BTreeSet<String> = ["model".to_string()].into();
        let compiled = compile(&c, &consumed, &["p".to_string()]);
        let argv = compiled.into_argv(&[]);
        for piece in &argv {
            assert!(!piece.starts_with("--_"), "internal key leaked: {piece}");
            assert!(!piece.starts_with("--$"), "dollar key leaked: {piece}");
            assert!(!piece.contains("model"), "consumed var leaked: {piece}");
        }
        assert_eq!(argv, vec!["exec", "--prompt", "p"]);
    }
}
