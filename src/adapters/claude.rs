use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, remove_keys};

/// Claude Code: non-interactive runs pass the prompt with `--print`.
pub struct ClaudeAdapter;

impl ToolAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[("print", Value::Bool(true))])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        remove_keys(config, &["print"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_print_mode() {
        let defaults = ClaudeAdapter.defaults();
        assert_eq!(
            defaults.get(Value::String("print".into())),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_interactive_drops_print() {
        let config = ClaudeAdapter.defaults();
        let out = ClaudeAdapter.apply_interactive(config);
        assert!(!out.contains_key(Value::String("print".into())));
    }

    #[test]
    fn test_interactive_keeps_other_keys() {
        let mut config = ClaudeAdapter.defaults();
        config.insert(
            Value::String("model".into()),
            Value::String("opus".into()),
        );
        let out = ClaudeAdapter.apply_interactive(config);
        assert_eq!(
            out.get(Value::String("model".into())),
            Some(&Value::String("opus".into()))
        );
    }
}
