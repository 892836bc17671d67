use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, set_key};

/// Gemini CLI takes the prompt on `--prompt`; interactive sessions start
/// with `--prompt-interactive` instead.
pub struct GeminiAdapter;

impl ToolAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[("$1", Value::String("prompt".into()))])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        set_key(config, "$1", Value::String("prompt-interactive".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_prompt_positional() {
        assert_eq!(
            GeminiAdapter.defaults().get(Value::String("$1".into())),
            Some(&Value::String("prompt".into()))
        );
    }

    #[test]
    fn test_interactive_switches_to_prompt_interactive() {
        let out = GeminiAdapter.apply_interactive(GeminiAdapter.defaults());
        assert_eq!(
            out.get(Value::String("$1".into())),
            Some(&Value::String("prompt-interactive".into()))
        );
    }
}
