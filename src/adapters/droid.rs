use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, remove_keys};

/// Droid runs one-shot prompts through `droid exec`.
pub struct DroidAdapter;

impl ToolAdapter for DroidAdapter {
    fn name(&self) -> &str {
        "droid"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[("_subcommand", Value::String("exec".into()))])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        remove_keys(config, &["_subcommand"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_drops_subcommand() {
        let out = DroidAdapter.apply_interactive(DroidAdapter.defaults());
        assert!(out.is_empty());
    }
}
