use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, remove_keys};

/// Opencode runs one-shot prompts through `opencode run`.
pub struct OpencodeAdapter;

impl ToolAdapter for OpencodeAdapter {
    fn name(&self) -> &str {
        "opencode"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[("_subcommand", Value::String("run".into()))])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        remove_keys(config, &["_subcommand"])
    }
}
