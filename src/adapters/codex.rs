use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, remove_keys};

/// Codex gates non-interactive runs behind the `exec` subcommand.
pub struct CodexAdapter;

impl ToolAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[("_subcommand", Value::String("exec".into()))])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        remove_keys(config, &["_subcommand"])
    }
}
