use serde_yaml::{Mapping, Value};

use super::{ToolAdapter, mapping, remove_keys, set_key};

/// Copilot CLI wants the prompt on `--prompt` and banners silenced; its
/// interactive mode takes the prompt on `--interactive` instead.
pub struct CopilotAdapter;

impl ToolAdapter for CopilotAdapter {
    fn name(&self) -> &str {
        "copilot"
    }

    fn defaults(&self) -> Mapping {
        mapping(&[
            ("$1", Value::String("prompt".into())),
            ("silent", Value::Bool(true)),
        ])
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        let config = remove_keys(config, &["silent"]);
        set_key(config, "$1", Value::String("interactive".into()))
    }
}
