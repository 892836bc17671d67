pub mod claude;
pub mod codex;
pub mod copilot;
pub mod droid;
pub mod gemini;
pub mod opencode;

use serde_yaml::{Mapping, Value};

/// Capability set for one downstream AI driver.
///
/// Adapters are pure: `defaults` contributes the built-in config layer for
/// the tool, and `apply_interactive` rewrites print-mode defaults into the
/// tool's interactive-mode equivalents.
pub trait ToolAdapter {
    /// Canonical tool identifier (`claude`, `codex`, ...)
    fn name(&self) -> &str;

    /// Key/value defaults contributed as the built-in config layer.
    fn defaults(&self) -> Mapping;

    /// Convert print-mode config into this tool's interactive equivalent.
    fn apply_interactive(&self, config: Mapping) -> Mapping;
}

/// Adapter for tools the registry does not know: contributes no defaults
/// and removes only the interactive marker keys.
pub struct DefaultAdapter {
    name: String,
}

impl ToolAdapter for DefaultAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn defaults(&self) -> Mapping {
        Mapping::new()
    }

    fn apply_interactive(&self, config: Mapping) -> Mapping {
        remove_keys(config, &["_interactive", "_i"])
    }
}

/// Look up the adapter for a driver name; unknown names get the default
/// adapter.
pub fn adapter_for(name: &str) -> Box<dyn ToolAdapter> {
    match name {
        "claude" => Box::new(claude::ClaudeAdapter),
        "codex" => Box::new(codex::CodexAdapter),
        "copilot" => Box::new(copilot::CopilotAdapter),
        "droid" => Box::new(droid::DroidAdapter),
        "gemini" => Box::new(gemini::GeminiAdapter),
        "opencode" => Box::new(opencode::OpencodeAdapter),
        other => Box::new(DefaultAdapter {
            name: other.to_string(),
        }),
    }
}

/// Every registered adapter, for building the built-in config layer.
pub fn builtin_adapters() -> Vec<Box<dyn ToolAdapter>> {
    vec![
        Box::new(claude::ClaudeAdapter),
        Box::new(codex::CodexAdapter),
        Box::new(copilot::CopilotAdapter),
        Box::new(droid::DroidAdapter),
        Box::new(gemini::GeminiAdapter),
        Box::new(opencode::OpencodeAdapter),
    ]
}

/// The built-in defaults layer: one `commands` entry per registered tool.
pub fn builtin_layer() -> Mapping {
    let mut commands = Mapping::new();
    for adapter in builtin_adapters() {
        commands.insert(
            Value::String(adapter.name().to_string()),
            Value::Mapping(adapter.defaults()),
        );
    }
    let mut layer = Mapping::new();
    layer.insert(
        Value::String("commands".to_string()),
        Value::Mapping(commands),
    );
    layer
}

// ---------- Shared helpers ----------

pub(crate) fn mapping(pairs: &[(&str, Value)]) -> Mapping {
    pairs
        .iter()
        .map(|(k, v)| (Value::String(k.to_string()), v.clone()))
        .collect()
}

pub(crate) fn remove_keys(mut config: Mapping, keys: &[&str]) -> Mapping {
    for key in keys {
        config.remove(Value::String(key.to_string()));
    }
    config
}

pub(crate) fn set_key(mut config: Mapping, key: &str, value: Value) -> Mapping {
    config.insert(Value::String(key.to_string()), value);
    config
}
