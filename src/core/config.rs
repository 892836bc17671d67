use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

/// Project config filenames, checked in order; first match wins.
pub const PROJECT_CONFIG_NAMES: &[&str] =
    &["mdflow.config.yaml", ".mdflow.yaml", ".mdflow.json"];

/// Load the full configuration cascade for one invocation.
///
/// Layers in order of increasing precedence: built-in adapter defaults,
/// the user global `~/.mdflow/config.yaml`, the project config at the git
/// root, and the project config in the working directory. Parse errors at
/// any layer degrade silently to an empty layer.
///
/// Pure in the filesystem sense: every call re-reads; callers may cache.
pub fn load_cascade(cwd: &Path, builtin: Mapping) -> Mapping {
    let mut merged = builtin;

    if let Some(home) = dirs::home_dir() {
        let user = load_config_file(&home.join(".mdflow").join("config.yaml"));
        merged = merge(&merged, &user);
    }

    if let Some(git_root) = find_git_root(cwd)
        && git_root != cwd
    {
        let project = load_project_layer(&git_root);
        merged = merge(&merged, &project);
    }

    let local = load_project_layer(cwd);
    merge(&merged, &local)
}

/// Read the first existing project config file in `dir`.
pub fn load_project_layer(dir: &Path) -> Mapping {
    for name in PROJECT_CONFIG_NAMES {
        let path = dir.join(name);
        if path.is_file() {
            return load_config_file(&path);
        }
    }
    Mapping::new()
}

/// Read one config file as a mapping. Unreadable or malformed files are an
/// empty layer, logged at debug level.
pub fn load_config_file(path: &Path) -> Mapping {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Mapping::new();
    };

    let parsed: Option<Value> = if path.extension().and_then(|e| e.to_str()) == Some("json")
    {
        serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .and_then(|json| serde_yaml::to_value(json).ok())
    } else {
        serde_yaml::from_str(&content).ok()
    };

    match parsed {
        Some(Value::Mapping(m)) => m,
        Some(_) | None => {
            tracing::debug!("ignoring malformed config layer: {}", path.display());
            Mapping::new()
        }
    }
}

/// Shallow merge per top-level key, except `commands`, which merges by
/// command name; inside each command, overlay keys replace base keys.
pub fn merge(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut out = base.clone();
    for (key, value) in overlay {
        if key.as_str() == Some("commands") {
            let base_cmds = out.get(key).and_then(Value::as_mapping).cloned();
            if let (Some(base_cmds), Some(over_cmds)) = (base_cmds, value.as_mapping()) {
                out.insert(
                    key.clone(),
                    Value::Mapping(merge_commands(&base_cmds, over_cmds)),
                );
                continue;
            }
        }
        out.insert(key.clone(), value.clone());
    }
    out
}

fn merge_commands(base: &Mapping, overlay: &Mapping) -> Mapping {
    let mut out = base.clone();
    for (name, value) in overlay {
        let merged = match (out.get(name).and_then(Value::as_mapping), value.as_mapping())
        {
            (Some(base_cmd), Some(over_cmd)) => {
                let mut inner = base_cmd.clone();
                for (k, v) in over_cmd {
                    inner.insert(k.clone(), v.clone());
                }
                Value::Mapping(inner)
            }
            _ => value.clone(),
        };
        out.insert(name.clone(), merged);
    }
    out
}

/// Defaults configured for one command across the merged cascade.
pub fn command_defaults(cascade: &Mapping, tool: &str) -> Mapping {
    cascade
        .get(Value::String("commands".to_string()))
        .and_then(Value::as_mapping)
        .and_then(|cmds| cmds.get(Value::String(tool.to_string())))
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default()
}

/// The nearest ancestor directory containing a `.git` entry. A regular
/// directory or a file both count (the latter for worktrees).
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    while let Some(d) = dir {
        if d.join(".git").exists() {
            return Some(d);
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    None
}
