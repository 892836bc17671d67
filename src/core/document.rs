use serde_yaml::{Mapping, Value};

use crate::core::error::{AgentError, Result};

/// A parsed agent file: structured front matter plus the prompt body.
///
/// Immutable after parse. The mapping keeps the source's insertion order,
/// but nothing outside debug output may observe that order.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Parsed YAML front matter (empty when the file has none)
    pub config: Mapping,
    /// Everything after the front matter block
    pub body: String,
}

impl Document {
    /// Parse a document from raw file content.
    ///
    /// Front matter is a YAML mapping delimited by `---` on its own line at
    /// the start of the file. Files without an opening delimiter are all
    /// body.
    pub fn parse(raw: &str) -> Result<Self> {
        let content = raw.trim_start_matches('\u{feff}');

        let (first_line, rest) = split_first_line(content);
        if first_line.trim_end() != "---" {
            return Ok(Document {
                config: Mapping::new(),
                body: content.to_string(),
            });
        }

        // Walk line by line looking for the closing delimiter.
        let mut cursor = rest;
        let mut yaml_len = 0usize;
        let mut body_start = None;
        while !cursor.is_empty() {
            let (line, after) = split_first_line(cursor);
            let consumed = cursor.len() - after.len();
            if line.trim_end() == "---" {
                body_start = Some(after);
                break;
            }
            yaml_len += consumed;
            cursor = after;
        }

        let body = match body_start {
            Some(b) => b,
            None => {
                return Err(AgentError::Configuration(
                    "unterminated front matter: missing closing ---".to_string(),
                ));
            }
        };

        let yaml_src = &rest[..yaml_len];
        let config = parse_front_matter_yaml(yaml_src)?;

        Ok(Document {
            config,
            body: body.to_string(),
        })
    }

}

fn parse_front_matter_yaml(yaml_src: &str) -> Result<Mapping> {
    if yaml_src.trim().is_empty() {
        return Ok(Mapping::new());
    }

    let parsed: Value = serde_yaml::from_str(yaml_src).map_err(|e| {
        // serde_yaml includes line/column in its Display output
        AgentError::Configuration(format!("invalid front matter: {e}"))
    })?;

    let mut mapping = match parsed {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        _ => {
            return Err(AgentError::Configuration(
                "front matter must be a YAML mapping".to_string(),
            ));
        }
    };

    coerce_env_values(&mut mapping);
    Ok(mapping)
}

/// Split off the first line, supporting `\n`, `\r\n`, and a bare `\r`.
fn split_first_line(content: &str) -> (&str, &str) {
    match content.find(['\n', '\r']) {
        Some(idx) => {
            let bytes = content.as_bytes();
            let next = if bytes[idx] == b'\r'
                && idx + 1 < bytes.len()
                && bytes[idx + 1] == b'\n'
            {
                idx + 2
            } else {
                idx + 1
            };
            (&content[..idx], &content[next..])
        }
        None => (content, ""),
    }
}

/// The `env` key is the one place the parser coerces types: scalar values
/// become strings whether the author wrote them as number, bool, or string.
/// All other keys keep their parsed type.
fn coerce_env_values(config: &mut Mapping) {
    let key = Value::String("env".to_string());
    let Some(env) = config.get_mut(&key) else {
        return;
    };

    match env {
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                if let Some(s) = scalar_to_string(v) {
                    *v = Value::String(s);
                }
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                if let Some(s) = scalar_to_string(v) {
                    *v = Value::String(s);
                }
            }
        }
        other => {
            if let Some(s) = scalar_to_string(other) {
                *other = Value::String(s);
            }
        }
    }
}

/// Render a scalar YAML value as its string form. Non-scalars return None.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => None,
    }
}
