/// Per-file input cap, also applied to piped stdin collection.
pub const MAX_INPUT_SIZE: u64 = 10 * 1024 * 1024;

/// Inline command / exec fence output cap, in characters.
pub const MAX_COMMAND_OUTPUT: usize = 100_000;

/// Default context window when neither config nor environment says better.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Resolve the context limit in tokens.
///
/// Precedence: per-file `context_window` front matter, then the
/// `MDFLOW_CONTEXT_WINDOW` / `MA_CONTEXT_WINDOW` override, then the window
/// implied by `MDFLOW_MODEL` / `MA_MODEL`, then the default.
pub fn resolve_context_limit(front_matter_override: Option<usize>) -> usize {
    if let Some(limit) = front_matter_override {
        return limit;
    }
    if let Some(limit) = env_any(&["MDFLOW_CONTEXT_WINDOW", "MA_CONTEXT_WINDOW"])
        .and_then(|v| v.parse::<usize>().ok())
    {
        return limit;
    }
    if let Some(model) = env_any(&["MDFLOW_MODEL", "MA_MODEL"]) {
        return model_context_window(&model);
    }
    DEFAULT_CONTEXT_WINDOW
}

/// When set, the glob token ceiling is disabled.
pub fn force_context() -> bool {
    env_any(&["MDFLOW_FORCE_CONTEXT", "MA_FORCE_CONTEXT"]).is_some()
}

/// Context window for a model name, matched by family prefix.
pub fn model_context_window(model: &str) -> usize {
    let m = model.to_lowercase();
    if m.starts_with("gemini") {
        1_048_576
    } else if m.starts_with("gpt") || m.starts_with("o3") || m.starts_with("codex") {
        272_000
    } else if m.starts_with("claude") {
        200_000
    } else {
        DEFAULT_CONTEXT_WINDOW
    }
}

fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| std::env::var(n).ok())
        .find(|v| !v.is_empty())
}
