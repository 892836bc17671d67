use crate::core::error::{AgentError, Result};

const ACCEPT: &str = "text/markdown, application/json, text/plain, */*";

/// Content types accepted without sniffing.
const ALLOWED_TYPES: &[&str] = &[
    "text/markdown",
    "text/x-markdown",
    "text/plain",
    "application/json",
    "application/x-json",
    "text/json",
];

/// Fetch a URL and return its body as trimmed text.
///
/// Fails on HTTP >= 400 and on content the downstream prompt cannot use:
/// anything that is not markdown, plain text, or JSON by declared type or,
/// when the type is missing or generic, by inspection.
pub async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, ACCEPT)
        .send()
        .await
        .map_err(|e| AgentError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(AgentError::Network {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(base_type)
        .unwrap_or_default();

    let body = response.text().await.map_err(|e| AgentError::Network {
        url: url.to_string(),
        reason: format!("reading body: {e}"),
    })?;

    if ALLOWED_TYPES.contains(&content_type.as_str())
        || looks_like_json(&body)
        || looks_like_markdown(url, &body)
    {
        return Ok(body.trim().to_string());
    }

    Err(AgentError::UnsupportedContentType {
        url: url.to_string(),
        content_type: if content_type.is_empty() {
            "unknown".to_string()
        } else {
            content_type
        },
    })
}

/// The base media type: lowercased, parameters stripped.
fn base_type(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

fn looks_like_json(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body).is_ok()
}

fn looks_like_markdown(url: &str, body: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".md") || path.ends_with(".markdown") || path.ends_with(".json") {
        return true;
    }
    body.starts_with('#')
        || body.contains("\n- ")
        || body.contains("\n* ")
        || body.contains("\n#")
        || body.contains("```")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_type_strips_parameters() {
        assert_eq!(base_type("text/markdown; charset=utf-8"), "text/markdown");
        assert_eq!(base_type("Application/JSON"), "application/json");
    }

    #[test]
    fn test_looks_like_json() {
        assert!(looks_like_json("{\"a\": 1}"));
        assert!(looks_like_json("[1, 2]"));
        assert!(!looks_like_json("<html></html>"));
    }

    #[test]
    fn test_looks_like_markdown_by_url() {
        assert!(looks_like_markdown("https://x.io/doc.md", "anything"));
        assert!(looks_like_markdown("https://x.io/doc.md?ref=main", "anything"));
        assert!(!looks_like_markdown("https://x.io/page.html", "plain words"));
    }

    #[test]
    fn test_looks_like_markdown_by_content() {
        assert!(looks_like_markdown("https://x.io/a", "# Title\n\nbody"));
        assert!(looks_like_markdown("https://x.io/a", "intro\n- item one"));
        assert!(looks_like_markdown("https://x.io/a", "text\n```rs\ncode\n```"));
        assert!(!looks_like_markdown("https://x.io/a", "<html>nope</html>"));
    }
}
