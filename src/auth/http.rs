//! Shared HTTP plumbing for identity and credential backends.

use std::time::Duration;

use reqwest::StatusCode;

use crate::{Error, Result};

const MAX_ERROR_BODY: usize = 256;

/// HTTP client whose every call is bounded by `timeout`.
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(Error::from)
}

/// Turn a non-success response into the matching error class.
///
/// 401/403 are authentication failures; everything else is a transient fetch failure.
pub(crate) async fn error_for_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let summary = summarize(&body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::authentication(
            format!("{} rejected: {}", context, summary),
            Some(status.as_u16()),
        )),
        _ => Err(Error::fetch(format!(
            "{} returned HTTP {}: {}",
            context,
            status.as_u16(),
            summary
        ))),
    }
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["message", "error_description", "error"] {
            if let Some(msg) = json.get(key).and_then(|v| v.as_str()) {
                return truncate(msg);
            }
        }
    }
    truncate(trimmed)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_BODY {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_ERROR_BODY).collect();
        format!("{}...", cut)
    }
}
