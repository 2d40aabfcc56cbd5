//! Upstream Gemini API client — the pool's unit of work
//!
//! Issues `generateContent` / `streamGenerateContent` calls with a leased
//! key and maps every failure into a stable `FailureKind` at this boundary,
//! so the scheduler never sees provider-specific error shapes.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use keypool::{FailureKind, LeasedKey, WorkError, classify_status};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Client for one configured upstream model endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            timeout,
        }
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/v1beta/models/{}:{verb}", self.base_url, self.model)
    }

    /// POST a prompt to `url` with the leased key; reject non-2xx responses
    /// with a classified `WorkError`.
    async fn send(
        &self,
        url: &str,
        key: &LeasedKey,
        prompt: &str,
        extra_query: &[(&str, &str)],
    ) -> Result<reqwest::Response, WorkError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };
        let response = self
            .http
            .post(url)
            .query(&[("key", key.key.expose().as_str())])
            .query(extra_query)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                WorkError::new(FailureKind::Other, format!("upstream request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status.as_u16(), &body);
            return Err(WorkError::new(
                kind,
                format!("upstream returned {status}: {}", truncate(&body, 256)),
            ));
        }
        debug!(key = %key.id, status = status.as_u16(), "upstream call succeeded");
        Ok(response)
    }

    /// Run one blocking completion and return the concatenated candidate text.
    pub async fn generate(&self, key: &LeasedKey, prompt: &str) -> Result<String, WorkError> {
        let response = self
            .send(&self.endpoint("generateContent"), key, prompt, &[])
            .await?;
        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            WorkError::new(
                FailureKind::Other,
                format!("malformed upstream response: {e}"),
            )
        })?;
        extract_text(&parsed)
            .ok_or_else(|| WorkError::new(FailureKind::Other, "upstream returned no candidates"))
    }

    /// Open a streaming completion and hand back the raw SSE byte stream.
    ///
    /// Only the opening handshake is validated here; the returned stream is
    /// forwarded verbatim and consumption errors stay with the caller.
    pub async fn open_stream(
        &self,
        key: &LeasedKey,
        prompt: &str,
    ) -> Result<BoxStream<'static, reqwest::Result<Bytes>>, WorkError> {
        let response = self
            .send(
                &self.endpoint("streamGenerateContent"),
                key,
                prompt,
                &[("alt", "sse")],
            )
            .await?;
        Ok(response.bytes_stream().boxed())
    }
}

/// Concatenate the first candidate's text parts; `None` when nothing usable
/// came back.
fn extract_text(response: &GenerateResponse) -> Option<String> {
    let candidate = response.candidates.first()?;
    let text: String = candidate
        .content
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// Clamp an upstream body to `max_chars` for error messages.
fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        body.to_owned()
    } else {
        let mut clipped: String = body.chars().take(max_chars).collect();
        clipped.push('\u{2026}');
        clipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_joins_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{
                "candidates": [
                    {"content": {"parts": [{"text": "Hello"}, {"text": ", world"}]}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(extract_text(&parsed).unwrap(), "Hello, world");
    }

    #[test]
    fn extract_text_no_candidates() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(extract_text(&parsed).is_none());
    }

    #[test]
    fn extract_text_missing_candidates_field() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(extract_text(&parsed).is_none());
    }

    #[test]
    fn extract_text_empty_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": []}}]}"#,
        )
        .unwrap();
        assert!(extract_text(&parsed).is_none());
    }

    #[test]
    fn truncate_short_body_unchanged() {
        assert_eq!(truncate("small body", 256), "small body");
    }

    #[test]
    fn truncate_long_body_clipped() {
        let body = "x".repeat(500);
        let clipped = truncate(&body, 256);
        assert_eq!(clipped.chars().count(), 257);
        assert!(clipped.ends_with('\u{2026}'));
    }

    #[test]
    fn endpoint_builds_model_url() {
        let client = GeminiClient::new(
            reqwest::Client::new(),
            "https://generativelanguage.googleapis.com/",
            "gemini-2.5-flash",
            Duration::from_secs(60),
        );
        assert_eq!(
            client.endpoint("generateContent"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
