//! REST clients for the Chat and Image views.
//!
//! Both talk to the same `generativelanguage` v1beta API with the process-wide
//! API key. A missing key does not stop startup; calls fail with a clear error.

pub mod chat;
pub mod image;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Shared HTTP client plus credentials.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("nexus/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            base_url: API_BASE.into(),
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> Result<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("API_KEY is not set; requests cannot be authenticated"))?;
        Ok(format!("{}/models/{model}:{method}?key={key}", self.base_url))
    }

    /// POST `body` to `model:method` and return the successful response.
    async fn post<B: Serialize>(
        &self,
        model: &str,
        method: &str,
        query: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let mut url = self.endpoint(model, method)?;
        if !query.is_empty() {
            url.push('&');
            url.push_str(query);
        }
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {model}:{method} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{model}:{method} returned {status}: {}", api_error_message(&text));
        }
        Ok(response)
    }
}

/// Pull `error.message` out of an API error body, or fall back to the raw text.
fn api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }
    #[derive(Deserialize)]
    struct Detail {
        message: String,
    }
    serde_json::from_str::<Envelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

// ── Shared wire types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
}

impl GenerateContentResponse {
    /// Parts of the first candidate.
    pub fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map_or(&[], |c| c.parts.as_slice())
    }
}
