use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

const RETRY_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn embed(&self, model: &str, text: &str, timeout: Duration) -> Result<Vec<f32>> {
        // Newer Ollama releases use /api/embed, while older versions use /api/embeddings.
        // Try the new route first and fall back to the legacy route for compatibility.
        match self.embed_modern(model, text, timeout).await {
            Ok(vector) => Ok(vector),
            Err(modern_err) => match self.embed_legacy(model, text, timeout).await {
                Ok(vector) => Ok(vector),
                Err(legacy_err) => Err(anyhow::anyhow!(
                    "ollama embedding failed via /api/embed and /api/embeddings. \
                         modern error: {modern_err}; legacy error: {legacy_err}; \
                         ensure the embedding model is pulled (e.g. `ollama pull {model}`)"
                )),
            },
        }
    }

    async fn embed_modern(&self, model: &str, text: &str, timeout: Duration) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url);
        let response = retry_post(|| {
            self.client
                .post(&url)
                .timeout(timeout)
                .json(&EmbedReq { model, input: text })
        })
        .await
        .context("failed to call ollama embed endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/embed returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<EmbedResp>()
            .await
            .context("failed to decode ollama /api/embed response")?;

        let vector =
            response.embeddings.into_iter().next().ok_or_else(|| {
                anyhow::anyhow!("ollama /api/embed returned empty embeddings array")
            })?;

        Ok(vector)
    }

    async fn embed_legacy(&self, model: &str, text: &str, timeout: Duration) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = retry_post(|| {
            self.client
                .post(&url)
                .timeout(timeout)
                .json(&EmbeddingReq {
                    model,
                    prompt: text,
                })
        })
        .await
        .context("failed to call ollama embeddings endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "ollama /api/embeddings returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<EmbeddingResp>()
            .await
            .context("failed to decode ollama embeddings response")?;

        Ok(response.embedding)
    }

    /// One-shot generation in JSON mode. The caller parses the returned text
    /// against its own schema; transport failures are retried, parse
    /// failures are the caller's problem.
    pub async fn generate_json(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
            format: &'a str,
            options: GenerateOptions,
        }

        #[derive(Serialize)]
        struct GenerateOptions {
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let url = format!("{}/api/generate", self.base_url);
        let response = retry_post(|| {
            self.client
                .post(&url)
                .timeout(timeout)
                .json(&GenerateReq {
                    model,
                    prompt,
                    stream: false,
                    format: "json",
                    options: GenerateOptions { temperature: 0.2 },
                })
        })
        .await
        .context("failed to call ollama generate endpoint")?
        .error_for_status()
        .context("ollama generate returned non-success status")?
        .json::<GenerateResp>()
        .await
        .context("failed to decode ollama generate response")?;

        Ok(response.response.trim().to_string())
    }
}

/// Issue a POST up to three times with exponential backoff. Only transport
/// errors and 5xx responses are retried; 4xx responses return immediately.
async fn retry_post<F>(build: F) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 1;
    loop {
        match build().send().await {
            Ok(response) if response.status().is_server_error() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    status = %response.status(),
                    attempt,
                    "transient server error, retrying"
                );
            }
            Ok(response) => return Ok(response),
            Err(err) if attempt < RETRY_ATTEMPTS => {
                tracing::warn!(error = %err, attempt, "request failed, retrying");
            }
            Err(err) => return Err(err),
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_body_extracts_json_error() {
        assert_eq!(
            normalize_err_body(r#"{"error":"model not found"}"#),
            "model not found"
        );
        assert_eq!(normalize_err_body("   "), "<empty body>");
        assert_eq!(normalize_err_body("plain text"), "plain text");
    }
}
