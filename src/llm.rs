use crate::config::Config;
use crate::error::PipelineError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Opaque continuation state returned by the model server. Forwarded
/// byte-for-byte into the next call, never inspected.
pub type GenContext = Vec<i64>;

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub context: GenContext,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    /// One non-streaming, JSON-formatted completion. The returned text is
    /// expected to itself be JSON in whatever schema the prompt asked for;
    /// decoding that nested schema is the caller's job.
    async fn generate(&self, prompt: &str, context: Option<&[i64]>) -> Result<Generation>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaClient::new(
            &config.llm.base_url,
            &config.llm.model,
            &config.llm.keep_alive,
        ))),
        other => Err(anyhow!("Unknown LLM provider: {}", other)),
    }
}

// --- Ollama ---

#[derive(Debug)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    keep_alive: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, keep_alive: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            keep_alive: keep_alive.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    keep_alive: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a [i64]>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    context: Vec<i64>,
    #[serde(default)]
    error: Option<String>,
}

fn into_generation(result: OllamaResponse) -> Result<Generation> {
    if let Some(err) = result.error {
        return Err(PipelineError::Upstream(format!("Ollama returned error: {}", err)).into());
    }
    Ok(Generation {
        text: result.response,
        context: result.context,
    })
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str, context: Option<&[i64]>) -> Result<Generation> {
        let url = format!("{}/api/generate", self.base_url);

        let request_body = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
            keep_alive: &self.keep_alive,
            context,
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(
                PipelineError::Upstream(format!("Ollama API error: {}", error_text)).into(),
            );
        }

        let result: OllamaResponse = resp.json().await?;
        into_generation(result)
    }
}

/// Models sometimes wrap JSON answers in markdown fences even when asked not to.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_request_omits_missing_context() {
        let body = OllamaRequest {
            model: "mistral",
            prompt: "hi",
            stream: false,
            format: "json",
            keep_alive: "0",
            context: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("context").is_none());
        assert_eq!(json["format"], "json");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_request_forwards_context() {
        let ctx = vec![1i64, 2, 3];
        let body = OllamaRequest {
            model: "mistral",
            prompt: "hi",
            stream: false,
            format: "json",
            keep_alive: "0",
            context: Some(&ctx),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["context"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_error_envelope_is_upstream() {
        let result: OllamaResponse =
            serde_json::from_str(r#"{"error": "model not found"}"#).unwrap();
        let err = into_generation(result).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Upstream(msg)) => assert!(msg.contains("model not found")),
            other => panic!("expected Upstream error, got {:?}", other),
        }
    }

    #[test]
    fn test_success_envelope_carries_context() {
        let result: OllamaResponse = serde_json::from_str(
            r#"{"response": "{\"story\": []}", "context": [7, 8, 9]}"#,
        )
        .unwrap();
        let gen = into_generation(result).unwrap();
        assert_eq!(gen.text, r#"{"story": []}"#);
        assert_eq!(gen.context, vec![7, 8, 9]);
    }
}
