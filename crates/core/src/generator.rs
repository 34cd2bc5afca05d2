use crate::error::EngineError;
use crate::protocol::LineCodec;
use crate::traits::{Generator, TokenSink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateParameters,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct GenerateParameters {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateFragment {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaGenerator {
    endpoint: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        tokens: &mut dyn TokenSink,
    ) -> Result<String, EngineError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: GenerateParameters {
                temperature: self.temperature,
            },
        };

        let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
        let mut response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|error| EngineError::Generation(error.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Generation(format!(
                "generator endpoint returned {}",
                response.status()
            )));
        }

        let mut codec = LineCodec::new();
        let mut answer = String::new();

        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|error| EngineError::Generation(error.to_string()))?
        {
            for item in codec.feed::<GenerateFragment>(&bytes) {
                let fragment = item
                    .map_err(|error| EngineError::Generation(format!("bad stream line: {error}")))?;

                if let Some(message) = fragment.error {
                    return Err(EngineError::Generation(message));
                }
                if !fragment.response.is_empty() {
                    tokens.on_token(&fragment.response).await?;
                    answer.push_str(&fragment.response);
                }
                if fragment.done {
                    return Ok(answer);
                }
            }
        }

        Ok(answer)
    }
}
