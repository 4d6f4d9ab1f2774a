//! Text-to-speech collaborator used for audio enrichment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::Serialize;

use crate::AdapterError;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Encoded audio (MP3) for `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiSpeechConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAiSpeechConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gpt-4o-mini-tts".to_string(),
            voice: "coral".to_string(),
            instructions: "Speak with a clear, professional Mexican Spanish accent at a moderate pace suitable for Spanish language learners.".to_string(),
            base_url: "https://api.openai.com".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    instructions: &'a str,
    response_format: &'static str,
}

pub struct OpenAiSpeech {
    client: reqwest::Client,
    config: OpenAiSpeechConfig,
}

impl OpenAiSpeech {
    pub fn new(config: OpenAiSpeechConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AdapterError> {
        if text.trim().is_empty() {
            return Err(AdapterError::Message("cannot synthesize empty text".into()));
        }
        let url = format!("{}/v1/audio/speech", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.config.api_key))
            .json(&SpeechRequest {
                model: &self.config.model,
                voice: &self.config.voice,
                input: text,
                instructions: &self.config.instructions,
                response_format: "mp3",
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Message(format!(
                "speech synthesis failed with HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn speech_for(server: &MockServer) -> OpenAiSpeech {
        let mut config = OpenAiSpeechConfig::new("sk-test");
        config.base_url = server.uri();
        OpenAiSpeech::new(config).expect("client")
    }

    #[tokio::test]
    async fn audio_bytes_are_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(header_matcher("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"input": "Hola", "voice": "coral"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3fake".to_vec()))
            .mount(&server)
            .await;

        let bytes = speech_for(&server).synthesize("Hola").await.expect("audio");
        assert_eq!(bytes, b"ID3fake");
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let speech = speech_for(&server);
        assert!(speech.synthesize("Hola").await.is_err());
        assert!(speech.synthesize("   ").await.is_err());
    }
}
