//! Text-to-speech and speech-to-text through the Fish Audio REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::http_client::build_http_client;

fn default_format() -> String {
    "mp3".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_latency() -> String {
    "balanced".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SayRequest {
    pub text: String,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub volume: i32,
    #[serde(default = "default_latency")]
    pub latency: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl SayRequest {
    pub fn media_type(&self) -> &'static str {
        if self.format == "mp3" {
            "audio/mpeg"
        } else {
            "audio/wav"
        }
    }
}

#[derive(Debug, Serialize)]
struct Prosody {
    speed: f32,
    volume: i32,
}

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    text: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_id: Option<&'a str>,
    latency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prosody: Option<Prosody>,
}

#[derive(Debug, Deserialize)]
struct AsrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub duration_ms: Option<u64>,
}

pub type AudioStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

pub struct SpeechClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    default_reference_id: Option<String>,
    client: reqwest::Client,
}

impl SpeechClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        default_reference_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: if model.trim().is_empty() {
                "s1".to_string()
            } else {
                model.trim().to_string()
            },
            default_reference_id: default_reference_id.filter(|id| !id.trim().is_empty()),
            client: build_http_client(Some(timeout))?,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn body<'a>(&'a self, request: &'a SayRequest) -> TtsBody<'a> {
        let prosody = (request.speed != 1.0 || request.volume != 0).then_some(Prosody {
            speed: request.speed,
            volume: request.volume,
        });
        TtsBody {
            text: &request.text,
            format: &request.format,
            reference_id: request
                .reference_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .or(self.default_reference_id.as_deref()),
            latency: &request.latency,
            prosody,
        }
    }

    /// Start synthesis; the upstream status is checked before any audio is
    /// streamed back.
    pub async fn synthesize(&self, request: &SayRequest) -> Result<AudioStream> {
        let mut builder = self
            .client
            .post(format!("{}/v1/tts", self.base_url))
            .header("model", &self.model)
            .json(&self.body(request));
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.context("Failed to reach speech service")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Speech synthesis returned error {}: {}", status, body);
        }
        Ok(response.bytes_stream().boxed())
    }

    pub async fn transcribe(&self, audio: Vec<u8>, language: &str) -> Result<Transcript> {
        let form = reqwest::multipart::Form::new()
            .text("language", language.to_string())
            .text("ignore_timestamps", "true")
            .part(
                "audio",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("application/octet-stream")?,
            );
        let mut builder = self
            .client
            .post(format!("{}/v1/asr", self.base_url))
            .multipart(form);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.context("Failed to reach speech service")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Transcription returned error {}: {}", status, body);
        }
        let parsed: AsrResponse = response
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(Transcript {
            text: parsed.text,
            duration_ms: parsed.duration.map(|secs| (secs * 1000.0).round() as u64),
        })
    }
}
