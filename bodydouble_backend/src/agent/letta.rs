use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{AgentApi, AgentMessage};
use crate::http_client::build_http_client;

/// REST client for a Letta server (self-hosted or the hosted service).
#[derive(Clone)]
pub struct LettaClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateAgentRequest<'a> {
    name: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateAgentResponse {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessagesRequest<'a> {
    messages: Vec<OutgoingMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendMessagesResponse {
    #[serde(default)]
    messages: Vec<AgentMessage>,
}

impl LettaClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client: build_http_client(Some(timeout))?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.post(url);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read body".to_string());
    anyhow::bail!("{} returned error {}: {}", what, status, body)
}

#[async_trait]
impl AgentApi for LettaClient {
    async fn create_agent(&self, name: &str, model: &str) -> Result<String> {
        let response = self
            .request("/v1/agents/")
            .json(&CreateAgentRequest { name, model })
            .send()
            .await
            .context("Failed to send agent creation request")?;
        let created: CreateAgentResponse = check_status(response, "Agent creation")
            .await?
            .json()
            .await
            .context("Failed to parse agent creation response")?;
        created
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("Agent creation returned no id"))
    }

    async fn send_message(&self, agent_id: &str, content: &str) -> Result<Vec<AgentMessage>> {
        let request = SendMessagesRequest {
            messages: vec![OutgoingMessage {
                role: "user",
                content,
            }],
        };
        let response = self
            .request(&format!("/v1/agents/{}/messages", agent_id))
            .json(&request)
            .send()
            .await
            .context("Failed to send agent message")?;
        let parsed: SendMessagesResponse = check_status(response, "Agent message")
            .await?
            .json()
            .await
            .context("Failed to parse agent message response")?;
        Ok(parsed.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_response_tolerates_mixed_message_types() {
        let raw = r#"{
            "messages": [
                {"message_type": "reasoning_message", "reasoning": "thinking"},
                {"message_type": "assistant_message", "content": "  Nice start!  "},
                {"message_type": "usage_statistics"}
            ],
            "usage": {}
        }"#;
        let parsed: SendMessagesResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.messages.len(), 3);
        assert_eq!(
            super::super::first_assistant_text(&parsed.messages).as_deref(),
            Some("Nice start!")
        );
    }

    #[test]
    fn create_response_without_id_parses_to_none() {
        let parsed: CreateAgentResponse = serde_json::from_str("{}").expect("parse");
        assert!(parsed.id.is_none());
    }

    #[test]
    fn client_strips_trailing_slash_and_blank_key() {
        let client = LettaClient::new(
            "http://localhost:8283/".to_string(),
            Some("  ".to_string()),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(client.base_url(), "http://localhost:8283");
        assert!(client.api_key.is_none());
    }
}
