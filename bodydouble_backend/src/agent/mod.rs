//! Conversational-agent adapter.
//!
//! Every call into the external service is converted into an
//! [`AgentOutcome`]; network, auth and parsing failures are logged here and
//! never reach the caller as errors.

pub mod letta;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::database::AccountStore;
use crate::personality::Personality;

const PERSONA_REPLY_INSTRUCTION: &str =
    "Respond in that persona. Keep it warm, actionable, and under ~20 words.";

/// One message returned by the agent service.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub content: Option<Value>,
}

impl AgentMessage {
    pub fn assistant(text: &str) -> Self {
        Self {
            message_type: "assistant_message".to_string(),
            content: Some(Value::from(text)),
        }
    }

    fn text(&self) -> String {
        match &self.content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// The wire-level operations of the agent service.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Create a persistent agent; returns its id.
    async fn create_agent(&self, name: &str, model: &str) -> Result<String>;

    /// Submit one user-role message and return the messages produced.
    async fn send_message(&self, agent_id: &str, content: &str) -> Result<Vec<AgentMessage>>;
}

/// Trimmed text of the first assistant message, if any.
pub fn first_assistant_text(messages: &[AgentMessage]) -> Option<String> {
    messages
        .iter()
        .find(|msg| msg.message_type == "assistant_message")
        .map(|msg| msg.text().trim().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Reply(String),
    /// Unconfigured service, missing handle, failure, timeout or blank text.
    NoResult,
}

impl AgentOutcome {
    pub fn or_else<F: FnOnce() -> String>(self, fallback: F) -> String {
        match self {
            AgentOutcome::Reply(text) => text,
            AgentOutcome::NoResult => fallback(),
        }
    }
}

pub struct AgentAdapter {
    api: Option<Arc<dyn AgentApi>>,
    accounts: Arc<AccountStore>,
    models: Vec<String>,
    timeout: Duration,
    /// Serializes provisioning per user so one account never gets two agents.
    provisioning: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentAdapter {
    pub fn new(
        api: Option<Arc<dyn AgentApi>>,
        accounts: Arc<AccountStore>,
        models: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            accounts,
            models,
            timeout,
            provisioning: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api.is_some()
    }

    /// The user's agent handle, provisioning and persisting one when the
    /// account has none. `None` when the user has no account or every
    /// provisioning attempt fails.
    pub async fn ensure_agent(&self, user_id: &str) -> Option<String> {
        if let Some(handle) = self.stored_handle(user_id)? {
            return Some(handle);
        }

        let user_lock = self
            .provisioning
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let _guard = user_lock.lock().await;

        // Another caller may have provisioned while we waited.
        if let Some(handle) = self.stored_handle(user_id)? {
            return Some(handle);
        }

        tracing::debug!("User '{}' has no agent, attempting to create one", user_id);
        let handle = self.provision(user_id).await?;
        if let Err(e) = self.accounts.set_agent_handle(user_id, &handle) {
            tracing::warn!("Failed to persist agent {} for '{}': {}", handle, user_id, e);
        } else {
            tracing::info!("Created agent {} for '{}'", handle, user_id);
        }
        Some(handle)
    }

    /// `None` when there is no usable account, `Some(None)` when the account
    /// has no agent yet.
    fn stored_handle(&self, user_id: &str) -> Option<Option<String>> {
        match self.accounts.get(user_id) {
            Ok(Some(account)) => Some(account.agent_handle.filter(|h| !h.trim().is_empty())),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Account lookup for '{}' failed: {}", user_id, e);
                None
            }
        }
    }

    /// Try each acceptable model in order; the first success wins.
    async fn provision(&self, user_id: &str) -> Option<String> {
        let Some(api) = self.api.as_ref() else {
            tracing::debug!("Agent service not configured; skipping agent creation for '{}'", user_id);
            return None;
        };
        let name = format!("{}-agent", user_id);
        for model in &self.models {
            match tokio::time::timeout(self.timeout, api.create_agent(&name, model)).await {
                Ok(Ok(id)) => {
                    tracing::debug!("Agent creation succeeded with model {}", model);
                    return Some(id);
                }
                Ok(Err(e)) => tracing::debug!("Agent creation failed with model {}: {}", model, e),
                Err(_) => tracing::debug!("Agent creation timed out with model {}", model),
            }
        }
        tracing::warn!(
            "Could not create an agent for '{}' with any of {} model(s)",
            user_id,
            self.models.len()
        );
        None
    }

    /// Ask the agent for one reply to `content`, optionally wrapped in the
    /// persona's style instruction.
    pub async fn generate_reply(
        &self,
        content: &str,
        personality: Option<&Personality>,
        handle: Option<&str>,
    ) -> AgentOutcome {
        let (Some(api), Some(handle)) = (self.api.as_ref(), handle) else {
            return AgentOutcome::NoResult;
        };

        let prompt = match personality {
            Some(personality) => format!(
                "{}\n\nUser message: {}\nAssistant:",
                personality.style_instruction(PERSONA_REPLY_INSTRUCTION),
                content
            ),
            None => content.to_string(),
        };

        match tokio::time::timeout(self.timeout, api.send_message(handle, &prompt)).await {
            Ok(Ok(messages)) => match first_assistant_text(&messages) {
                Some(text) if !text.is_empty() => AgentOutcome::Reply(text),
                _ => {
                    tracing::debug!("Agent {} returned no assistant text", handle);
                    AgentOutcome::NoResult
                }
            },
            Ok(Err(e)) => {
                tracing::warn!("Agent {} request failed: {}", handle, e);
                AgentOutcome::NoResult
            }
            Err(_) => {
                tracing::warn!("Agent {} timed out after {:?}", handle, self.timeout);
                AgentOutcome::NoResult
            }
        }
    }
}
