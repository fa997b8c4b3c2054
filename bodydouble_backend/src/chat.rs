use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::agent::AgentAdapter;
use crate::database::AccountStore;
use crate::fallback;
use crate::followup::FollowupScheduler;
use crate::personality;
use crate::prefs::PreferenceStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub text: String,
    pub voice_suggested: bool,
    pub personality: String,
    pub voice_model: Option<String>,
}

/// Handles a user's chat message: reply now, check in later if they go quiet.
pub struct ChatService {
    prefs: Arc<PreferenceStore>,
    accounts: Arc<AccountStore>,
    agent: Arc<AgentAdapter>,
    followups: Arc<FollowupScheduler>,
    followup_delay: Duration,
}

impl ChatService {
    pub fn new(
        prefs: Arc<PreferenceStore>,
        accounts: Arc<AccountStore>,
        agent: Arc<AgentAdapter>,
        followups: Arc<FollowupScheduler>,
        followup_delay: Duration,
    ) -> Self {
        Self {
            prefs,
            accounts,
            agent,
            followups,
            followup_delay,
        }
    }

    pub async fn send(&self, user_id: &str, text: &str) -> ChatReply {
        self.followups.cancel(user_id);

        let prefs = self.prefs.get(user_id);
        let personality = personality::resolve(Some(&prefs.personality_id));
        let handle = self.agent.ensure_agent(user_id).await;
        let account = self.accounts.get(user_id).unwrap_or_else(|e| {
            tracing::warn!("Account lookup for '{}' failed: {}", user_id, e);
            None
        });

        let prompt = text.trim();
        let reply = if prompt.is_empty() {
            fallback::chat_reply(prompt, personality)
        } else {
            self.agent
                .generate_reply(prompt, Some(personality), handle.as_deref())
                .await
                .or_else(|| {
                    tracing::debug!("Using canned chat reply for '{}'", user_id);
                    fallback::chat_reply(prompt, personality)
                })
        };

        self.followups.schedule(user_id, self.followup_delay);

        ChatReply {
            text: reply,
            voice_suggested: prefs.voice_enabled,
            personality: personality.id.to_string(),
            voice_model: account.and_then(|account| account.voice_model),
        }
    }
}
