//! The single consumer of the event queue.
//!
//! For each event: resolve the user's persona and voice, get one line of
//! text (agent reply or canned fallback) and broadcast it to the user's
//! room. A failure or panic while composing still broadcasts the canned
//! text, with the error attached.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentAdapter;
use crate::database::{Account, AccountStore};
use crate::events::{Event, EventReceiver, EventType};
use crate::fallback;
use crate::personality::{self, Personality};
use crate::prefs::PreferenceStore;
use crate::prompts;
use crate::rooms::ConnectionRooms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    /// Client may fetch audio for the text
    Speak,
    Chat,
}

/// What a room receives for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    #[serde(rename = "type")]
    pub kind: DispatchKind,
    pub event: EventType,
    pub text: String,
    pub data: Map<String, Value>,
    pub personality: String,
    pub voice_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The account's voice model if set, else the persona's default voice.
pub fn voice_reference(account: Option<&Account>, personality: &Personality) -> Option<String> {
    account
        .and_then(|account| account.voice_model.as_deref())
        .map(str::trim)
        .filter(|voice| !voice.is_empty())
        .map(str::to_string)
        .or_else(|| personality.voice_reference_id.map(str::to_string))
}

pub struct Orchestrator {
    prefs: Arc<PreferenceStore>,
    accounts: Arc<AccountStore>,
    agent: Arc<AgentAdapter>,
    rooms: Arc<ConnectionRooms>,
    receiver: EventReceiver,
}

impl Orchestrator {
    pub fn new(
        prefs: Arc<PreferenceStore>,
        accounts: Arc<AccountStore>,
        agent: Arc<AgentAdapter>,
        rooms: Arc<ConnectionRooms>,
        receiver: EventReceiver,
    ) -> Self {
        Self {
            prefs,
            accounts,
            agent,
            rooms,
            receiver,
        }
    }

    /// Consume events in arrival order until `shutdown` fires or every
    /// producer is gone. Each event is acknowledged once dispatched, whatever
    /// the outcome.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Event orchestrator running");
        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Event orchestrator stopping");
                    return;
                }
                delivery = self.receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!("Event queue closed; orchestrator exiting");
                        return;
                    }
                },
            };
            self.dispatch(delivery.event()).await;
        }
    }

    /// Compose and broadcast the message for one event.
    pub async fn dispatch(&self, event: &Event) -> DispatchMessage {
        let message = match AssertUnwindSafe(self.compose(event)).catch_unwind().await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::error!(
                    "Failed to compose {} for '{}': {:#}",
                    event.event_type().as_str(),
                    event.user_id(),
                    e
                );
                self.fallback_message(event, format!("{:#}", e))
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(
                    "Panic while composing {} for '{}': {}",
                    event.event_type().as_str(),
                    event.user_id(),
                    reason
                );
                self.fallback_message(event, reason)
            }
        };

        let delivered = self.rooms.broadcast(event.user_id(), &message);
        tracing::debug!(
            "Dispatched {} ({:?}) to {} connection(s) for '{}'",
            event.event_type().as_str(),
            message.kind,
            delivered,
            event.user_id()
        );
        message
    }

    async fn compose(&self, event: &Event) -> Result<DispatchMessage> {
        let user_id = event.user_id();
        let prefs = self.prefs.get(user_id);
        let personality = personality::resolve(Some(&prefs.personality_id));
        let account = self.accounts.get(user_id)?;
        let voice_reference_id = voice_reference(account.as_ref(), personality);

        let text = match self.agent.ensure_agent(user_id).await {
            None => fallback::event_text(event, personality),
            Some(handle) => {
                let prompt = prompts::build_prompt(event, personality)?;
                self.agent
                    .generate_reply(&prompt, Some(personality), Some(&handle))
                    .await
                    .or_else(|| fallback::event_text(event, personality))
            }
        };

        Ok(DispatchMessage {
            kind: if prefs.voice_enabled {
                DispatchKind::Speak
            } else {
                DispatchKind::Chat
            },
            event: event.event_type(),
            text,
            data: event.data().clone(),
            personality: personality.id.to_string(),
            voice_reference_id,
            error: None,
        })
    }

    fn fallback_message(&self, event: &Event, error: String) -> DispatchMessage {
        let prefs = self.prefs.get(event.user_id());
        let personality = personality::resolve(Some(&prefs.personality_id));
        let account = self.accounts.get(event.user_id()).unwrap_or_else(|e| {
            tracing::warn!("Account lookup failed on fallback path: {}", e);
            None
        });
        DispatchMessage {
            kind: DispatchKind::Chat,
            event: event.event_type(),
            text: fallback::event_text(event, personality),
            data: event.data().clone(),
            personality: personality.id.to_string(),
            voice_reference_id: voice_reference(account.as_ref(), personality),
            error: Some(error),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic while composing message".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgentApi;
    use crate::agent::{AgentApi, AgentMessage};
    use crate::events::{event_queue, EventQueue, PomodoroPhase};
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        prefs: Arc<PreferenceStore>,
        accounts: Arc<AccountStore>,
        rooms: Arc<ConnectionRooms>,
        queue: EventQueue,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness(api: Option<Arc<dyn AgentApi>>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let accounts = Arc::new(AccountStore::new(dir.path().join("accounts.db"), None).expect("db"));
        let prefs = Arc::new(PreferenceStore::new());
        let rooms = Arc::new(ConnectionRooms::new());
        let agent = Arc::new(AgentAdapter::new(
            api,
            accounts.clone(),
            vec!["model-a".to_string()],
            Duration::from_secs(5),
        ));
        let (queue, receiver) = event_queue();
        let orchestrator = Arc::new(Orchestrator::new(
            prefs.clone(),
            accounts.clone(),
            agent,
            rooms.clone(),
            receiver,
        ));
        Harness {
            _dir: dir,
            prefs,
            accounts,
            rooms,
            queue,
            orchestrator,
        }
    }

    fn replying(text: &str) -> Arc<dyn AgentApi> {
        Arc::new(ScriptedAgentApi {
            accepted_models: vec!["model-a".to_string()],
            reply: Some(vec![AgentMessage::assistant(text)]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn user_without_account_gets_fallback_chat() {
        let h = harness(Some(replying("agent text")));
        let (tx, rx) = flume::unbounded();
        h.rooms.join("u1", tx);

        let event = Event::reminder("u1", PomodoroPhase::FocusStart, Some(25));
        let message = h.orchestrator.dispatch(&event).await;

        assert_eq!(message.kind, DispatchKind::Chat);
        assert_eq!(
            message.text,
            fallback::event_text(&event, personality::default_personality())
        );
        assert_eq!(message.personality, "focus_friend");
        assert!(message.voice_reference_id.is_none());
        assert!(message.error.is_none());

        let wire: Value = serde_json::from_str(&rx.try_recv().expect("broadcast")).unwrap();
        assert_eq!(wire["type"], "chat");
        assert_eq!(wire["event"], "reminder.due");
        assert_eq!(wire["data"]["minutes"], 25);
        assert!(wire.get("error").is_none());
    }

    #[tokio::test]
    async fn agent_reply_is_spoken_with_account_voice() {
        let h = harness(Some(replying("Let's crush it.")));
        h.accounts.create("u1", "pw", Some("voice-u1")).unwrap();
        h.prefs.update("u1", |p| {
            p.voice_enabled = true;
            p.personality_id = "hype_buddy".to_string();
        });

        let message = h.orchestrator.dispatch(&Event::followup("u1")).await;
        assert_eq!(message.kind, DispatchKind::Speak);
        assert_eq!(message.text, "Let's crush it.");
        assert_eq!(message.personality, "hype_buddy");
        assert_eq!(message.voice_reference_id.as_deref(), Some("voice-u1"));
    }

    #[tokio::test]
    async fn failing_agent_falls_back_to_exact_canned_text() {
        let h = harness(Some(Arc::new(ScriptedAgentApi {
            accepted_models: vec!["model-a".to_string()],
            ..Default::default()
        })));
        h.accounts.create("u1", "pw", None).unwrap();
        h.prefs.update("u1", |p| p.personality_id = "zen_guide".to_string());

        let event = Event::reminder("u1", PomodoroPhase::BreakStart, Some(5));
        let message = h.orchestrator.dispatch(&event).await;
        assert_eq!(
            message.text,
            "Deep breath— Break time for 5 minutes—water and a quick stretch!"
        );
        assert!(message.error.is_none());
    }

    #[tokio::test]
    async fn malformed_event_takes_error_path() {
        let h = harness(Some(replying("unused")));
        h.accounts.create("u1", "pw", None).unwrap();
        h.prefs.update("u1", |p| p.voice_enabled = true);

        let event = Event::reminder("u1", PomodoroPhase::FocusStart, None);
        let message = h.orchestrator.dispatch(&event).await;
        assert_eq!(message.kind, DispatchKind::Chat);
        assert_eq!(
            message.text,
            "Alright, teammate! Starting a focus block—let's do this!"
        );
        assert!(message.error.as_deref().unwrap().contains("missing 'minutes'"));
    }

    struct PanickingApi;

    #[async_trait::async_trait]
    impl AgentApi for PanickingApi {
        async fn create_agent(&self, _name: &str, _model: &str) -> Result<String> {
            Ok("agent-1".to_string())
        }

        async fn send_message(&self, _agent_id: &str, _content: &str) -> Result<Vec<AgentMessage>> {
            panic!("agent exploded")
        }
    }

    #[tokio::test]
    async fn panic_while_composing_still_broadcasts() {
        let h = harness(Some(Arc::new(PanickingApi)));
        h.accounts.create("u1", "pw", None).unwrap();
        let (tx, rx) = flume::unbounded();
        h.rooms.join("u1", tx);

        let message = h.orchestrator.dispatch(&Event::followup("u1")).await;
        assert_eq!(message.error.as_deref(), Some("agent exploded"));
        assert!(message.text.contains("how's it going"));
        let wire: Value = serde_json::from_str(&rx.try_recv().expect("broadcast")).unwrap();
        assert_eq!(wire["error"], "agent exploded");
    }

    #[tokio::test]
    async fn run_loop_acknowledges_every_event() {
        let h = harness(None);
        let shutdown = CancellationToken::new();
        let worker = {
            let orchestrator = h.orchestrator.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { orchestrator.run(shutdown).await })
        };

        h.queue.push(Event::followup("u1"));
        h.queue.push(Event::reminder("u1", PomodoroPhase::AllDone, None));
        tokio::time::timeout(Duration::from_secs(5), h.queue.join())
            .await
            .expect("queue drained");
        assert_eq!(h.queue.in_flight(), 0);

        shutdown.cancel();
        worker.await.expect("worker exits");
    }
}
