use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::letta::LettaClient;
use crate::agent::{AgentAdapter, AgentApi};
use crate::chat::ChatService;
use crate::config::CompanionConfig;
use crate::connector::ConnectorClient;
use crate::database::AccountStore;
use crate::events::{event_queue, EventQueue};
use crate::followup::FollowupScheduler;
use crate::orchestrator::Orchestrator;
use crate::pomodoro::PomodoroRunner;
use crate::prefs::PreferenceStore;
use crate::rooms::ConnectionRooms;
use crate::speech::SpeechClient;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Every long-lived service of the companion, constructed once.
pub struct BackendRuntime {
    pub config: CompanionConfig,
    pub prefs: Arc<PreferenceStore>,
    pub accounts: Arc<AccountStore>,
    pub agent: Arc<AgentAdapter>,
    pub rooms: Arc<ConnectionRooms>,
    pub queue: EventQueue,
    pub followups: Arc<FollowupScheduler>,
    pub pomodoro: Arc<PomodoroRunner>,
    pub chat: Arc<ChatService>,
    pub speech: Arc<SpeechClient>,
    pub connector: Arc<ConnectorClient>,
    pub orchestrator: Arc<Orchestrator>,
}

pub struct BackendRuntimeBuilder {
    config: CompanionConfig,
    agent_api: Option<Arc<dyn AgentApi>>,
    pomodoro_minute: Duration,
}

impl BackendRuntimeBuilder {
    pub fn new(config: CompanionConfig) -> Self {
        Self {
            config,
            agent_api: None,
            pomodoro_minute: Duration::from_secs(60),
        }
    }

    /// Use `api` instead of a client built from the configuration.
    pub fn with_agent_api(mut self, api: Arc<dyn AgentApi>) -> Self {
        self.agent_api = Some(api);
        self
    }

    pub fn with_pomodoro_minute(mut self, minute: Duration) -> Self {
        self.pomodoro_minute = minute;
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let accounts = Arc::new(
            AccountStore::new(&config.database_path, config.fish_voice_reference_id.clone())
                .context("Failed to open account store")?,
        );

        let agent_api = match self.agent_api {
            Some(api) => Some(api),
            None => build_agent_api(&config)?,
        };
        let agent = Arc::new(AgentAdapter::new(
            agent_api,
            accounts.clone(),
            config.agent_models.clone(),
            config.agent_timeout(),
        ));

        let prefs = Arc::new(PreferenceStore::new());
        let rooms = Arc::new(ConnectionRooms::new());
        let (queue, receiver) = event_queue();
        let followups = Arc::new(FollowupScheduler::new(queue.clone()));
        let pomodoro = Arc::new(PomodoroRunner::with_minute(
            queue.clone(),
            self.pomodoro_minute,
        ));
        let chat = Arc::new(ChatService::new(
            prefs.clone(),
            accounts.clone(),
            agent.clone(),
            followups.clone(),
            config.followup_delay(),
        ));
        let speech = Arc::new(SpeechClient::new(
            &config.fish_api_url,
            config.fish_api_key.clone(),
            &config.fish_model,
            config.fish_voice_reference_id.clone(),
            config.speech_timeout(),
        )?);
        if !speech.is_configured() {
            tracing::warn!("FISH_API_KEY not set; voice endpoints will fail upstream");
        }
        let connector = Arc::new(ConnectorClient::new(
            &config.composio_api_url,
            config.composio_api_key.clone(),
            config.composio_gmail_auth_config.clone(),
            config.agent_timeout(),
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            prefs.clone(),
            accounts.clone(),
            agent.clone(),
            rooms.clone(),
            receiver,
        ));

        Ok(BackendRuntime {
            config,
            prefs,
            accounts,
            agent,
            rooms,
            queue,
            followups,
            pomodoro,
            chat,
            speech,
            connector,
            orchestrator,
        })
    }
}

fn build_agent_api(config: &CompanionConfig) -> Result<Option<Arc<dyn AgentApi>>> {
    let Some(endpoint) = config.letta_endpoint() else {
        tracing::warn!("Agent service not configured; replies will use canned text");
        return Ok(None);
    };
    tracing::info!("Agent service: {}", endpoint);
    let client = LettaClient::new(
        endpoint,
        config.letta_api_key.clone(),
        config.agent_timeout(),
    )?;
    Ok(Some(Arc::new(client)))
}

impl BackendRuntime {
    pub fn bootstrap(config: CompanionConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }

    /// Start the event consumer and the follow-up scanner under supervision.
    pub fn spawn_background_tasks(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let orchestrator = self.orchestrator.clone();
        let followups = self.followups.clone();
        let orchestrator_shutdown = shutdown.clone();
        let scanner_shutdown = shutdown.clone();
        vec![
            supervise("event orchestrator", shutdown.clone(), move || {
                let orchestrator = orchestrator.clone();
                let shutdown = orchestrator_shutdown.clone();
                async move { orchestrator.run(shutdown).await }
            }),
            supervise("follow-up scanner", shutdown, move || {
                let followups = followups.clone();
                let shutdown = scanner_shutdown.clone();
                async move { followups.run(shutdown).await }
            }),
        ]
    }

    /// Stop every Pomodoro runner. Background tasks stop through their token.
    pub async fn shutdown(&self) {
        self.pomodoro.stop_all().await;
    }
}

/// Run `task` until it returns normally or `shutdown` fires, restarting it
/// after [`RESTART_BACKOFF`] whenever it panics.
pub fn supervise<F, Fut>(name: &'static str, shutdown: CancellationToken, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let outcome = tokio::spawn(task()).await;
            if shutdown.is_cancelled() {
                break;
            }
            match outcome {
                Ok(()) => {
                    tracing::info!("{} finished", name);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "{} ended abnormally ({}); restarting in {:?}",
                        name,
                        e,
                        RESTART_BACKOFF
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!("{} supervisor exiting", name);
    })
}
