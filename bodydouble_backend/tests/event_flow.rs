use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bodydouble_backend::agent::{AgentApi, AgentMessage};
use bodydouble_backend::config::CompanionConfig;
use bodydouble_backend::events::{Event, PomodoroPhase};
use bodydouble_backend::fallback;
use bodydouble_backend::personality;
use bodydouble_backend::pomodoro::PomodoroPlan;
use bodydouble_backend::runtime::{BackendRuntime, BackendRuntimeBuilder};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Agent service that always provisions and answers with `reply`
/// (`None` = request error).
struct FakeAgent {
    reply: Option<String>,
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn create_agent(&self, name: &str, _model: &str) -> Result<String> {
        Ok(format!("agent-{}", name))
    }

    async fn send_message(&self, _agent_id: &str, _content: &str) -> Result<Vec<AgentMessage>> {
        match &self.reply {
            Some(text) => Ok(vec![AgentMessage::assistant(text)]),
            None => anyhow::bail!("agent service returned error 503"),
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    runtime: Arc<BackendRuntime>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    fn start(agent: Option<FakeAgent>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CompanionConfig {
            database_path: dir.path().join("accounts.db").to_string_lossy().to_string(),
            ..CompanionConfig::default()
        };
        let mut builder = BackendRuntimeBuilder::new(config);
        if let Some(agent) = agent {
            builder = builder.with_agent_api(Arc::new(agent));
        }
        let runtime = Arc::new(builder.build().expect("runtime"));
        let shutdown = CancellationToken::new();
        let tasks = runtime.spawn_background_tasks(shutdown.clone());
        Self {
            _dir: dir,
            runtime,
            shutdown,
            tasks,
        }
    }

    fn connect(&self, user_id: &str) -> flume::Receiver<String> {
        let (tx, rx) = flume::unbounded();
        self.runtime.rooms.join(user_id, tx);
        rx
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.runtime.shutdown().await;
        for task in self.tasks {
            task.await.expect("background task");
        }
    }
}

fn received(rx: &flume::Receiver<String>) -> Vec<Value> {
    rx.drain()
        .map(|raw| serde_json::from_str(&raw).expect("json message"))
        .collect()
}

fn plan(focus_min: u32, break_min: u32, cycles: u32) -> PomodoroPlan {
    PomodoroPlan {
        focus_min,
        break_min,
        cycles,
    }
}

#[tokio::test(start_paused = true)]
async fn one_minute_cycle_reaches_room_in_order() {
    let harness = Harness::start(None);
    let rx = harness.connect("u1");

    harness.runtime.pomodoro.start("u1", plan(1, 1, 1)).await;
    tokio::time::sleep(Duration::from_secs(2 * 60 + 1)).await;
    harness.runtime.queue.join().await;

    let messages = received(&rx);
    let phases: Vec<&str> = messages
        .iter()
        .map(|m| m["data"]["phase"].as_str().unwrap())
        .collect();
    assert_eq!(phases, vec!["focus_start", "break_start", "cycle_end", "all_done"]);
    for message in &messages {
        assert_eq!(message["type"], "chat");
        assert_eq!(message["event"], "reminder.due");
        assert_eq!(message["personality"], "focus_friend");
        assert!(!message["text"].as_str().unwrap().is_empty());
        assert!(message.get("error").is_none());
    }
    assert_eq!(messages[0]["data"]["minutes"], 1);
    assert_eq!(messages[1]["data"]["minutes"], 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failing_agent_yields_exact_fallback_text() {
    let harness = Harness::start(Some(FakeAgent { reply: None }));
    harness.runtime.accounts.create("u1", "pw", None).unwrap();
    harness
        .runtime
        .prefs
        .update("u1", |p| p.personality_id = "hype_buddy".to_string());
    let rx = harness.connect("u1");

    let event = Event::reminder("u1", PomodoroPhase::FocusStart, Some(25));
    harness.runtime.queue.push(event.clone());
    harness.runtime.queue.join().await;

    let messages = received(&rx);
    assert_eq!(messages.len(), 1);
    let hype = personality::find("hype_buddy").unwrap();
    assert_eq!(messages[0]["text"], fallback::event_text(&event, hype));
    assert_eq!(messages[0]["personality"], "hype_buddy");

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn blank_agent_reply_yields_fallback_and_agent_text_is_used_otherwise() {
    let blank = Harness::start(Some(FakeAgent {
        reply: Some("   ".to_string()),
    }));
    blank.runtime.accounts.create("u1", "pw", None).unwrap();
    let rx = blank.connect("u1");
    let event = Event::followup("u1");
    blank.runtime.queue.push(event.clone());
    blank.runtime.queue.join().await;
    assert_eq!(
        received(&rx)[0]["text"],
        fallback::event_text(&event, personality::default_personality())
    );
    blank.stop().await;

    let talking = Harness::start(Some(FakeAgent {
        reply: Some("Tiny step: open the doc.".to_string()),
    }));
    talking.runtime.accounts.create("u1", "pw", None).unwrap();
    let rx = talking.connect("u1");
    talking.runtime.queue.push(Event::followup("u1"));
    talking.runtime.queue.join().await;
    assert_eq!(received(&rx)[0]["text"], "Tiny step: open the doc.");
    assert_eq!(
        talking
            .runtime
            .accounts
            .get("u1")
            .unwrap()
            .unwrap()
            .agent_handle
            .as_deref(),
        Some("agent-u1-agent")
    );
    talking.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_event_still_delivers_with_error() {
    let harness = Harness::start(Some(FakeAgent {
        reply: Some("unused".to_string()),
    }));
    harness.runtime.accounts.create("u1", "pw", None).unwrap();
    let rx = harness.connect("u1");

    harness
        .runtime
        .queue
        .push(Event::reminder("u1", PomodoroPhase::BreakStart, None));
    harness
        .runtime
        .queue
        .push(Event::reminder("u1", PomodoroPhase::AllDone, None));
    harness.runtime.queue.join().await;

    let messages = received(&rx);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], "chat");
    assert!(messages[0]["error"]
        .as_str()
        .unwrap()
        .contains("missing 'minutes'"));
    assert_eq!(
        messages[0]["text"],
        "Alright, teammate! Break time—water and a quick stretch!"
    );
    assert_eq!(messages[1]["text"], "unused");
    assert!(messages[1].get("error").is_none());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn chat_schedules_single_followup_and_resets_on_reply() {
    let harness = Harness::start(None);
    let rx = harness.connect("u1");
    let delay = harness.runtime.config.followup_delay();

    harness.runtime.chat.send("u1", "hey").await;
    tokio::time::sleep(delay / 2).await;
    harness.runtime.chat.send("u1", "still working").await;

    tokio::time::sleep(delay / 2 + Duration::from_secs(15)).await;
    harness.runtime.queue.join().await;
    assert!(received(&rx).is_empty());
    assert!(harness.runtime.followups.is_pending("u1"));

    tokio::time::sleep(delay).await;
    harness.runtime.queue.join().await;
    let messages = received(&rx);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["event"], "msg.followup");
    assert!(!harness.runtime.followups.is_pending("u1"));

    tokio::time::sleep(delay * 2).await;
    harness.runtime.queue.join().await;
    assert!(received(&rx).is_empty());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn superseding_start_never_interleaves() {
    let harness = Harness::start(None);
    let rx = harness.connect("u1");

    harness.runtime.pomodoro.start("u1", plan(25, 5, 1)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    harness.runtime.pomodoro.start("u1", plan(1, 1, 1)).await;
    tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
    harness.runtime.queue.join().await;

    let seen: Vec<(String, Value)> = received(&rx)
        .iter()
        .map(|m| {
            (
                m["data"]["phase"].as_str().unwrap().to_string(),
                m["data"]["minutes"].clone(),
            )
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("focus_start".to_string(), Value::from(25)),
            ("focus_start".to_string(), Value::from(1)),
            ("break_start".to_string(), Value::from(1)),
            ("cycle_end".to_string(), Value::Null),
            ("all_done".to_string(), Value::Null),
        ]
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn every_open_tab_receives_every_event() {
    let harness = Harness::start(None);
    let first = harness.connect("u1");
    let second = harness.connect("u1");
    let other_user = harness.connect("u2");

    harness.runtime.queue.push(Event::followup("u1"));
    harness.runtime.queue.push(Event::followup("nobody"));
    harness.runtime.queue.join().await;

    assert_eq!(received(&first).len(), 1);
    assert_eq!(received(&second).len(), 1);
    assert!(received(&other_user).is_empty());

    harness.stop().await;
}
