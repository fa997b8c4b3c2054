//! Companion events and the single-consumer queue that carries them.
//!
//! Producers (the Pomodoro runner and the follow-up scanner) hold cloned
//! [`EventQueue`] handles. Exactly one [`EventReceiver`] exists and is owned
//! by the orchestrator loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Pomodoro transitions / due reminders
    #[serde(rename = "reminder.due")]
    ReminderDue,
    /// No reply for a while, gentle check-in
    #[serde(rename = "msg.followup")]
    MsgFollowup,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ReminderDue => "reminder.due",
            EventType::MsgFollowup => "msg.followup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PomodoroPhase {
    FocusStart,
    BreakStart,
    CycleEnd,
    AllDone,
}

impl PomodoroPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PomodoroPhase::FocusStart => "focus_start",
            PomodoroPhase::BreakStart => "break_start",
            PomodoroPhase::CycleEnd => "cycle_end",
            PomodoroPhase::AllDone => "all_done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "focus_start" => Some(PomodoroPhase::FocusStart),
            "break_start" => Some(PomodoroPhase::BreakStart),
            "cycle_end" => Some(PomodoroPhase::CycleEnd),
            "all_done" => Some(PomodoroPhase::AllDone),
            _ => None,
        }
    }
}

/// An immutable notification for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    user_id: String,
    data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, user_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type,
            user_id: user_id.into(),
            data,
        }
    }

    /// A Pomodoro phase transition. `minutes` is carried for focus and break starts.
    pub fn reminder(user_id: impl Into<String>, phase: PomodoroPhase, minutes: Option<u32>) -> Self {
        let mut data = Map::new();
        data.insert("phase".to_string(), Value::from(phase.as_str()));
        if let Some(minutes) = minutes {
            data.insert("minutes".to_string(), Value::from(minutes));
        }
        Self::new(EventType::ReminderDue, user_id, data)
    }

    pub fn followup(user_id: impl Into<String>) -> Self {
        Self::new(EventType::MsgFollowup, user_id, Map::new())
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Phase carried by a reminder; `None` when absent or unrecognized.
    pub fn phase(&self) -> Option<PomodoroPhase> {
        self.data
            .get("phase")
            .and_then(Value::as_str)
            .and_then(PomodoroPhase::parse)
    }

    pub fn minutes(&self) -> Option<u64> {
        self.data.get("minutes").and_then(Value::as_u64)
    }
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Producer handle. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    tx: flume::Sender<Event>,
    in_flight: Arc<InFlight>,
}

/// The consuming end. Only the orchestrator owns one.
pub struct EventReceiver {
    rx: flume::Receiver<Event>,
    in_flight: Arc<InFlight>,
}

/// One dequeued event. Dropping it acknowledges the event.
pub struct Delivery {
    event: Event,
    in_flight: Arc<InFlight>,
}

pub fn event_queue() -> (EventQueue, EventReceiver) {
    let (tx, rx) = flume::unbounded();
    let in_flight = Arc::new(InFlight::default());
    (
        EventQueue {
            tx,
            in_flight: in_flight.clone(),
        },
        EventReceiver { rx, in_flight },
    )
}

impl EventQueue {
    pub fn push(&self, event: Event) {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        if let Err(flume::SendError(event)) = self.tx.send(event) {
            self.in_flight.release();
            tracing::warn!(
                "Event queue closed; dropping {} for {}",
                event.event_type().as_str(),
                event.user_id()
            );
        }
    }

    /// Events pushed but not yet acknowledged by the consumer.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Wait until every pushed event has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl EventReceiver {
    /// Next event in arrival order; `None` once every producer is gone.
    pub async fn recv(&self) -> Option<Delivery> {
        let event = self.rx.recv_async().await.ok()?;
        Some(Delivery {
            event,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        let event = self.rx.try_recv().ok()?;
        Some(Delivery {
            event,
            in_flight: self.in_flight.clone(),
        })
    }
}

impl Delivery {
    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.in_flight.release();
    }
}
