//! Per-user focus/break cycle runners.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventQueue, PomodoroPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PomodoroPlan {
    pub focus_min: u32,
    pub break_min: u32,
    pub cycles: u32,
}

/// Where a runner is in its plan. `AllDone` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Focus { cycle: u32 },
    Break { cycle: u32 },
    CycleDone { cycle: u32 },
    AllDone,
    Cancelled,
}

struct RunningCycle {
    token: CancellationToken,
    handle: JoinHandle<CycleState>,
}

pub struct PomodoroRunner {
    queue: EventQueue,
    minute: Duration,
    tasks: Mutex<HashMap<String, RunningCycle>>,
}

impl PomodoroRunner {
    pub fn new(queue: EventQueue) -> Self {
        Self::with_minute(queue, Duration::from_secs(60))
    }

    /// Runner whose "minute" lasts `minute`; tests shrink it.
    pub fn with_minute(queue: EventQueue, minute: Duration) -> Self {
        Self {
            queue,
            minute,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace any runner for `user_id` with a fresh one following `plan`.
    /// The previous runner has fully exited before the new one emits.
    pub async fn start(&self, user_id: &str, plan: PomodoroPlan) {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(user_id) {
            finish(user_id, previous).await;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_cycles(
            user_id.to_string(),
            plan,
            self.queue.clone(),
            self.minute,
            token.clone(),
        ));
        tracing::info!(
            "Pomodoro started for '{}': {} x ({}m focus / {}m break)",
            user_id,
            plan.cycles,
            plan.focus_min,
            plan.break_min
        );
        tasks.insert(user_id.to_string(), RunningCycle { token, handle });
    }

    /// Cancel the user's runner and wait for it. Returns whether one was
    /// still active.
    pub async fn stop(&self, user_id: &str) -> bool {
        let previous = self.tasks.lock().await.remove(user_id);
        match previous {
            Some(running) => finish(user_id, running).await == CycleState::Cancelled,
            None => false,
        }
    }

    pub async fn is_running(&self, user_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(user_id)
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every runner, used on shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, RunningCycle)> = self.tasks.lock().await.drain().collect();
        for (user_id, running) in drained {
            finish(&user_id, running).await;
        }
    }
}

async fn finish(user_id: &str, running: RunningCycle) -> CycleState {
    let already_done = running.handle.is_finished();
    running.token.cancel();
    match running.handle.await {
        Ok(state) => {
            if !already_done {
                tracing::info!("Pomodoro for '{}' stopped", user_id);
            }
            state
        }
        Err(e) => {
            tracing::warn!("Pomodoro task for '{}' ended abnormally: {}", user_id, e);
            CycleState::Cancelled
        }
    }
}

async fn run_cycles(
    user_id: String,
    plan: PomodoroPlan,
    queue: EventQueue,
    minute: Duration,
    token: CancellationToken,
) -> CycleState {
    let emit = |phase: PomodoroPhase, minutes: Option<u32>| {
        queue.push(Event::reminder(user_id.as_str(), phase, minutes));
    };

    let mut state = if plan.cycles == 0 {
        CycleState::AllDone
    } else {
        CycleState::Focus { cycle: 1 }
    };
    loop {
        if token.is_cancelled() {
            state = CycleState::Cancelled;
        }
        state = match state {
            CycleState::Focus { cycle } => {
                emit(PomodoroPhase::FocusStart, Some(plan.focus_min));
                if pause(&token, minute * plan.focus_min).await {
                    CycleState::Break { cycle }
                } else {
                    CycleState::Cancelled
                }
            }
            CycleState::Break { cycle } => {
                emit(PomodoroPhase::BreakStart, Some(plan.break_min));
                if pause(&token, minute * plan.break_min).await {
                    CycleState::CycleDone { cycle }
                } else {
                    CycleState::Cancelled
                }
            }
            CycleState::CycleDone { cycle } => {
                emit(PomodoroPhase::CycleEnd, None);
                if cycle < plan.cycles {
                    CycleState::Focus { cycle: cycle + 1 }
                } else {
                    CycleState::AllDone
                }
            }
            CycleState::AllDone => {
                emit(PomodoroPhase::AllDone, None);
                tracing::debug!("Pomodoro for '{}' completed", user_id);
                return CycleState::AllDone;
            }
            CycleState::Cancelled => return CycleState::Cancelled,
        };
    }
}

/// Sleep unless cancelled first. `false` means cancelled.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
