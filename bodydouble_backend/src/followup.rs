use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventQueue};

/// How often the scanner looks for elapsed deadlines.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One "awaiting reply" deadline per user. A scanner turns elapsed deadlines
/// into follow-up events.
pub struct FollowupScheduler {
    deadlines: Mutex<HashMap<String, Instant>>,
    queue: EventQueue,
}

impl FollowupScheduler {
    pub fn new(queue: EventQueue) -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
            queue,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.deadlines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set (or overwrite) the user's deadline to now + `delay`.
    pub fn schedule(&self, user_id: &str, delay: Duration) {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        self.lock().insert(user_id.to_string(), deadline);
        tracing::debug!("Follow-up for '{}' scheduled in {:?}", user_id, delay);
    }

    pub fn cancel(&self, user_id: &str) {
        if self.lock().remove(user_id).is_some() {
            tracing::debug!("Follow-up for '{}' cancelled", user_id);
        }
    }

    pub fn is_pending(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }

    /// Clear every deadline at or before `now` and enqueue one follow-up per
    /// cleared user. Returns the users that fired.
    pub fn scan_due(&self, now: Instant) -> Vec<String> {
        let due: Vec<String> = {
            let mut deadlines = self.lock();
            let due: Vec<String> = deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(user_id, _)| user_id.clone())
                .collect();
            for user_id in &due {
                deadlines.remove(user_id);
            }
            due
        };
        for user_id in &due {
            tracing::debug!("Follow-up due for '{}'", user_id);
            self.queue.push(Event::followup(user_id.as_str()));
        }
        due
    }

    /// Scan every [`SCAN_INTERVAL`] until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Follow-up scanner stopping");
                    return;
                }
                _ = tokio::time::sleep(SCAN_INTERVAL) => {
                    self.scan_due(Instant::now());
                }
            }
        }
    }
}
