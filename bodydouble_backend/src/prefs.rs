use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::personality::DEFAULT_PERSONALITY_ID;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrefs {
    pub voice_enabled: bool,
    pub personality_id: String,
}

impl Default for UserPrefs {
    fn default() -> Self {
        Self {
            voice_enabled: false,
            personality_id: DEFAULT_PERSONALITY_ID.to_string(),
        }
    }
}

/// In-memory per-user preferences for the lifetime of the process.
#[derive(Default)]
pub struct PreferenceStore {
    prefs: Mutex<HashMap<String, UserPrefs>>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserPrefs>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.prefs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current preferences, or the defaults when the user has none yet.
    pub fn get(&self, user_id: &str) -> UserPrefs {
        self.lock().get(user_id).cloned().unwrap_or_default()
    }

    pub fn set(&self, user_id: &str, prefs: UserPrefs) {
        self.lock().insert(user_id.to_string(), prefs);
    }

    /// Create the default record if absent.
    pub fn ensure(&self, user_id: &str) {
        self.lock().entry(user_id.to_string()).or_default();
    }

    /// Get-or-default, modify and store as one critical section.
    pub fn update<F>(&self, user_id: &str, change: F) -> UserPrefs
    where
        F: FnOnce(&mut UserPrefs),
    {
        let mut prefs = self.lock();
        let entry = prefs.entry(user_id.to_string()).or_default();
        change(entry);
        entry.clone()
    }
}
