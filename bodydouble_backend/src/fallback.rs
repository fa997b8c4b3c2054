//! Canned phrasing used whenever the agent service has nothing to say.

use rand::seq::SliceRandom;

use crate::events::{Event, EventType, PomodoroPhase};
use crate::personality::Personality;

/// Deterministic text for a queued event, wrapped in the persona's phrasing.
pub fn event_text(event: &Event, personality: &Personality) -> String {
    let base = match event.event_type() {
        EventType::ReminderDue => phase_text(event.phase(), event.minutes()),
        EventType::MsgFollowup => {
            "Hey, still here—how's it going? Want a tiny 5‑minute next step?".to_string()
        }
    };
    personality.decorate(&base)
}

fn phase_text(phase: Option<PomodoroPhase>, minutes: Option<u64>) -> String {
    match (phase, minutes) {
        (Some(PomodoroPhase::FocusStart), Some(m)) => {
            format!("Starting a {m}-minute focus block—let's do this!")
        }
        (Some(PomodoroPhase::FocusStart), None) => {
            "Starting a focus block—let's do this!".to_string()
        }
        (Some(PomodoroPhase::BreakStart), Some(m)) => {
            format!("Break time for {m} minutes—water and a quick stretch!")
        }
        (Some(PomodoroPhase::BreakStart), None) => {
            "Break time—water and a quick stretch!".to_string()
        }
        (Some(PomodoroPhase::CycleEnd), _) => "That round's done. Start another?".to_string(),
        _ => "All pomodoros done for today. Great job!".to_string(),
    }
}

const GREETING_WORDS: &[&str] = &["hello", "hi", "hey", "good morning", "good afternoon"];
const STUCK_WORDS: &[&str] = &["help", "stuck", "confused", "don't know"];
const TIRED_WORDS: &[&str] = &["tired", "exhausted", "burned out"];
const DONE_WORDS: &[&str] = &["done", "finished", "completed", "accomplished"];
const FOCUS_WORDS: &[&str] = &["focus", "concentrate", "work", "study"];

const GREETING_REPLIES: &[&str] = &[
    "Hey there! Ready to tackle something today?",
    "Hi! What's on your mind?",
    "Hello! How can I help you stay focused?",
    "Hey! What's your priority right now?",
];
const STUCK_REPLIES: &[&str] = &[
    "Let's break this down into smaller pieces.",
    "What's the smallest step you can take right now?",
    "I'm here to help! What's feeling overwhelming?",
    "Let's tackle this one piece at a time.",
];
const TIRED_REPLIES: &[&str] = &[
    "Take a moment to breathe. You're doing great.",
    "Rest is productive too. What would help you recharge?",
    "It's okay to slow down. What's one tiny thing you can do?",
    "You've been working hard. How about a short break?",
];
const DONE_REPLIES: &[&str] = &[
    "Awesome! That's a win worth celebrating.",
    "Great job! What's next on your list?",
    "You did it! How does that feel?",
    "Nice work! Ready for the next challenge?",
];
const FOCUS_REPLIES: &[&str] = &[
    "Let's set up a focused work session.",
    "What's your main goal for this focus time?",
    "Ready to dive in? What's your first step?",
    "Let's create some momentum together.",
];
const GENERIC_REPLIES: &[&str] = &[
    "I'm listening! Tell me more about what's on your mind.",
    "What's the most important thing right now?",
    "How can I support you today?",
    "What would help you feel more confident?",
    "Let's figure this out together.",
    "What's your next small step?",
];

/// The reply pool for a user message, chosen by keyword; the first matching
/// group wins. Single-word keywords match whole words only, so "this" is not
/// a greeting.
pub fn chat_reply_pool(user_text: &str) -> &'static [&'static str] {
    let lowered = user_text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|word| !word.is_empty())
        .collect();
    let mentions = |keywords: &[&str]| {
        keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                lowered.contains(keyword)
            } else {
                words.contains(keyword)
            }
        })
    };

    if mentions(GREETING_WORDS) {
        GREETING_REPLIES
    } else if mentions(STUCK_WORDS) {
        STUCK_REPLIES
    } else if mentions(TIRED_WORDS) {
        TIRED_REPLIES
    } else if mentions(DONE_WORDS) {
        DONE_REPLIES
    } else if mentions(FOCUS_WORDS) {
        FOCUS_REPLIES
    } else {
        GENERIC_REPLIES
    }
}

pub fn chat_reply(user_text: &str, personality: &Personality) -> String {
    let pool = chat_reply_pool(user_text);
    let choice = pool
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("What's your next small step?");
    personality.decorate(choice)
}
