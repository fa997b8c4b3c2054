use anyhow::{Context, Result};

use crate::events::{Event, EventType, PomodoroPhase};
use crate::personality::Personality;

const REMINDER_INSTRUCTION: &str = "You are a supportive, ADHD‑friendly companion coach. \
     Respond in ONE short, conversational English sentence (max ~20 words), friendly and positive.";

const FOLLOWUP_INSTRUCTION: &str = "You are a caring friend. In ONE brief English sentence (~20 words), \
     lightly check on progress and suggest a tiny next step. Be empathetic and non‑pressuring.";

/// Persona-flavored prompt asking the agent for one line about `event`.
///
/// Focus and break starts must carry `minutes`; anything else about the
/// reminder data is tolerated.
pub fn build_prompt(event: &Event, personality: &Personality) -> Result<String> {
    match event.event_type() {
        EventType::ReminderDue => {
            let base = personality.style_instruction(REMINDER_INSTRUCTION);
            let prompt = match event.phase() {
                Some(PomodoroPhase::FocusStart) => {
                    let minutes = required_minutes(event)?;
                    format!(
                        "{} We're starting a {}-minute focus block; give a kickoff encouragement, \
                         and mention you'll gently check in later if they don't reply.",
                        base, minutes
                    )
                }
                Some(PomodoroPhase::BreakStart) => {
                    let minutes = required_minutes(event)?;
                    format!(
                        "{} Focus just ended; starting a {}-minute break—offer a quick relaxation tip.",
                        base, minutes
                    )
                }
                Some(PomodoroPhase::CycleEnd) => format!(
                    "{} This round is complete; give praise and ask if they want to continue.",
                    base
                ),
                _ => format!(
                    "{} All pomodoros are done today; celebrate and offer a short wrap‑up tip.",
                    base
                ),
            };
            Ok(prompt)
        }
        EventType::MsgFollowup => Ok(format!(
            "{} The user has not replied for a while.",
            personality.style_instruction(FOLLOWUP_INSTRUCTION)
        )),
    }
}

fn required_minutes(event: &Event) -> Result<u64> {
    event.minutes().with_context(|| {
        format!(
            "{} event for {} is missing 'minutes'",
            event.phase().map(PomodoroPhase::as_str).unwrap_or("reminder"),
            event.user_id()
        )
    })
}
