use serde::Serialize;

pub const DEFAULT_PERSONALITY_ID: &str = "focus_friend";

/// Tone, voice and canned phrasing applied to everything the companion says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Personality {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub style_prompt: &'static str,
    pub voice_reference_id: Option<&'static str>,
    #[serde(skip)]
    pub fallback_prefix: &'static str,
    #[serde(skip)]
    pub fallback_suffix: &'static str,
}

static PERSONALITIES: [Personality; 3] = [
    Personality {
        id: "focus_friend",
        title: "Steady Focus Friend",
        description: "A balanced accountability buddy who mixes cheer with calm, \
                      keeps momentum going, and offers tiny nudges.",
        style_prompt: "You are the Steady Focus Friend: a warm, supportive companion who blends gentle coaching \
                       with practical next steps. Keep replies short (~20 words), encouraging, and grounded.",
        voice_reference_id: None,
        fallback_prefix: "Alright, teammate!",
        fallback_suffix: "",
    },
    Personality {
        id: "hype_buddy",
        title: "High-Energy Hype Buddy",
        description: "A big-energy cheerleader who celebrates every win and keeps things upbeat and motivating.",
        style_prompt: "You are the High-Energy Hype Buddy: respond with enthusiastic, upbeat energy, lots of positive \
                       reinforcement, and motivational sparks. Stay concise (~20 words).",
        voice_reference_id: None,
        fallback_prefix: "Let's go!",
        fallback_suffix: "You've absolutely got this!",
    },
    Personality {
        id: "zen_guide",
        title: "Zen Focus Guide",
        description: "A calm, mindful guide who keeps the user grounded with relaxed, reassuring language.",
        style_prompt: "You are the Zen Focus Guide: speak in a calm, centered tone with mindful encouragement. \
                       Keep messages brief (~20 words) and soothing.",
        voice_reference_id: None,
        fallback_prefix: "Deep breath—",
        fallback_suffix: "",
    },
];

pub fn list() -> &'static [Personality] {
    &PERSONALITIES
}

pub fn find(id: &str) -> Option<&'static Personality> {
    PERSONALITIES.iter().find(|p| p.id == id)
}

pub fn default_personality() -> &'static Personality {
    &PERSONALITIES[0]
}

/// Never fails: unknown or empty ids resolve to the default persona.
pub fn resolve(id: Option<&str>) -> &'static Personality {
    id.and_then(find).unwrap_or_else(default_personality)
}

impl Personality {
    /// Prefix `base_instruction` with this persona's style instruction.
    pub fn style_instruction(&self, base_instruction: &str) -> String {
        if self.style_prompt.trim().is_empty() {
            return base_instruction.to_string();
        }
        format!("{} {}", self.style_prompt.trim(), base_instruction)
            .trim()
            .to_string()
    }

    /// Wrap canned text with the persona's fallback prefix and suffix.
    pub fn decorate(&self, text: &str) -> String {
        [self.fallback_prefix.trim(), text.trim(), self.fallback_suffix.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ids_resolve_to_default() {
        for id in [Some("nope"), Some(""), None, Some("FOCUS_FRIEND")] {
            let persona = resolve(id);
            assert_eq!(persona.id, DEFAULT_PERSONALITY_ID);
            assert!(!persona.style_prompt.is_empty());
        }
        assert_eq!(resolve(Some("zen_guide")).id, "zen_guide");
    }

    #[test]
    fn decorate_skips_blank_parts() {
        let hype = find("hype_buddy").expect("registered");
        assert_eq!(
            hype.decorate("Go!"),
            "Let's go! Go! You've absolutely got this!"
        );
        let friend = find("focus_friend").expect("registered");
        assert_eq!(friend.decorate("  hi "), "Alright, teammate! hi");
    }

    #[test]
    fn style_instruction_prefixes_style() {
        let zen = find("zen_guide").expect("registered");
        let prompt = zen.style_instruction("Be brief.");
        assert!(prompt.starts_with("You are the Zen Focus Guide"));
        assert!(prompt.ends_with("Be brief."));
    }

    #[test]
    fn list_keeps_registry_order() {
        let ids: Vec<_> = list().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["focus_friend", "hype_buddy", "zen_guide"]);
    }
}
