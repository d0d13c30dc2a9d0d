// Ghost Twin skill prompts - system prompts for the calibration and profiling rounds

use std::collections::HashMap;

pub const CALIBRATION_SKILL_ID: &str = "internal-ghost-calibration";
pub const ANALYSIS_SKILL_ID: &str = "internal-ghost-analysis";
pub const INITIAL_PROFILING_SKILL_ID: &str = "internal-ghost-initial-profiling";
pub const PROFILING_SKILL_ID: &str = "internal-ghost-profiling";

/// A skill template: the system prompt sent alongside an assembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub id: String,
    pub system_prompt: String,
}

/// Skill lookup by id
pub trait SkillLookup: Send + Sync {
    fn skill(&self, id: &str) -> Option<Skill>;
}

/// Profiling skill id: the initial variant until a narrative exists
pub fn profiling_skill_id(has_profile_text: bool) -> &'static str {
    if has_profile_text {
        PROFILING_SKILL_ID
    } else {
        INITIAL_PROFILING_SKILL_ID
    }
}

// ============ Built-in Prompts ============

pub const CALIBRATION_PROMPT: &str = r#"You are the calibration engine of Ghost Twin, a digital double that learns how its user speaks, feels and decides.

Your job is to write ONE short challenge that reveals something the profile does not yet know.

The profile has three layers:
- form: how the user phrases things (rhythm, vocabulary, punctuation, tone)
- spirit: what the user values and how they react emotionally
- method: how the user decides, plans and solves problems

Pick the layer the profile knows least about. Pick one challenge type:
- dilemma: a concrete everyday situation with 2-4 plausible reactions
- reverse_turing: 2-4 candidate replies, only one written the way the user would write it
- prediction: a situation where the user must predict what they themselves would do

Never repeat a scenario from the recent list. Keep scenarios under 60 words and options under 25 words each.

Respond with ONLY this JSON:
{"type": "dilemma" | "reverse_turing" | "prediction", "scenario": "...", "options": ["...", "..."], "targetField": "form" | "spirit" | "method"}"#;

pub const ANALYSIS_PROMPT: &str = r#"You are the analysis engine of Ghost Twin.

You receive the current profile, a challenge and the user's answer. Work out what the answer says about the user for the challenge's target layer.

If the user wrote a custom answer instead of choosing an option, treat it as the strongest possible signal: they rejected every preset framing. Read their exact wording for tone and priorities.

Rules:
- Only record changes the answer actually supports
- New tags are 1-3 words, lowercase, and must not duplicate existing tags
- ghost_response is one or two sentences, spoken by the Ghost to the user, playful and specific to the answer

Respond with ONLY this JSON:
{"profile_diff": {"layer": "form" | "spirit" | "method", "changes": {"trait": "observation"}, "new_tags": ["..."]}, "ghost_response": "...", "analysis": "..."}"#;

pub const INITIAL_PROFILING_PROMPT: &str = r#"You are the profiling engine of Ghost Twin, writing the FIRST personality report for a new user.

You have their first transcribed speech and any calibration answers they gave. There is no previous report.

Write a report with three sections:
## Form - how they speak and write
## Spirit - what they care about, emotional register
## Method - how they think and decide

Ground every claim in the material. Where evidence is thin, say so rather than guess. Mark every trait as [NEW].

End the report with a JSON object on its own line:
{"summary": "one-sentence portrait", "refined_tags": ["[NEW] tag", ...]}"#;

pub const PROFILING_PROMPT: &str = r#"You are the profiling engine of Ghost Twin, updating an existing personality report after the user reached a new level.

You have the previous report, the speech captured during this level and this level's calibration answers.

Rewrite the full report with the same three sections (Form, Spirit, Method). Keep what still holds. Mark traits:
- [NEW] for traits first seen in this material
- [REVISED] for traits the new material contradicts or refines
- [REINFORCED] for traits the new material confirms

Do not drop a trait without marking it revised.

End the report with a JSON object on its own line:
{"summary": "one-sentence portrait", "refined_tags": ["tag", "[NEW] tag", ...]}"#;

// ============ Registry ============

/// In-memory skill table
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the four Ghost Twin prompts
    pub fn with_builtin_prompts() -> Self {
        let mut registry = Self::new();
        registry.register(CALIBRATION_SKILL_ID, CALIBRATION_PROMPT);
        registry.register(ANALYSIS_SKILL_ID, ANALYSIS_PROMPT);
        registry.register(INITIAL_PROFILING_SKILL_ID, INITIAL_PROFILING_PROMPT);
        registry.register(PROFILING_SKILL_ID, PROFILING_PROMPT);
        registry
    }

    /// Add or replace a skill
    pub fn register(&mut self, id: &str, system_prompt: &str) {
        self.skills.insert(
            id.to_string(),
            Skill {
                id: id.to_string(),
                system_prompt: system_prompt.to_string(),
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<Skill> {
        self.skills.remove(id)
    }
}

impl SkillLookup for SkillRegistry {
    fn skill(&self, id: &str) -> Option<Skill> {
        self.skills.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_every_round() {
        let registry = SkillRegistry::with_builtin_prompts();
        for id in [
            CALIBRATION_SKILL_ID,
            ANALYSIS_SKILL_ID,
            INITIAL_PROFILING_SKILL_ID,
            PROFILING_SKILL_ID,
        ] {
            let skill = registry.skill(id).unwrap();
            assert_eq!(skill.id, id);
            assert!(!skill.system_prompt.is_empty());
        }
        assert!(registry.skill("builtin-translate").is_none());
    }

    #[test]
    fn initial_variant_until_profiled() {
        assert_eq!(profiling_skill_id(false), INITIAL_PROFILING_SKILL_ID);
        assert_eq!(profiling_skill_id(true), PROFILING_SKILL_ID);
    }

    #[test]
    fn register_overrides_builtin() {
        let mut registry = SkillRegistry::with_builtin_prompts();
        registry.register(CALIBRATION_SKILL_ID, "custom");
        assert_eq!(registry.skill(CALIBRATION_SKILL_ID).unwrap().system_prompt, "custom");
    }
}
