//! User-message assembly for the three LLM rounds
//!
//! Every builder emits labelled sections in a fixed order: profile, history,
//! then the task instruction. The output is a single flat string.

use crate::models::{
    Answer, CalibrationChallenge, CalibrationRecord, CorpusEntry, PersonalityProfile,
};

pub const NO_HISTORY: &str = "No previous records";
pub const FIRST_RUN_MARKER: &str = "First profiling run, no previous report";
pub const CUSTOM_ANSWER_NOTE: &str = "Note: the user rejected all preset options and answered in their own words. \
Analyse the personality behind their original phrasing in more depth.";

fn tags_line(profile: &PersonalityProfile) -> String {
    profile.personality_tags.join(", ")
}

fn push_records(parts: &mut Vec<String>, records: &[CalibrationRecord], empty: &str) {
    if records.is_empty() {
        parts.push(empty.to_string());
    } else {
        parts.extend(records.iter().map(CalibrationRecord::summary_line));
    }
}

// ============ Challenge ============

/// Message for the challenge-generation skill
pub fn build_challenge_message(profile: &PersonalityProfile, records: &[CalibrationRecord]) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("## Current profile".to_string());
    parts.push(format!("- Level: Lv.{}", profile.level));
    parts.push(format!("- Profile version: v{}", profile.version));
    parts.push(format!("- Captured tags: {}", tags_line(profile)));
    parts.push("- Full profile text:".to_string());
    parts.push(profile.profile_text.clone());

    parts.push(String::new());
    parts.push("## Recent calibration scenarios (do not repeat)".to_string());
    push_records(&mut parts, records, NO_HISTORY);

    parts.push(String::new());
    parts.push("Generate one calibration challenge from the information above.".to_string());

    parts.join("\n")
}

// ============ Analysis ============

/// Message for the answer-analysis skill
pub fn build_analysis_message(
    profile: &PersonalityProfile,
    challenge: &CalibrationChallenge,
    answer: &Answer,
    records: &[CalibrationRecord],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("## Current profile".to_string());
    parts.push(profile.profile_text.clone());

    parts.push(String::new());
    parts.push("## Challenge".to_string());
    parts.push(format!("- Type: {}", challenge.challenge_type.as_str()));
    parts.push(format!("- Scenario: {}", challenge.scenario));
    let options = challenge
        .options
        .iter()
        .enumerate()
        .map(|(i, option)| format!("{}: {}", i, option))
        .collect::<Vec<_>>()
        .join(", ");
    parts.push(format!("- Options: {}", options));
    parts.push(format!("- Target layer: {}", challenge.target_field));

    parts.push(String::new());
    parts.push("## User answer".to_string());
    match answer {
        Answer::Custom(text) => {
            parts.push("- Input: custom answer (no preset option chosen)".to_string());
            parts.push(format!("- Custom answer: {}", text));
            parts.push(CUSTOM_ANSWER_NOTE.to_string());
        }
        Answer::Option(idx) => {
            parts.push(format!("- Option index: {}", idx));
            if let Some(option) = challenge.options.get(*idx) {
                parts.push(format!("- Option text: {}", option));
            }
        }
    }

    parts.push(String::new());
    parts.push("## Calibration history".to_string());
    push_records(&mut parts, records, NO_HISTORY);

    parts.push(String::new());
    parts.push("Analyse the answer and output the profile_diff JSON.".to_string());

    parts.join("\n")
}

// ============ Profiling ============

/// Message for the profiling skill; `previous_report` is `None` on the first run
pub fn build_profiling_message(
    profile: &PersonalityProfile,
    previous_report: Option<&str>,
    corpus: &[CorpusEntry],
    records: &[CalibrationRecord],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("## Previous profiling report".to_string());
    parts.push(
        previous_report
            .filter(|report| !report.trim().is_empty())
            .unwrap_or(FIRST_RUN_MARKER)
            .to_string(),
    );

    parts.push(String::new());
    parts.push("## New speech corpus this level".to_string());
    if corpus.is_empty() {
        parts.push("No new corpus".to_string());
    } else {
        parts.extend(corpus.iter().map(|entry| format!("- {}", entry.text)));
    }

    parts.push(String::new());
    parts.push("## Calibration answers this level".to_string());
    push_records(&mut parts, records, "No calibration records");

    parts.push(String::new());
    parts.push("## Current profile".to_string());
    parts.push(format!("- Level: Lv.{}", profile.level));
    parts.push(format!("- Captured tags: {}", tags_line(profile)));
    parts.push("- Full profile text:".to_string());
    parts.push(profile.profile_text.clone());

    parts.push(String::new());
    parts.push("Write the complete form / spirit / method analysis report.".to_string());
    parts.push("Mark new, revised and reinforced traits with [NEW], [REVISED] and [REINFORCED].".to_string());
    parts.push("End the report with a structured JSON summary:".to_string());
    parts.push(
        "{\"summary\": \"portrait of the user\", \"refined_tags\": [\"tag 1\", \"[NEW] tag 2\", ...]}"
            .to_string(),
    );

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChallengeType;

    fn profile() -> PersonalityProfile {
        let mut profile = PersonalityProfile::initial();
        profile.level = 3;
        profile.version = 7;
        profile.personality_tags = vec!["wry".into(), "decisive".into()];
        profile.profile_text = "Speaks in short bursts, hates small talk.".into();
        profile
    }

    fn challenge() -> CalibrationChallenge {
        CalibrationChallenge {
            challenge_type: ChallengeType::ReverseTuring,
            scenario: "Which reply did you write?".into(),
            options: vec!["ok.".into(), "Sounds great, thanks so much!".into()],
            target_field: "form".into(),
        }
    }

    fn past_record() -> CalibrationRecord {
        CalibrationRecord::new(&challenge(), &Answer::Option(0), 300, "Called it.".into(), None)
    }

    #[test]
    fn challenge_message_embeds_profile_and_dedup_list() {
        let msg = build_challenge_message(&profile(), &[past_record()]);
        assert!(msg.contains("Lv.3"));
        assert!(msg.contains("v7"));
        assert!(msg.contains("wry, decisive"));
        assert!(msg.contains("Speaks in short bursts, hates small talk."));
        assert!(msg.contains("- Which reply did you write? → option 0 (ok.)"));

        let first = build_challenge_message(&profile(), &[]);
        assert!(first.contains(NO_HISTORY));
    }

    #[test]
    fn custom_answer_is_annotated() {
        let answer = Answer::Custom("Neither, I'd call them".into());
        let msg = build_analysis_message(&profile(), &challenge(), &answer, &[]);
        assert!(msg.contains("Neither, I'd call them"));
        assert!(msg.contains(CUSTOM_ANSWER_NOTE));
        assert!(msg.contains("0: ok., 1: Sounds great, thanks so much!"));
        assert!(msg.contains("- Target layer: form"));
    }

    #[test]
    fn preset_answer_has_no_rejection_note() {
        let msg = build_analysis_message(&profile(), &challenge(), &Answer::Option(1), &[]);
        assert!(msg.contains("- Option text: Sounds great, thanks so much!"));
        assert!(!msg.contains(CUSTOM_ANSWER_NOTE));
    }

    #[test]
    fn profiling_message_marks_first_run_and_asks_for_json() {
        let corpus = vec![CorpusEntry::new("send it tonight", None, None)];
        let msg = build_profiling_message(&profile(), None, &corpus, &[past_record()]);
        assert!(msg.contains(FIRST_RUN_MARKER));
        assert!(msg.contains("- send it tonight"));
        assert!(msg.contains("Which reply did you write?"));
        assert!(msg.trim_end().ends_with("...]}"));

        let again = build_profiling_message(&profile(), Some("Earlier report"), &[], &[]);
        assert!(again.contains("Earlier report"));
        assert!(!again.contains(FIRST_RUN_MARKER));
        assert!(again.contains("No new corpus"));
    }

    #[test]
    fn sections_appear_in_order() {
        let msg = build_profiling_message(&profile(), Some("r"), &[], &[]);
        let report = msg.find("## Previous profiling report").unwrap();
        let corpus = msg.find("## New speech corpus").unwrap();
        let answers = msg.find("## Calibration answers").unwrap();
        let current = msg.find("## Current profile").unwrap();
        assert!(report < corpus && corpus < answers && answers < current);
    }
}
