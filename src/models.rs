use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============ Personality Profile ============

/// The evolving user model. Exactly one exists, persisted as `profile.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityProfile {
    pub version: i64,                 // bumped on every successful LLM round
    pub level: i64,                   // 1..=10, always calculate_level(total_xp)
    #[serde(rename = "totalXP")]
    pub total_xp: i64,
    #[serde(default)]
    pub personality_tags: Vec<String>,
    #[serde(default)]
    pub summary: String,              // one-line portrait from the profiling JSON
    pub profile_text: String,         // LLM-authored narrative, only ever re-injected
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersonalityProfile {
    pub fn initial() -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            level: 1,
            total_xp: 0,
            personality_tags: Vec::new(),
            summary: String::new(),
            profile_text: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Profiling has produced a narrative at least once
    pub fn has_been_profiled(&self) -> bool {
        !self.profile_text.trim().is_empty()
    }

    /// Append tags not already present, keeping order
    pub fn merge_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !tag.trim().is_empty() && !self.personality_tags.contains(&tag) {
                self.personality_tags.push(tag);
            }
        }
    }
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self::initial()
    }
}

// ============ Calibration ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Dilemma,
    ReverseTuring,
    Prediction,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Dilemma => "dilemma",
            ChallengeType::ReverseTuring => "reverse_turing",
            ChallengeType::Prediction => "prediction",
        }
    }
}

/// A quiz round generated on-device by the calibration skill
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationChallenge {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub scenario: String,
    pub options: Vec<String>,
    pub target_field: String,         // "form" | "spirit" | "method"
}

/// What the user answered: a preset option or free text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Option(usize),
    Custom(String),
}

/// Sentinel stored in `selected_option` when the user typed their own answer
pub const CUSTOM_ANSWER_SENTINEL: i64 = -1;

impl Answer {
    /// Validate against the challenge; whitespace-only custom text is rejected
    pub fn validate(self, challenge: &CalibrationChallenge) -> Result<Self, String> {
        match self {
            Answer::Option(idx) if idx < challenge.options.len() => Ok(Answer::Option(idx)),
            Answer::Option(idx) => Err(format!(
                "option {} out of range ({} options)",
                idx,
                challenge.options.len()
            )),
            Answer::Custom(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Err("custom answer is empty".to_string())
                } else {
                    Ok(Answer::Custom(trimmed.to_string()))
                }
            }
        }
    }

    /// Split into the persisted `(selectedOption, customAnswer)` pair
    pub fn to_parts(&self) -> (i64, Option<String>) {
        match self {
            Answer::Option(idx) => (*idx as i64, None),
            Answer::Custom(text) => (CUSTOM_ANSWER_SENTINEL, Some(text.clone())),
        }
    }

    /// Rebuild from persisted parts; `None` when the pair breaks the invariant
    pub fn from_parts(selected_option: Option<i64>, custom_answer: Option<&str>) -> Option<Self> {
        match (selected_option, custom_answer) {
            (Some(CUSTOM_ANSWER_SENTINEL), Some(text)) | (None, Some(text))
                if !text.trim().is_empty() =>
            {
                Some(Answer::Custom(text.to_string()))
            }
            (Some(idx), None) if idx >= 0 => Some(Answer::Option(idx as usize)),
            _ => None,
        }
    }
}

/// Immutable log of one completed quiz round
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub scenario: String,
    pub options: Vec<String>,
    pub selected_option: i64,         // -1 means custom_answer is set
    pub custom_answer: Option<String>,
    pub xp_earned: i64,
    pub ghost_response: String,
    pub profile_diff: Option<String>, // raw diff payload, opaque
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at_level: Option<i64>,
}

impl CalibrationRecord {
    pub fn new(
        challenge: &CalibrationChallenge,
        answer: &Answer,
        xp_earned: i64,
        ghost_response: String,
        profile_diff: Option<String>,
    ) -> Self {
        let (selected_option, custom_answer) = answer.to_parts();
        Self {
            id: Uuid::new_v4(),
            challenge_type: challenge.challenge_type,
            scenario: challenge.scenario.clone(),
            options: challenge.options.clone(),
            selected_option,
            custom_answer,
            xp_earned,
            ghost_response,
            profile_diff,
            created_at: Utc::now(),
            consumed_at_level: None,
        }
    }

    /// `(selected_option == -1) <=> custom_answer.is_some()`
    pub fn is_consistent(&self) -> bool {
        (self.selected_option == CUSTOM_ANSWER_SENTINEL) == self.custom_answer.is_some()
    }

    /// One-line summary used by the prompt builders
    pub fn summary_line(&self) -> String {
        match &self.custom_answer {
            Some(custom) => format!("- {} → custom: {}", self.scenario, custom),
            None => {
                let chosen = usize::try_from(self.selected_option)
                    .ok()
                    .and_then(|i| self.options.get(i))
                    .map(String::as_str)
                    .unwrap_or("?");
                format!("- {} → option {} ({})", self.scenario, self.selected_option, chosen)
            }
        }
    }
}

// ============ Speech Corpus ============

/// One captured utterance, later raw material for profiling
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorpusEntry {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at_level: Option<i64>,  // None = unconsumed
    #[serde(default)]
    pub app_bundle_id: Option<String>,   // foreground app when captured, advisory
    #[serde(default)]
    pub app_name: Option<String>,
}

impl CorpusEntry {
    pub fn new(text: &str, app_bundle_id: Option<&str>, app_name: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.to_string(),
            created_at: Utc::now(),
            consumed_at_level: None,
            app_bundle_id: app_bundle_id.map(str::to_string),
            app_name: app_name.map(str::to_string),
        }
    }
}

/// Shared consumption contract of the record and corpus stores
pub trait Consumable {
    fn id(&self) -> Uuid;
    fn consumed_at_level(&self) -> Option<i64>;
    fn set_consumed_at_level(&mut self, level: i64);
}

impl Consumable for CalibrationRecord {
    fn id(&self) -> Uuid {
        self.id
    }
    fn consumed_at_level(&self) -> Option<i64> {
        self.consumed_at_level
    }
    fn set_consumed_at_level(&mut self, level: i64) {
        self.consumed_at_level = Some(level);
    }
}

impl Consumable for CorpusEntry {
    fn id(&self) -> Uuid {
        self.id
    }
    fn consumed_at_level(&self) -> Option<i64> {
        self.consumed_at_level
    }
    fn set_consumed_at_level(&mut self, level: i64) {
        self.consumed_at_level = Some(level);
    }
}

// ============ Flow States ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Idle,        // nothing in flight
    Challenging, // challenge shown, waiting for the user
    Analyzing,   // answer submitted, waiting for the LLM
}

/// Resumable snapshot of an in-flight calibration round
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationFlowState {
    pub phase: CalibrationPhase,
    pub challenge: Option<CalibrationChallenge>,
    pub selected_option: Option<i64>,
    pub custom_answer: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationFlowState {
    pub fn challenging(challenge: CalibrationChallenge) -> Self {
        Self {
            phase: CalibrationPhase::Challenging,
            challenge: Some(challenge),
            selected_option: None,
            custom_answer: None,
            retry_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn analyzing(challenge: CalibrationChallenge, answer: &Answer, retry_count: u32) -> Self {
        let (selected_option, custom_answer) = answer.to_parts();
        Self {
            phase: CalibrationPhase::Analyzing,
            challenge: Some(challenge),
            selected_option: Some(selected_option),
            custom_answer,
            retry_count,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilingPhase {
    Idle,    // nothing in flight
    Pending, // triggered or failed, waiting for a (re)try
    Running, // LLM request in flight
}

pub const DEFAULT_PROFILING_MAX_RETRIES: u32 = 3;

/// Resumable snapshot of an in-flight report-generation round
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingFlowState {
    pub phase: ProfilingPhase,
    pub trigger_level: Option<i64>,
    pub corpus_ids: Option<Vec<Uuid>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProfilingFlowState {
    pub fn pending(trigger_level: i64, max_retries: u32) -> Self {
        Self {
            phase: ProfilingPhase::Pending,
            trigger_level: Some(trigger_level),
            corpus_ids: None,
            retry_count: 0,
            max_retries,
            updated_at: Utc::now(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ============ LLM Response Shapes ============

/// Structured diff returned by the analysis skill
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ProfileDiff {
    pub layer: String,
    #[serde(default)]
    pub changes: BTreeMap<String, String>,
    #[serde(default)]
    pub new_tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CalibrationAnalysis {
    pub profile_diff: ProfileDiff,
    pub ghost_response: String,
    #[serde(default)]
    pub analysis: String,
}

/// JSON summary the profiling skill appends after its narrative report
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProfilingSummary {
    pub summary: String,
    #[serde(default)]
    pub refined_tags: Vec<String>,
}

const TAG_MARKERS: [&str; 3] = ["[NEW]", "[REVISED]", "[REINFORCED]"];

impl ProfilingSummary {
    /// Refined tags without change markers, de-duplicated in order
    pub fn clean_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for raw in &self.refined_tags {
            let mut tag = raw.trim();
            while let Some(marker) = TAG_MARKERS.iter().find(|m| tag.starts_with(*m)) {
                tag = tag[marker.len()..].trim_start();
            }
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags
    }
}
