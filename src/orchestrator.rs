use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::llm::SkillExecutor;
use crate::logging::{log_calibration, log_error, log_profiling, log_recovery};
use crate::matrix::{active_cells, ActivationOrderStore};
use crate::models::{
    Answer, CalibrationAnalysis, CalibrationChallenge, CalibrationFlowState, CalibrationPhase,
    CalibrationRecord, PersonalityProfile, ProfilingFlowState, ProfilingPhase, ProfilingSummary,
};
use crate::parser::{extract_trailing_json, parse};
use crate::prompts::{build_analysis_message, build_challenge_message, build_profiling_message};
use crate::recovery::RecoveryStore;
use crate::skills::{profiling_skill_id, SkillLookup, ANALYSIS_SKILL_ID, CALIBRATION_SKILL_ID};
use crate::store::{CalibrationRecordStore, CorpusStore, ProfileStore};
use crate::xp::{self, LevelCheck, CALIBRATION_XP_REWARD};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============ Events & Snapshots ============

/// Fire-and-forget signals for UI collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusShouldRefresh,
    LeveledUp { level: i64 },
    ChallengeReady(CalibrationChallenge),
    ProfilingFinished { level: i64, success: bool },
}

/// Everything the dashboard shows
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GhostStatus {
    pub level: i64,
    pub total_xp: i64,
    pub current_level_xp: i64,
    pub xp_needed: i64,
    pub personality_tags: Vec<String>,
    pub summary: String,
    pub challenges_remaining: usize,
    pub version: i64,
    pub calibration_phase: CalibrationPhase,
    pub pending_challenge: Option<CalibrationChallenge>,
    pub profiling_in_flight: bool,
    pub is_error: bool,
    pub error_message: Option<String>,
}

/// Result of one successful calibration round
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    pub record_id: Uuid,
    pub ghost_response: String,
    pub analysis: String,
    pub xp_earned: i64,
    pub total_xp: i64,
    pub level_check: LevelCheck,
}

/// What the startup recovery pass found and did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub resurfaced_challenge: Option<CalibrationChallenge>,
    pub resubmitted_answer: bool,
    pub discarded_calibration: bool,
    pub profiling_resumed_at: Option<i64>,
    pub profiling_abandoned: bool,
    pub initial_profiling_triggered: bool,
}

// ============ Engine ============

struct EngineState {
    phase: CalibrationPhase,
    challenge: Option<CalibrationChallenge>,
    generating: bool,              // challenge request in flight
    profiling_in_flight: bool,
    is_error: bool,
    error_message: Option<String>,
    activation_order: Vec<u32>,
}

/// The engagement orchestrator: calibration and profiling state machines
/// over the file stores, driven by an external skill executor.
pub struct Engine {
    config: EngineConfig,
    executor: Arc<dyn SkillExecutor>,
    skills: Arc<dyn SkillLookup>,
    profiles: ProfileStore,
    records: CalibrationRecordStore,
    corpus: CorpusStore,
    recovery: RecoveryStore,
    activation: ActivationOrderStore,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the `generating` flag even if the request future is dropped
struct GeneratingGuard<'a>(&'a Engine);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.state().generating = false;
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn SkillExecutor>,
        skills: Arc<dyn SkillLookup>,
    ) -> Arc<Self> {
        let activation = ActivationOrderStore::new(config.activation_order_path(), config.matrix_cells());
        let activation_order = activation.load_or_shuffle();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            profiles: ProfileStore::new(config.profile_path()),
            records: CalibrationRecordStore::new(config.records_path()),
            corpus: CorpusStore::new(config.corpus_path()),
            recovery: RecoveryStore::new(config.data_dir.clone()),
            activation,
            state: Mutex::new(EngineState {
                phase: CalibrationPhase::Idle,
                challenge: None,
                generating: false,
                profiling_in_flight: false,
                is_error: false,
                error_message: None,
                activation_order,
            }),
            events,
            background: Mutex::new(Vec::new()),
            config,
            executor,
            skills,
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscriber is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profile(&self) -> PersonalityProfile {
        self.profiles.load()
    }

    pub fn records(&self) -> Vec<CalibrationRecord> {
        self.records.load_all()
    }

    /// Convert an internal failure into the user-visible error flag
    fn fail<T>(&self, err: EngineError) -> Result<T, String> {
        let message = err.to_string();
        log_error(None, &message);
        let mut state = self.state();
        state.is_error = true;
        state.error_message = Some(message.clone());
        Err(message)
    }

    fn clear_error(state: &mut EngineState) {
        state.is_error = false;
        state.error_message = None;
    }

    fn save_profile(&self, profile: &PersonalityProfile) {
        if let Err(e) = self.profiles.save(profile) {
            log_error(Some(&format!("v{}", profile.version)), &EngineError::from(e).to_string());
        }
    }

    async fn run_skill(&self, skill_id: &str, message: &str) -> Result<String, EngineError> {
        let skill = self
            .skills
            .skill(skill_id)
            .ok_or_else(|| EngineError::SkillNotFound(skill_id.to_string()))?;
        self.executor
            .execute_skill(&skill.system_prompt, message)
            .await
            .map_err(|e| EngineError::Llm(e.to_string()))
    }

    /// Spawn onto the current Tokio runtime; `false` when there is none
    fn spawn_background<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                log_error(None, &format!("Cannot start background task: {}", e));
                return false;
            }
        };
        let handle = runtime.spawn(task);
        let mut background = self.background.lock().unwrap_or_else(|p| p.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(handle);
        true
    }

    /// Await every spawned profiling or recovery task, including ones they spawn
    pub async fn wait_for_background_tasks(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut background = self.background.lock().unwrap_or_else(|p| p.into_inner());
                std::mem::take(&mut *background)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    log_error(None, &format!("Background task failed: {}", e));
                }
            }
        }
    }

    // ============ Status ============

    pub fn status(&self) -> GhostStatus {
        let profile = self.profiles.load();
        let challenges_remaining = self.records.challenges_remaining_today();
        let state = self.state();
        GhostStatus {
            level: profile.level,
            total_xp: profile.total_xp,
            current_level_xp: xp::current_level_xp(profile.total_xp),
            xp_needed: xp::xp_needed_for_current_level(),
            personality_tags: profile.personality_tags,
            summary: profile.summary,
            challenges_remaining,
            version: profile.version,
            calibration_phase: state.phase,
            pending_challenge: state.challenge.clone(),
            profiling_in_flight: state.profiling_in_flight,
            is_error: state.is_error,
            error_message: state.error_message.clone(),
        }
    }

    /// Lit matrix cells for the progress inside the current level
    pub fn active_cells(&self) -> HashSet<u32> {
        let progress = xp::level_progress(self.profiles.load().total_xp);
        active_cells(&self.state().activation_order, progress)
    }

    /// Capture one utterance for the next profiling round; blank text is ignored
    pub fn record_utterance(
        &self,
        text: &str,
        app_bundle_id: Option<&str>,
        app_name: Option<&str>,
    ) -> Option<Uuid> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(self.corpus.append(text, app_bundle_id, app_name).id)
    }

    // ============ Calibration ============

    /// Generate a challenge, or return the one already waiting for an answer
    pub async fn start_calibration(&self) -> Result<CalibrationChallenge, String> {
        match self.generate_challenge().await {
            Ok(challenge) => Ok(challenge),
            Err(e) => self.fail(e),
        }
    }

    async fn generate_challenge(&self) -> Result<CalibrationChallenge, EngineError> {
        {
            let mut state = self.state();
            if state.generating || state.phase == CalibrationPhase::Analyzing {
                return Err(EngineError::Busy);
            }
            if let (CalibrationPhase::Challenging, Some(challenge)) = (state.phase, &state.challenge) {
                return Ok(challenge.clone());
            }
            state.generating = true;
        }
        let _guard = GeneratingGuard(self);

        let profile = self.profiles.load();
        if !profile.has_been_profiled() {
            return Err(EngineError::ProfilingRequired);
        }
        if self.records.challenges_remaining_today() == 0 {
            return Err(EngineError::DailyLimitReached);
        }

        let records = self.records.load_all();
        let message = build_challenge_message(&profile, &records);
        log_calibration(
            Some(&format!("L{}", profile.level)),
            &format!("Requesting challenge ({} prior scenarios)", records.len()),
        );

        let raw = self.run_skill(CALIBRATION_SKILL_ID, &message).await?;
        let challenge: CalibrationChallenge = parse(&raw)?;
        if challenge.options.is_empty() {
            return Err(EngineError::Llm("challenge has no options".to_string()));
        }

        self.recovery
            .save_calibration(&CalibrationFlowState::challenging(challenge.clone()));
        {
            let mut state = self.state();
            state.phase = CalibrationPhase::Challenging;
            state.challenge = Some(challenge.clone());
            Self::clear_error(&mut state);
        }
        log_calibration(
            None,
            &format!("Challenge ready: {} / {}", challenge.challenge_type.as_str(), challenge.target_field),
        );
        self.emit(EngineEvent::ChallengeReady(challenge.clone()));
        Ok(challenge)
    }

    /// Answer the pending challenge and run the analysis round
    pub async fn submit_answer(self: &Arc<Self>, answer: Answer) -> Result<CalibrationOutcome, String> {
        let (challenge, answer) = {
            let mut state = self.state();
            if state.generating || state.phase == CalibrationPhase::Analyzing {
                drop(state);
                return self.fail(EngineError::Busy);
            }
            let Some(challenge) = state.challenge.clone() else {
                drop(state);
                return self.fail(EngineError::NoActiveChallenge);
            };
            let answer = match answer.validate(&challenge) {
                Ok(answer) => answer,
                Err(reason) => {
                    drop(state);
                    return self.fail(EngineError::InvalidAnswer(reason));
                }
            };
            state.phase = CalibrationPhase::Analyzing;
            (challenge, answer)
        };

        match self.run_analysis(challenge, answer, 0).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail(e),
        }
    }

    /// Analysis round; the in-memory phase must already be `Analyzing`
    async fn run_analysis(
        self: &Arc<Self>,
        challenge: CalibrationChallenge,
        answer: Answer,
        retry_count: u32,
    ) -> Result<CalibrationOutcome, EngineError> {
        self.recovery
            .save_calibration(&CalibrationFlowState::analyzing(challenge.clone(), &answer, retry_count));

        let result = self.analyze(&challenge, &answer).await;
        let analysis = match result {
            Ok(analysis) => analysis,
            Err(e) => {
                // Snapshot stays on disk for the next recovery pass
                let mut state = self.state();
                state.phase = CalibrationPhase::Challenging;
                return Err(e);
            }
        };

        let mut profile = self.profiles.load();
        let old_xp = profile.total_xp;
        let new_xp = old_xp + CALIBRATION_XP_REWARD;
        let level_check = xp::check_level_up(old_xp, new_xp);

        profile.total_xp = new_xp;
        profile.level = xp::calculate_level(new_xp);
        profile.version += 1;
        profile.merge_tags(analysis.profile_diff.new_tags.iter().cloned());
        profile.updated_at = Utc::now();
        self.save_profile(&profile);

        let diff_json = serde_json::to_string(&analysis.profile_diff).ok();
        let record = CalibrationRecord::new(
            &challenge,
            &answer,
            CALIBRATION_XP_REWARD,
            analysis.ghost_response.clone(),
            diff_json,
        );
        let record_id = record.id;
        self.records.append(record);
        self.recovery.clear_calibration();

        {
            let mut state = self.state();
            state.phase = CalibrationPhase::Idle;
            state.challenge = None;
            Self::clear_error(&mut state);
        }

        log_calibration(
            Some(&record_id.to_string()),
            &format!(
                "Round complete: +{} XP, total {} (layer {})",
                CALIBRATION_XP_REWARD, new_xp, analysis.profile_diff.layer
            ),
        );
        self.emit(EngineEvent::StatusShouldRefresh);

        if level_check.leveled_up {
            self.on_level_up(level_check.new_level);
        }

        Ok(CalibrationOutcome {
            record_id,
            ghost_response: analysis.ghost_response,
            analysis: analysis.analysis,
            xp_earned: CALIBRATION_XP_REWARD,
            total_xp: new_xp,
            level_check,
        })
    }

    async fn analyze(
        &self,
        challenge: &CalibrationChallenge,
        answer: &Answer,
    ) -> Result<CalibrationAnalysis, EngineError> {
        let profile = self.profiles.load();
        let records = self.records.load_all();
        let message = build_analysis_message(&profile, challenge, answer, &records);
        let raw = self.run_skill(ANALYSIS_SKILL_ID, &message).await?;
        Ok(parse(&raw)?)
    }

    fn on_level_up(self: &Arc<Self>, level: i64) {
        log_calibration(Some(&format!("L{}", level)), "Level up");
        let order = self.activation.reshuffle();
        self.state().activation_order = order;
        self.emit(EngineEvent::LeveledUp { level });
        self.trigger_profiling(level);
    }

    // ============ Profiling ============

    /// Start a profiling round for `level` in the background.
    ///
    /// Must run inside a Tokio runtime. Without one the trigger is logged and
    /// dropped, and the saved snapshot lets the next `recover` pick it up.
    pub fn trigger_profiling(self: &Arc<Self>, level: i64) {
        let flow = ProfilingFlowState::pending(level, self.config.profiling_max_retries);
        self.start_profiling(flow);
    }

    fn start_profiling(self: &Arc<Self>, flow: ProfilingFlowState) {
        let level = flow.trigger_level.unwrap_or(1);
        {
            let mut state = self.state();
            if state.profiling_in_flight {
                log_profiling(
                    Some(&format!("L{}", level)),
                    "Profiling already in flight, dropping trigger",
                );
                return;
            }
            state.profiling_in_flight = true;
        }

        self.recovery.save_profiling(&flow);
        log_profiling(
            Some(&format!("L{}", level)),
            &format!("Profiling scheduled (attempt {}/{})", flow.retry_count + 1, flow.max_retries),
        );

        let engine = Arc::clone(self);
        let spawned = self.spawn_background(async move {
            engine.run_profiling(flow).await;
        });
        if !spawned {
            self.state().profiling_in_flight = false;
        }
    }

    /// Attempt rounds until success or retries run out; never surfaces errors
    async fn run_profiling(&self, mut flow: ProfilingFlowState) {
        let level = flow.trigger_level.unwrap_or(1);
        let ctx = format!("L{}", level);
        let delay = Duration::from_millis(self.config.profiling_retry_delay_ms);

        let success = loop {
            flow.phase = ProfilingPhase::Running;
            flow.updated_at = Utc::now();
            self.recovery.save_profiling(&flow);

            match self.profiling_round(&mut flow, level).await {
                Ok(()) => {
                    self.recovery.clear_profiling();
                    log_profiling(Some(&ctx), "Profiling complete");
                    break true;
                }
                Err(e) => {
                    flow.retry_count += 1;
                    flow.phase = ProfilingPhase::Pending;
                    flow.updated_at = Utc::now();
                    log_error(
                        Some(&ctx),
                        &format!("Profiling attempt {}/{} failed: {}", flow.retry_count, flow.max_retries, e),
                    );

                    if !flow.can_retry() {
                        log_profiling(Some(&ctx), "Giving up on profiling for this level");
                        self.recovery.clear_profiling();
                        break false;
                    }
                    self.recovery.save_profiling(&flow);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        self.state().profiling_in_flight = false;
        self.emit(EngineEvent::ProfilingFinished { level, success });
        if success {
            self.emit(EngineEvent::StatusShouldRefresh);
        }
    }

    async fn profiling_round(&self, flow: &mut ProfilingFlowState, level: i64) -> Result<(), EngineError> {
        let profile = self.profiles.load();
        let corpus = self.corpus.unconsumed();
        let records = self.records.unconsumed();

        let corpus_ids: Vec<Uuid> = corpus.iter().map(|e| e.id).collect();
        let record_ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        flow.corpus_ids = Some(corpus_ids.clone());
        self.recovery.save_profiling(flow);

        let has_report = profile.has_been_profiled();
        let previous = has_report.then_some(profile.profile_text.as_str());
        let message = build_profiling_message(&profile, previous, &corpus, &records);
        log_profiling(
            Some(&format!("L{}", level)),
            &format!("Requesting report ({} utterances, {} records)", corpus.len(), records.len()),
        );

        let report = self.run_skill(profiling_skill_id(has_report), &message).await?;
        let summary: ProfilingSummary = extract_trailing_json(&report)?;

        // Reload: a calibration round may have written the profile meanwhile
        let mut profile = self.profiles.load();
        profile.profile_text = report.trim().to_string();
        profile.summary = summary.summary.clone();
        let tags = summary.clean_tags();
        if !tags.is_empty() {
            profile.personality_tags = tags;
        }
        profile.version += 1;
        profile.updated_at = Utc::now();
        self.save_profile(&profile);

        self.corpus.mark_consumed(&corpus_ids, level);
        self.records.mark_consumed(&record_ids, level);
        Ok(())
    }

    // ============ Recovery ============

    /// Resume whatever was in flight when the process last stopped
    pub async fn recover(self: &Arc<Self>) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        self.recover_calibration(&mut report);
        self.recover_profiling(&mut report);
        log_recovery(None, &format!("Recovery pass finished: {:?}", report));
        report
    }

    fn recover_calibration(self: &Arc<Self>, report: &mut RecoveryReport) {
        let Some(flow) = self.recovery.load_calibration() else {
            return;
        };

        match (flow.phase, flow.challenge.clone()) {
            (CalibrationPhase::Challenging, Some(challenge)) => {
                {
                    let mut state = self.state();
                    state.phase = CalibrationPhase::Challenging;
                    state.challenge = Some(challenge.clone());
                }
                log_recovery(None, "Re-surfacing pending challenge");
                self.emit(EngineEvent::ChallengeReady(challenge.clone()));
                report.resurfaced_challenge = Some(challenge);
            }
            (CalibrationPhase::Analyzing, Some(challenge)) => {
                let answer = Answer::from_parts(flow.selected_option, flow.custom_answer.as_deref())
                    .and_then(|a| a.validate(&challenge).ok());
                let Some(answer) = answer else {
                    log_error(None, "Stored answer is inconsistent, discarding calibration flow");
                    self.recovery.clear_calibration();
                    report.discarded_calibration = true;
                    return;
                };

                {
                    let mut state = self.state();
                    state.phase = CalibrationPhase::Analyzing;
                    state.challenge = Some(challenge.clone());
                }
                log_recovery(
                    None,
                    &format!("Re-submitting stored answer (retry {})", flow.retry_count + 1),
                );
                let engine = Arc::clone(self);
                let retry_count = flow.retry_count + 1;
                report.resubmitted_answer = self.spawn_background(async move {
                    if let Err(e) = engine.run_analysis(challenge, answer, retry_count).await {
                        let _ = engine.fail::<()>(e);
                    }
                });
            }
            _ => {
                self.recovery.clear_calibration();
                report.discarded_calibration = true;
            }
        }
    }

    fn recover_profiling(self: &Arc<Self>, report: &mut RecoveryReport) {
        match self.recovery.load_profiling() {
            Some(flow) if flow.phase != ProfilingPhase::Idle && flow.can_retry() => {
                let level = flow.trigger_level.unwrap_or_else(|| self.profiles.load().level);
                let flow = ProfilingFlowState {
                    phase: ProfilingPhase::Pending,
                    trigger_level: Some(level),
                    ..flow
                };
                log_recovery(Some(&format!("L{}", level)), "Resuming interrupted profiling");
                report.profiling_resumed_at = Some(level);
                self.start_profiling(flow);
            }
            Some(flow) => {
                if flow.phase != ProfilingPhase::Idle {
                    log_recovery(None, "Profiling retries exhausted, clearing state");
                    report.profiling_abandoned = true;
                }
                self.recovery.clear_profiling();
            }
            None => {
                let profile = self.profiles.load();
                if !profile.has_been_profiled() {
                    log_recovery(
                        Some(&format!("L{}", profile.level)),
                        "No profile text yet, triggering profiling",
                    );
                    report.initial_profiling_triggered = true;
                    self.trigger_profiling(profile.level);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChallengeType, CorpusEntry};
    use crate::skills::{
        SkillRegistry, ANALYSIS_PROMPT, CALIBRATION_PROMPT, INITIAL_PROFILING_PROMPT, PROFILING_PROMPT,
    };
    use crate::store::write_json_atomic;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::error::Error;
    use tempfile::TempDir;

    /// Replays canned replies in order and records every call
    #[derive(Default)]
    struct ScriptedExecutor {
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedExecutor {
        pub fn push_ok(&self, text: &str) {
            self.replies.lock().unwrap().push_back(Ok(text.to_string()));
        }

        pub fn push_err(&self, message: &str) {
            self.replies.lock().unwrap().push_back(Err(message.to_string()));
        }

        pub fn system_prompts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    #[async_trait]
    impl SkillExecutor for ScriptedExecutor {
        async fn execute_skill(
            &self,
            system_prompt: &str,
            message: &str,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.calls
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), message.to_string()));
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(message.into()),
                None => Err("no scripted reply".into()),
            }
        }
    }

    const CHALLENGE: &str = "```json\n{\"type\":\"dilemma\",\"scenario\":\"Your flight is cancelled\",\
        \"options\":[\"Rebook at once\",\"Take the train\",\"Stay another night\"],\"targetField\":\"method\"}\n```";
    const ANALYSIS: &str = r#"{"profile_diff":{"layer":"method","changes":{"planning":"acts fast"},"new_tags":["decisive"]},
        "ghost_response":"Of course you rebooked.","analysis":"Prefers immediate action."}"#;
    const REPORT: &str = "## Form\nShort sentences [NEW]\n\n## Spirit\nCalm under pressure [REINFORCED]\n\n\
        {\"summary\": \"A pragmatic fixer\", \"refined_tags\": [\"[NEW] pragmatic\", \"decisive\"]}";

    struct Harness {
        _dir: TempDir,
        config: EngineConfig,
        executor: Arc<ScriptedExecutor>,
        engine: Arc<Engine>,
    }

    fn harness_with(seed: impl FnOnce(&EngineConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.profiling_retry_delay_ms = 0;
        config.matrix_width = 40;
        config.matrix_height = 30;
        seed(&config);
        let executor = Arc::new(ScriptedExecutor::default());
        let engine = Engine::new(
            config.clone(),
            executor.clone(),
            Arc::new(SkillRegistry::with_builtin_prompts()),
        );
        Harness {
            _dir: dir,
            config,
            executor,
            engine,
        }
    }

    fn profiled(total_xp: i64) -> impl FnOnce(&EngineConfig) {
        move |config: &EngineConfig| {
            let mut profile = PersonalityProfile::initial();
            profile.version = 1;
            profile.total_xp = total_xp;
            profile.level = xp::calculate_level(total_xp);
            profile.personality_tags = vec!["curious".into()];
            profile.profile_text = "## Form\nWrites tersely.".into();
            ProfileStore::new(config.profile_path()).save(&profile).unwrap();
        }
    }

    fn challenge() -> CalibrationChallenge {
        CalibrationChallenge {
            challenge_type: ChallengeType::Dilemma,
            scenario: "Your flight is cancelled".into(),
            options: vec!["Rebook at once".into(), "Take the train".into()],
            target_field: "method".into(),
        }
    }

    #[tokio::test]
    async fn calibration_requires_profiling_first() {
        let h = harness_with(|_| {});
        let err = h.engine.start_calibration().await.unwrap_err();
        assert_eq!(err, EngineError::ProfilingRequired.to_string());
        assert!(h.executor.calls.lock().unwrap().is_empty());

        let status = h.engine.status();
        assert!(status.is_error);
        assert_eq!(status.error_message, Some(err));
    }

    #[tokio::test]
    async fn full_round_awards_xp_and_clears_flow() {
        let h = harness_with(profiled(0));
        h.executor.push_ok(CHALLENGE);
        h.executor.push_ok(ANALYSIS);
        let mut events = h.engine.subscribe();

        let challenge = h.engine.start_calibration().await.unwrap();
        assert_eq!(challenge.options.len(), 3);
        assert_eq!(
            RecoveryStore::new(&h.config.data_dir).load_calibration().unwrap().phase,
            CalibrationPhase::Challenging
        );

        let outcome = h.engine.submit_answer(Answer::Option(0)).await.unwrap();
        assert_eq!(outcome.total_xp, 300);
        assert_eq!(outcome.ghost_response, "Of course you rebooked.");
        assert!(!outcome.level_check.leveled_up);

        let profile = h.engine.profile();
        assert_eq!((profile.total_xp, profile.level, profile.version), (300, 1, 2));
        assert_eq!(profile.personality_tags, vec!["curious", "decisive"]);

        let records = h.engine.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].selected_option, 0);
        assert!(records[0].profile_diff.as_deref().unwrap().contains("acts fast"));

        let status = h.engine.status();
        assert_eq!(status.challenges_remaining, 2);
        assert_eq!(status.calibration_phase, CalibrationPhase::Idle);
        assert!(status.pending_challenge.is_none());
        assert!(RecoveryStore::new(&h.config.data_dir).load_calibration().is_none());

        let prompts = h.executor.system_prompts();
        assert_eq!(prompts, vec![CALIBRATION_PROMPT.to_string(), ANALYSIS_PROMPT.to_string()]);

        assert!(matches!(events.try_recv(), Ok(EngineEvent::ChallengeReady(_))));
        assert_eq!(events.try_recv().ok(), Some(EngineEvent::StatusShouldRefresh));
    }

    #[tokio::test]
    async fn pending_challenge_is_reused() {
        let h = harness_with(profiled(0));
        h.executor.push_ok(CHALLENGE);
        let first = h.engine.start_calibration().await.unwrap();
        let second = h.engine.start_calibration().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_custom_answer_never_reaches_the_llm() {
        let h = harness_with(profiled(0));
        h.executor.push_ok(CHALLENGE);
        h.engine.start_calibration().await.unwrap();

        let err = h.engine.submit_answer(Answer::Custom("   \n".into())).await.unwrap_err();
        assert!(err.starts_with("invalid answer"));
        assert_eq!(h.executor.calls.lock().unwrap().len(), 1);
        assert!(h.engine.records().is_empty());
        assert_eq!(h.engine.status().calibration_phase, CalibrationPhase::Challenging);
    }

    #[tokio::test]
    async fn custom_answer_is_recorded_with_sentinel() {
        let h = harness_with(profiled(0));
        h.executor.push_ok(CHALLENGE);
        h.executor.push_ok(ANALYSIS);
        h.engine.start_calibration().await.unwrap();
        h.engine
            .submit_answer(Answer::Custom(" Call the airline and complain ".into()))
            .await
            .unwrap();

        let record = &h.engine.records()[0];
        assert_eq!(record.selected_option, -1);
        assert_eq!(record.custom_answer.as_deref(), Some("Call the airline and complain"));
        let (_, analysis_message) = h.executor.calls.lock().unwrap()[1].clone();
        assert!(analysis_message.contains("rejected all preset options"));
    }

    #[tokio::test]
    async fn submit_without_challenge_fails() {
        let h = harness_with(profiled(0));
        let err = h.engine.submit_answer(Answer::Option(0)).await.unwrap_err();
        assert_eq!(err, EngineError::NoActiveChallenge.to_string());
    }

    #[tokio::test]
    async fn daily_limit_blocks_new_challenges() {
        let h = harness_with(|config| {
            profiled(0)(config);
            let store = CalibrationRecordStore::new(config.records_path());
            for _ in 0..3 {
                store.append(CalibrationRecord::new(&challenge(), &Answer::Option(1), 300, "ok".into(), None));
            }
        });
        let err = h.engine.start_calibration().await.unwrap_err();
        assert_eq!(err, EngineError::DailyLimitReached.to_string());
        assert_eq!(h.engine.status().challenges_remaining, 0);
    }

    #[tokio::test]
    async fn failed_analysis_keeps_flow_for_recovery() {
        let h = harness_with(profiled(0));
        h.executor.push_ok(CHALLENGE);
        h.executor.push_err("timeout");
        h.engine.start_calibration().await.unwrap();

        let err = h.engine.submit_answer(Answer::Option(2)).await.unwrap_err();
        assert!(err.contains("timeout"));
        assert_eq!(h.engine.profile().total_xp, 0);

        let flow = RecoveryStore::new(&h.config.data_dir).load_calibration().unwrap();
        assert_eq!(flow.phase, CalibrationPhase::Analyzing);
        assert_eq!(flow.selected_option, Some(2));

        let status = h.engine.status();
        assert!(status.is_error);
        assert_eq!(status.calibration_phase, CalibrationPhase::Challenging);
    }

    #[tokio::test]
    async fn recovery_resubmits_stored_answer() {
        let h = harness_with(|config| {
            profiled(0)(config);
            RecoveryStore::new(&config.data_dir).save_calibration(&CalibrationFlowState::analyzing(
                challenge(),
                &Answer::Custom("Walk home".into()),
                0,
            ));
        });
        h.executor.push_ok(ANALYSIS);

        let report = h.engine.recover().await;
        assert!(report.resubmitted_answer);
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.engine.profile().total_xp, 300);
        let records = h.engine.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].custom_answer.as_deref(), Some("Walk home"));
        assert!(RecoveryStore::new(&h.config.data_dir).load_calibration().is_none());
        assert!(!h.engine.status().is_error);
    }

    #[tokio::test]
    async fn recovery_resurfaces_challenge_without_llm_call() {
        let h = harness_with(|config| {
            profiled(0)(config);
            RecoveryStore::new(&config.data_dir)
                .save_calibration(&CalibrationFlowState::challenging(challenge()));
        });

        let report = h.engine.recover().await;
        assert_eq!(report.resurfaced_challenge, Some(challenge()));
        assert!(h.executor.calls.lock().unwrap().is_empty());
        assert_eq!(h.engine.status().pending_challenge, Some(challenge()));
    }

    #[tokio::test]
    async fn inconsistent_stored_answer_is_discarded() {
        let h = harness_with(|config| {
            profiled(0)(config);
            let mut flow = CalibrationFlowState::challenging(challenge());
            flow.phase = CalibrationPhase::Analyzing;
            flow.selected_option = Some(-1);
            write_json_atomic(&config.calibration_flow_path(), &flow).unwrap();
        });

        let report = h.engine.recover().await;
        assert!(report.discarded_calibration);
        assert!(RecoveryStore::new(&h.config.data_dir).load_calibration().is_none());
    }

    #[tokio::test]
    async fn level_up_triggers_profiling() {
        let h = harness_with(|config| {
            profiled(9_800)(config);
            let corpus = CorpusStore::new(config.corpus_path());
            corpus.append("let's just ship it", Some("com.tinyspeck.slackmacgap"), Some("Slack"));
        });
        h.executor.push_ok(CHALLENGE);
        h.executor.push_ok(ANALYSIS);
        h.executor.push_ok(REPORT);
        let mut events = h.engine.subscribe();

        h.engine.start_calibration().await.unwrap();
        let outcome = h.engine.submit_answer(Answer::Option(1)).await.unwrap();
        assert!(outcome.level_check.leveled_up);
        assert_eq!(outcome.level_check.new_level, 2);

        h.engine.wait_for_background_tasks().await;

        let profile = h.engine.profile();
        assert_eq!(profile.level, 2);
        assert_eq!(profile.version, 3);
        assert_eq!(profile.summary, "A pragmatic fixer");
        assert_eq!(profile.personality_tags, vec!["pragmatic", "decisive"]);
        assert!(profile.profile_text.starts_with("## Form"));

        let prompts = h.executor.system_prompts();
        assert_eq!(prompts[2], PROFILING_PROMPT);
        let (_, profiling_message) = h.executor.calls.lock().unwrap()[2].clone();
        assert!(profiling_message.contains("let's just ship it"));
        assert!(profiling_message.contains("Writes tersely."));

        let corpus: Vec<CorpusEntry> = CorpusStore::new(h.config.corpus_path()).load_all();
        assert_eq!(corpus[0].consumed_at_level, Some(2));
        assert!(h.engine.records().iter().all(|r| r.consumed_at_level == Some(2)));
        assert!(RecoveryStore::new(&h.config.data_dir).load_profiling().is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&EngineEvent::LeveledUp { level: 2 }));
        assert!(seen.contains(&EngineEvent::ProfilingFinished { level: 2, success: true }));
    }

    #[tokio::test]
    async fn profiling_gives_up_after_max_retries() {
        let h = harness_with(profiled(20_000));
        for _ in 0..3 {
            h.executor.push_err("503");
        }
        let before = h.engine.profile();

        h.engine.trigger_profiling(3);
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.executor.calls.lock().unwrap().len(), 3);
        assert_eq!(h.engine.profile(), before);
        assert!(RecoveryStore::new(&h.config.data_dir).load_profiling().is_none());

        let status = h.engine.status();
        assert!(!status.is_error);
        assert!(!status.profiling_in_flight);
    }

    #[tokio::test]
    async fn profiling_retries_then_succeeds() {
        let h = harness_with(profiled(20_000));
        h.executor.push_err("network down");
        h.executor.push_ok("no json here");
        h.executor.push_ok(REPORT);

        h.engine.trigger_profiling(3);
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.executor.calls.lock().unwrap().len(), 3);
        assert_eq!(h.engine.profile().summary, "A pragmatic fixer");
        assert!(RecoveryStore::new(&h.config.data_dir).load_profiling().is_none());
    }

    #[tokio::test]
    async fn recovery_resumes_pending_profiling() {
        let h = harness_with(|config| {
            profiled(20_000)(config);
            let mut flow = ProfilingFlowState::pending(3, 3);
            flow.phase = ProfilingPhase::Running;
            flow.retry_count = 1;
            RecoveryStore::new(&config.data_dir).save_profiling(&flow);
        });
        h.executor.push_ok(REPORT);

        let report = h.engine.recover().await;
        assert_eq!(report.profiling_resumed_at, Some(3));
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.engine.profile().version, 2);
        assert!(RecoveryStore::new(&h.config.data_dir).load_profiling().is_none());
    }

    #[tokio::test]
    async fn exhausted_profiling_state_is_cleared() {
        let h = harness_with(|config| {
            profiled(20_000)(config);
            let mut flow = ProfilingFlowState::pending(3, 3);
            flow.retry_count = 3;
            RecoveryStore::new(&config.data_dir).save_profiling(&flow);
        });

        let report = h.engine.recover().await;
        assert!(report.profiling_abandoned);
        assert!(h.executor.calls.lock().unwrap().is_empty());
        assert!(RecoveryStore::new(&h.config.data_dir).load_profiling().is_none());
    }

    #[tokio::test]
    async fn fresh_profile_triggers_initial_profiling() {
        let h = harness_with(|_| {});
        h.executor.push_ok(REPORT);

        let report = h.engine.recover().await;
        assert!(report.initial_profiling_triggered);
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.executor.system_prompts(), vec![INITIAL_PROFILING_PROMPT.to_string()]);
        let (_, message) = h.executor.calls.lock().unwrap()[0].clone();
        assert!(message.contains(crate::prompts::FIRST_RUN_MARKER));

        let profile = h.engine.profile();
        assert!(profile.has_been_profiled());
        assert_eq!(profile.version, 1);
    }

    #[tokio::test]
    async fn second_trigger_is_dropped_while_in_flight() {
        let h = harness_with(profiled(20_000));
        h.executor.push_ok(REPORT);

        h.engine.trigger_profiling(3);
        h.engine.trigger_profiling(3);
        h.engine.wait_for_background_tasks().await;

        assert_eq!(h.executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn active_cells_follow_level_progress() {
        let h = harness_with(profiled(15_000));
        assert_eq!(h.engine.active_cells().len(), 600);
    }

    #[test]
    fn blank_utterances_are_ignored() {
        let h = harness_with(|_| {});
        assert!(h.engine.record_utterance("   ", None, None).is_none());
        let id = h.engine.record_utterance(" hello there ", Some("com.apple.Notes"), Some("Notes"));
        let entries = CorpusStore::new(h.config.corpus_path()).load_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(Some(entries[0].id), id);
        assert_eq!(entries[0].text, "hello there");
    }

    #[test]
    fn trigger_outside_a_runtime_is_logged_not_fatal() {
        let h = harness_with(profiled(20_000));
        h.engine.trigger_profiling(3);

        assert!(!h.engine.status().profiling_in_flight);
        assert!(h.executor.calls.lock().unwrap().is_empty());
        let pending = RecoveryStore::new(h.config.data_dir.clone()).load_profiling().unwrap();
        assert_eq!(pending.trigger_level, Some(3));
        assert_eq!(pending.phase, ProfilingPhase::Pending);
    }

    #[tokio::test]
    async fn unwritable_data_dir_degrades_to_logged_failures() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = EngineConfig::with_data_dir(&blocker);
        config.profiling_retry_delay_ms = 0;
        config.matrix_width = 4;
        config.matrix_height = 4;

        let executor = Arc::new(ScriptedExecutor::default());
        executor.push_ok(REPORT);
        let engine = Engine::new(
            config,
            executor.clone(),
            Arc::new(SkillRegistry::with_builtin_prompts()),
        );
        let mut events = engine.subscribe();

        assert!(engine.record_utterance("kept in memory only", None, None).is_some());
        engine.trigger_profiling(1);
        engine.wait_for_background_tasks().await;

        assert_eq!(
            events.try_recv().ok(),
            Some(EngineEvent::ProfilingFinished { level: 1, success: true })
        );
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert_eq!(engine.profile().version, 0);
        assert!(!engine.status().profiling_in_flight);
        assert_eq!(engine.active_cells().len(), 0);
    }
}
