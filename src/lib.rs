pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod matrix;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod recovery;
pub mod skills;
pub mod store;
pub mod xp;

pub use config::EngineConfig;
pub use error::{EngineError, ParseError, StoreError};
pub use llm::{HttpSkillExecutor, SkillExecutor};
pub use models::{
    Answer, CalibrationChallenge, CalibrationFlowState, CalibrationPhase, CalibrationRecord,
    ChallengeType, CorpusEntry, PersonalityProfile, ProfilingFlowState, ProfilingPhase,
};
pub use orchestrator::{CalibrationOutcome, Engine, EngineEvent, GhostStatus, RecoveryReport};
pub use skills::{Skill, SkillLookup, SkillRegistry};

use std::sync::Arc;

// ============ Bootstrap ============

/// Bring the engine up: logging, log pruning, then the crash-recovery pass
pub async fn bootstrap(
    config: EngineConfig,
    executor: Arc<dyn SkillExecutor>,
    skills: Arc<dyn SkillLookup>,
) -> Result<(Arc<Engine>, RecoveryReport), String> {
    config.validate().map_err(|e| e.to_string())?;

    if let Err(e) = logging::init_logging(&config.log_dir) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    // Keep last 7 days
    let _ = logging::cleanup_old_logs();

    let engine = Engine::new(config, executor, skills);
    let report = engine.recover().await;

    if report == RecoveryReport::default() {
        logging::log_recovery(None, "Engine initialized, no recovery needed");
    }

    Ok((engine, report))
}

/// `bootstrap` with the HTTP skill endpoint and the built-in prompts
pub async fn bootstrap_with_defaults(
    config: EngineConfig,
) -> Result<(Arc<Engine>, RecoveryReport), String> {
    let executor = HttpSkillExecutor::new(
        &config.api_base_url,
        config.api_token.clone(),
        config.llm_timeout_secs,
    )
    .map_err(|e| e.to_string())?;

    bootstrap(
        config,
        Arc::new(executor),
        Arc::new(SkillRegistry::with_builtin_prompts()),
    )
    .await
}
