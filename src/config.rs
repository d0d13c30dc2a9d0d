//! Engine configuration

use crate::error::EngineError;
use crate::matrix::{cell_count, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::models::DEFAULT_PROFILING_MAX_RETRIES;
use crate::recovery::{CALIBRATION_FLOW_FILE, PROFILING_FLOW_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `data_dir` when set
pub const DATA_DIR_ENV: &str = "GHOST_TWIN_DATA_DIR";

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Default data directory: ~/Library/Application Support/GHOSTYPE/ghost_twin
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    home_dir().join("Library/Application Support/GHOSTYPE/ghost_twin")
}

fn default_log_dir() -> PathBuf {
    crate::logging::default_log_dir()
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_HEIGHT
}

fn default_max_retries() -> u32 {
    DEFAULT_PROFILING_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    30_000
}

fn default_api_base_url() -> String {
    "https://api.ghostype.com".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Directory holding the JSON documents and the activation-order cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Progress matrix size; cells = width * height
    #[serde(default = "default_width")]
    pub matrix_width: u32,
    #[serde(default = "default_height")]
    pub matrix_height: u32,

    /// Profiling attempts before giving up for this level
    #[serde(default = "default_max_retries")]
    pub profiling_max_retries: u32,

    /// Delay before an in-process profiling retry (0 = immediate)
    #[serde(default = "default_retry_delay_ms")]
    pub profiling_retry_delay_ms: u64,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Bearer token for the skill endpoint
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            matrix_width: DEFAULT_WIDTH,
            matrix_height: DEFAULT_HEIGHT,
            profiling_max_retries: DEFAULT_PROFILING_MAX_RETRIES,
            profiling_retry_delay_ms: default_retry_delay_ms(),
            api_base_url: default_api_base_url(),
            api_token: None,
            llm_timeout_secs: default_llm_timeout(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at `data_dir`, logs alongside; used by embedders and tests
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            ..Self::default()
        }
    }

    /// Load config from a TOML file; missing keys take defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.matrix_width == 0 || self.matrix_height == 0 {
            return Err(EngineError::Config("matrix dimensions must be non-zero".into()));
        }
        // Cell indices are stored as u32
        if self.matrix_cells() > u32::MAX as usize {
            return Err(EngineError::Config(format!(
                "matrix of {}x{} cells exceeds the u32 index range",
                self.matrix_width, self.matrix_height
            )));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(EngineError::Config("api_base_url is empty".into()));
        }
        Ok(())
    }

    pub fn matrix_cells(&self) -> usize {
        cell_count(self.matrix_width, self.matrix_height)
    }

    // ============ Document Paths ============

    pub fn profile_path(&self) -> PathBuf {
        self.data_dir.join("profile.json")
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("calibration_records.json")
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.data_dir.join("asr_corpus.json")
    }

    pub fn calibration_flow_path(&self) -> PathBuf {
        self.data_dir.join(CALIBRATION_FLOW_FILE)
    }

    pub fn profiling_flow_path(&self) -> PathBuf {
        self.data_dir.join(PROFILING_FLOW_FILE)
    }

    pub fn activation_order_path(&self) -> PathBuf {
        self.data_dir.join("activation_order.bin")
    }
}
