//! Crash-recovery snapshots for the two multi-step flows
//!
//! `calibration_flow.json` and `profiling_flow.json` live next to the other
//! documents. A snapshot that fails to decode is deleted on first sight so a
//! bad file can never wedge startup.

use crate::logging::{log_error, log_recovery};
use crate::models::{CalibrationFlowState, ProfilingFlowState};
use crate::store::{read_json, write_json_atomic};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CALIBRATION_FLOW_FILE: &str = "calibration_flow.json";
pub const PROFILING_FLOW_FILE: &str = "profiling_flow.json";

#[derive(Debug, Clone)]
pub struct RecoveryStore {
    base_dir: PathBuf,
}

impl RecoveryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn calibration_path(&self) -> PathBuf {
        self.base_dir.join(CALIBRATION_FLOW_FILE)
    }

    fn profiling_path(&self) -> PathBuf {
        self.base_dir.join(PROFILING_FLOW_FILE)
    }

    // ============ Calibration ============

    pub fn load_calibration(&self) -> Option<CalibrationFlowState> {
        load_snapshot(&self.calibration_path())
    }

    pub fn save_calibration(&self, state: &CalibrationFlowState) {
        save_snapshot(&self.calibration_path(), state);
    }

    pub fn clear_calibration(&self) {
        clear_snapshot(&self.calibration_path());
    }

    // ============ Profiling ============

    pub fn load_profiling(&self) -> Option<ProfilingFlowState> {
        load_snapshot(&self.profiling_path())
    }

    pub fn save_profiling(&self, state: &ProfilingFlowState) {
        save_snapshot(&self.profiling_path(), state);
    }

    pub fn clear_profiling(&self) {
        clear_snapshot(&self.profiling_path());
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match read_json::<T>(path) {
        Ok(state) => state,
        Err(e) => {
            log_error(None, &format!("Discarding corrupt {}: {}", name_of(path), e));
            if let Err(e) = fs::remove_file(path) {
                log_error(None, &format!("Failed to delete {}: {}", name_of(path), e));
            }
            None
        }
    }
}

fn save_snapshot<T: Serialize>(path: &Path, state: &T) {
    match write_json_atomic(path, state) {
        Ok(()) => log_recovery(None, &format!("Saved {}", name_of(path))),
        Err(e) => log_error(None, &format!("Failed to save {}: {}", name_of(path), e)),
    }
}

fn clear_snapshot(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log_recovery(None, &format!("Cleared {}", name_of(path))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log_error(None, &format!("Failed to clear {}: {}", name_of(path), e)),
    }
}
