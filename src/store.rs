//! File-backed stores for the profile, calibration records and speech corpus
//!
//! Each store owns one JSON document and rewrites it whole. Loads never fail:
//! a missing or unreadable document is treated as empty/default. Writes go
//! through a temp file and a rename so a crash cannot leave a torn document.

use crate::error::StoreError;
use crate::logging::{log_error, log_store};
use crate::models::{CalibrationRecord, Consumable, CorpusEntry, PersonalityProfile};
use chrono::{DateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub const MAX_RECORDS: usize = 20;
pub const DAILY_LIMIT: usize = 3;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ============ File Helpers ============

/// Write bytes via a sibling temp file, fsync, then rename over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("document"),
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Pretty-printed JSON, written atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read and decode a JSON document. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Load a list document; corruption reads as empty
fn load_list<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    match read_json::<Vec<T>>(path) {
        Ok(list) => list.unwrap_or_default(),
        Err(e) => {
            log_error(None, &format!("{} unreadable, treating as empty: {}", file_label(path), e));
            Vec::new()
        }
    }
}

/// Save a list document; failures are logged only
fn save_list<T: Serialize>(path: &Path, items: &[T]) {
    if let Err(e) = write_json_atomic(path, items) {
        log_error(None, &format!("Failed to write {}: {}", file_label(path), e));
    }
}

fn unconsumed_of<T: Consumable + Clone>(items: &[T]) -> Vec<T> {
    items
        .iter()
        .filter(|item| item.consumed_at_level().is_none())
        .cloned()
        .collect()
}

/// Stamp the given ids; returns how many entries changed
fn mark_consumed_in<T: Consumable>(items: &mut [T], ids: &[Uuid], level: i64) -> usize {
    let wanted: HashSet<&Uuid> = ids.iter().collect();
    let mut marked = 0;
    for item in items.iter_mut() {
        if wanted.contains(&item.id()) {
            item.set_consumed_at_level(level);
            marked += 1;
        }
    }
    marked
}

/// 00:00 UTC of the day containing `now`
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

// ============ Profile Store ============

/// The singleton personality profile, `profile.json`
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current profile, or a fresh one if absent or corrupt
    pub fn load(&self) -> PersonalityProfile {
        match read_json::<PersonalityProfile>(&self.path) {
            Ok(Some(profile)) => profile,
            Ok(None) => PersonalityProfile::initial(),
            Err(e) => {
                log_error(None, &format!("profile.json unreadable, starting fresh: {}", e));
                PersonalityProfile::initial()
            }
        }
    }

    pub fn save(&self, profile: &PersonalityProfile) -> Result<(), StoreError> {
        write_json_atomic(&self.path, profile)?;
        log_store(
            Some(&format!("v{}", profile.version)),
            &format!("Saved profile: level {} / {} XP", profile.level, profile.total_xp),
        );
        Ok(())
    }
}

// ============ Calibration Record Store ============

/// Most recent calibration rounds, `calibration_records.json` (newest last)
#[derive(Debug, Clone)]
pub struct CalibrationRecordStore {
    path: PathBuf,
}

impl CalibrationRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load_all(&self) -> Vec<CalibrationRecord> {
        load_list(&self.path)
    }

    /// Append one record, keeping only the newest `MAX_RECORDS`
    pub fn append(&self, record: CalibrationRecord) {
        let mut records = self.load_all();
        let id = record.id.to_string();
        records.push(record);
        if records.len() > MAX_RECORDS {
            let overflow = records.len() - MAX_RECORDS;
            records.drain(..overflow);
        }
        save_list(&self.path, &records);
        log_store(Some(&id), &format!("Appended calibration record ({} kept)", records.len()));
    }

    pub fn today_count(&self) -> usize {
        self.today_count_at(Utc::now())
    }

    /// Records created on or after 00:00 UTC of `now`'s day
    pub fn today_count_at(&self, now: DateTime<Utc>) -> usize {
        let start = utc_day_start(now);
        self.load_all()
            .iter()
            .filter(|r| r.created_at >= start)
            .count()
    }

    pub fn challenges_remaining_today(&self) -> usize {
        DAILY_LIMIT.saturating_sub(self.today_count())
    }

    pub fn challenges_remaining_at(&self, now: DateTime<Utc>) -> usize {
        DAILY_LIMIT.saturating_sub(self.today_count_at(now))
    }

    pub fn unconsumed(&self) -> Vec<CalibrationRecord> {
        unconsumed_of(&self.load_all())
    }

    pub fn mark_consumed(&self, ids: &[Uuid], level: i64) {
        if ids.is_empty() {
            return;
        }
        let mut records = self.load_all();
        let marked = mark_consumed_in(&mut records, ids, level);
        save_list(&self.path, &records);
        log_store(
            Some(&format!("L{}", level)),
            &format!("Marked {} calibration records consumed", marked),
        );
    }
}

// ============ Corpus Store ============

/// Captured utterances, `asr_corpus.json`
#[derive(Debug, Clone)]
pub struct CorpusStore {
    path: PathBuf,
}

impl CorpusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load_all(&self) -> Vec<CorpusEntry> {
        load_list(&self.path)
    }

    pub fn append(&self, text: &str, app_bundle_id: Option<&str>, app_name: Option<&str>) -> CorpusEntry {
        let entry = CorpusEntry::new(text, app_bundle_id, app_name);
        let mut entries = self.load_all();
        entries.push(entry.clone());
        save_list(&self.path, &entries);
        entry
    }

    pub fn unconsumed(&self) -> Vec<CorpusEntry> {
        unconsumed_of(&self.load_all())
    }

    pub fn mark_consumed(&self, ids: &[Uuid], level: i64) {
        if ids.is_empty() {
            return;
        }
        let mut entries = self.load_all();
        let marked = mark_consumed_in(&mut entries, ids, level);
        save_list(&self.path, &entries);
        log_store(
            Some(&format!("L{}", level)),
            &format!("Marked {} corpus entries consumed", marked),
        );
    }
}
