//! Persisted trial log and run manifest.
//!
//! ```text
//! <out_dir>/
//!   subject_<id>_<YYYYMMDD_HHMMSS>.csv                 - one row per trial
//!   subject_<id>_<YYYYMMDD_HHMMSS>.csv.manifest.json   - run metadata
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::coins::Coins;
use crate::ledger::TrialRecord;

pub const CSV_COLUMNS: [&str; 7] = [
    "subject_number",
    "image_number",
    "bonus",
    "warning",
    "loss",
    "coins_after_trial",
    "image_file",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordMode {
    #[default]
    PerTrial,
    /// Only trials with a bonus or a warning.
    EventsOnly,
}

impl RecordMode {
    pub fn keeps(&self, record: &TrialRecord) -> bool {
        match self {
            RecordMode::PerTrial => true,
            RecordMode::EventsOnly => record.is_event(),
        }
    }
}

impl FromStr for RecordMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_trial" | "trial" | "all" => Ok(RecordMode::PerTrial),
            "events_only" | "events" => Ok(RecordMode::EventsOnly),
            other => Err(anyhow!("unknown record mode {:?}", other)),
        }
    }
}

/// Keep only characters that are safe in a filename.
fn filename_safe(subject_id: &str) -> String {
    let cleaned: String = subject_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn csv_filename(subject_id: &str, started: DateTime<Utc>) -> String {
    format!(
        "subject_{}_{}.csv",
        filename_safe(subject_id),
        started.format("%Y%m%d_%H%M%S")
    )
}

pub fn manifest_path(csv_path: &Path) -> PathBuf {
    let mut p = csv_path.to_path_buf();
    let fname = csv_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("trials.csv");
    p.set_file_name(format!("{}.manifest.json", fname));
    p
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

pub fn csv_row(record: &TrialRecord, image_file: &str) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        csv_field(&record.subject_id),
        record.trial_index,
        record.bonus_awarded,
        record.warning_raised,
        record.loss_triggered,
        record.balance_after,
        csv_field(image_file)
    )
}

/// Open trial log: the file exists and carries its header from `create`
/// on, rows land at `finish`. Refuses to overwrite an existing file.
pub struct TrialLog {
    path: PathBuf,
    writer: BufWriter<File>,
    mode: RecordMode,
}

impl TrialLog {
    pub fn create(path: &Path, mode: RecordMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create trial log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_COLUMNS.join(","))
            .and_then(|_| writer.flush())
            .with_context(|| format!("write header {}", path.display()))?;
        Ok(Self { path: path.to_path_buf(), writer, mode })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the rows the mode keeps, flush and sync. Returns the number of
    /// data rows written.
    pub fn finish(mut self, records: &[TrialRecord], stimuli: &[String]) -> Result<usize> {
        let mut rows = 0;
        for record in records.iter().filter(|r| self.mode.keeps(r)) {
            let image = stimuli
                .get(record.trial_index.saturating_sub(1) as usize)
                .map(String::as_str)
                .unwrap_or("");
            writeln!(self.writer, "{}", csv_row(record, image))
                .with_context(|| format!("write trial log {}", self.path.display()))?;
            rows += 1;
        }
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("sync {}", self.path.display()))?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub subject_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub planned_trials: u32,
    pub completed_trials: u32,
    pub early_exit: bool,
    pub record_mode: RecordMode,
    pub rows_written: usize,
    /// Trial whose record was committed but whose screens were cut short
    /// by cancellation or a presenter failure.
    #[serde(default)]
    pub interrupted_trial: Option<u32>,
    pub final_balance: Coins,
    /// Structured-log run this session wrote to.
    #[serde(default)]
    pub log_run_id: String,
    pub csv_path: String,
    pub csv_sha256: String,
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    let body = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, body).with_context(|| format!("write manifest {}", path.display()))
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
