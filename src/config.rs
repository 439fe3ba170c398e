use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coins::Coins;
use crate::output::RecordMode;
use crate::plan::TrialPlan;
use crate::stimuli::DEFAULT_PLACEHOLDER;

/// Presentation timings around each trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Seconds of warning countdown (ticks run from this value down to 0).
    pub countdown_secs: u32,
    pub result_hold: Duration,
    /// Delay between the coin cue and the balance update on screen.
    pub cue_lead: Duration,
    /// Cancellation poll interval during waits.
    pub poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            result_hold: Duration::from_secs(10),
            cue_lead: Duration::from_millis(200),
            poll: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub subject_id: String,
    pub plan: TrialPlan,
    pub timing: Timing,
    pub image_dir: PathBuf,
    pub placeholder: String,
    pub out_dir: PathBuf,
    pub marker_path: PathBuf,
    pub kill_file: PathBuf,
    pub record_mode: RecordMode,
}

impl SessionConfig {
    /// Timed protocol, default timings, paths under `out/sessions`.
    pub fn defaults(subject_id: &str) -> Self {
        let out_dir = PathBuf::from("out/sessions");
        Self {
            subject_id: subject_id.to_string(),
            plan: TrialPlan::timed_protocol(),
            timing: Timing::default(),
            image_dir: PathBuf::from("images"),
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            marker_path: out_dir.join("markers.jsonl"),
            out_dir,
            kill_file: PathBuf::from("/tmp/STOP"),
            record_mode: RecordMode::PerTrial,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Starts from `defaults` and overrides whatever `var` yields. Unset
    /// keys keep their defaults; malformed values are errors.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let subject_id = var("SUBJECT_ID").unwrap_or_else(|| "0".to_string());
        let mut cfg = Self::defaults(&subject_id);

        let plan = &mut cfg.plan;
        if let Some(v) = parsed::<u32>(&var, "TRIAL_COUNT")? {
            plan.trial_count = v;
        }
        if let Some(v) = parsed::<f64>(&var, "TRIAL_SECS")? {
            secs(v, "TRIAL_SECS")?;
            plan.trial_duration = v;
        }
        if let Some(v) = var("BONUS_TRIALS") {
            plan.bonus_trials = parse_indices(&v).context("BONUS_TRIALS")?.into_iter().collect();
        }
        if let Some(v) = var("WARNING_TRIALS") {
            plan.warning_trials = parse_indices(&v).context("WARNING_TRIALS")?;
        }
        if let Some(v) = parsed::<Coins>(&var, "BONUS_AMOUNT")? {
            plan.bonus_amount = v;
        }
        if let Some(v) = parsed::<Coins>(&var, "START_BALANCE")? {
            plan.starting_balance = v;
        }
        if let Some(v) = parsed::<u32>(&var, "LOSS_ON_WARNING")? {
            plan.forced_loss_warning_ordinal = v;
        }

        if let Some(v) = parsed::<u32>(&var, "COUNTDOWN_SECS")? {
            cfg.timing.countdown_secs = v;
        }
        if let Some(v) = parsed::<f64>(&var, "RESULT_HOLD_SECS")? {
            cfg.timing.result_hold = secs(v, "RESULT_HOLD_SECS")?;
        }
        if let Some(v) = parsed::<u64>(&var, "CUE_LEAD_MS")? {
            cfg.timing.cue_lead = Duration::from_millis(v);
        }

        if let Some(v) = var("IMAGE_DIR") {
            cfg.image_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PLACEHOLDER") {
            cfg.placeholder = v;
        }
        if let Some(v) = var("OUT_DIR") {
            cfg.out_dir = PathBuf::from(v);
            cfg.marker_path = cfg.out_dir.join("markers.jsonl");
        }
        if let Some(v) = var("MARKER_PATH") {
            cfg.marker_path = PathBuf::from(v);
        }
        if let Some(v) = var("KILL_FILE") {
            cfg.kill_file = PathBuf::from(v);
        }
        if let Some(v) = parsed::<RecordMode>(&var, "RECORD_MODE")? {
            cfg.record_mode = v;
        }
        Ok(cfg)
    }

    pub fn trial_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.plan.trial_duration).unwrap_or(Duration::ZERO)
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}={:?}: {}", key, raw, e)),
    }
}

fn secs(v: f64, key: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(v)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", key))
}

/// `"2,5, 8"` -> `[2, 5, 8]`. Empty string is an empty list.
pub fn parse_indices(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|e| anyhow!("bad trial index {:?}: {}", s, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_timed_protocol() {
        let cfg = SessionConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(cfg.subject_id, "0");
        assert_eq!(cfg.plan, TrialPlan::timed_protocol());
        assert_eq!(cfg.timing, Timing::default());
        assert_eq!(cfg.record_mode, RecordMode::PerTrial);
        assert_eq!(cfg.marker_path, PathBuf::from("out/sessions/markers.jsonl"));
    }

    #[test]
    fn test_overrides() {
        let cfg = SessionConfig::from_vars(vars(&[
            ("SUBJECT_ID", "42"),
            ("TRIAL_COUNT", "60"),
            ("TRIAL_SECS", "2.5"),
            ("BONUS_TRIALS", "2,5,8"),
            ("WARNING_TRIALS", "4, 6"),
            ("BONUS_AMOUNT", "1"),
            ("START_BALANCE", "5.00"),
            ("LOSS_ON_WARNING", "2"),
            ("OUT_DIR", "/tmp/x"),
            ("RECORD_MODE", "events_only"),
            ("COUNTDOWN_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(cfg.subject_id, "42");
        assert_eq!(cfg.plan.trial_duration, 2.5);
        assert_eq!(cfg.plan.bonus_trials.iter().copied().collect::<Vec<_>>(), vec![2, 5, 8]);
        assert_eq!(cfg.plan.warning_trials, vec![4, 6]);
        assert_eq!(cfg.plan.bonus_amount, Coins::whole(1));
        assert_eq!(cfg.marker_path, PathBuf::from("/tmp/x/markers.jsonl"));
        assert_eq!(cfg.record_mode, RecordMode::EventsOnly);
        assert_eq!(cfg.timing.countdown_secs, 3);
        assert!(cfg.plan.validate().is_ok());
        assert_eq!(cfg.trial_duration(), Duration::from_millis(2500));
    }

    #[test]
    fn test_malformed_values_are_errors() {
        assert!(SessionConfig::from_vars(vars(&[("TRIAL_COUNT", "ten")])).is_err());
        assert!(SessionConfig::from_vars(vars(&[("BONUS_TRIALS", "1,x")])).is_err());
        assert!(SessionConfig::from_vars(vars(&[("BONUS_AMOUNT", "-1")])).is_err());
        assert!(SessionConfig::from_vars(vars(&[("RESULT_HOLD_SECS", "-2")])).is_err());
    }

    #[test]
    fn test_unrepresentable_trial_secs_rejected() {
        assert!(SessionConfig::from_vars(vars(&[("TRIAL_SECS", "1e20")])).is_err());
        assert!(SessionConfig::from_vars(vars(&[("TRIAL_SECS", "-1")])).is_err());
        assert!(SessionConfig::from_vars(vars(&[("TRIAL_SECS", "inf")])).is_err());
    }

    #[test]
    fn test_parse_indices() {
        assert_eq!(parse_indices("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_indices("3, 1,2,").unwrap(), vec![3, 1, 2]);
    }
}
