use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::coins::Coins;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Trial index outside `[1, trial_count]`.
    InvalidIndex { index: u32, trial_count: u32 },
    InvalidPlan(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidIndex { index, trial_count } => {
                write!(f, "trial index {} outside 1..={}", index, trial_count)
            }
            ScheduleError::InvalidPlan(reason) => write!(f, "invalid trial plan: {}", reason),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Fixed description of one run. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialPlan {
    pub trial_count: u32,
    /// Seconds each trial occupies on screen.
    pub trial_duration: f64,
    pub bonus_trials: BTreeSet<u32>,
    /// Order matters: the forced loss is keyed on encounter ordinal.
    pub warning_trials: Vec<u32>,
    pub bonus_amount: Coins,
    pub starting_balance: Coins,
    pub forced_loss_warning_ordinal: u32,
}

impl TrialPlan {
    /// The fixed 30-minute protocol: one event every 30 s, every third
    /// event (multiples of 90 s) a warning, everything else a 0.10 bonus.
    /// The second warning (t = 180 s) wipes the balance.
    pub fn timed_protocol() -> Self {
        Self::interval_protocol(1800, 30, 3, Coins::from_cents(10), Coins::whole(5), 2)
    }

    /// Events at `interval_secs, 2*interval_secs, ..., total_secs`; every
    /// `warning_every`-th event is a warning, the rest are bonuses.
    pub fn interval_protocol(
        total_secs: u32,
        interval_secs: u32,
        warning_every: u32,
        bonus_amount: Coins,
        starting_balance: Coins,
        forced_loss_warning_ordinal: u32,
    ) -> Self {
        let trial_count = if interval_secs == 0 { 0 } else { total_secs / interval_secs };
        let mut bonus_trials = BTreeSet::new();
        let mut warning_trials = Vec::new();
        for index in 1..=trial_count {
            if warning_every > 0 && index % warning_every == 0 {
                warning_trials.push(index);
            } else {
                bonus_trials.insert(index);
            }
        }
        Self {
            trial_count,
            trial_duration: interval_secs as f64,
            bonus_trials,
            warning_trials,
            bonus_amount,
            starting_balance,
            forced_loss_warning_ordinal,
        }
    }

    pub fn is_bonus(&self, index: u32) -> bool {
        self.bonus_trials.contains(&index)
    }

    pub fn is_warning(&self, index: u32) -> bool {
        self.warning_trials.contains(&index)
    }

    pub fn check_index(&self, index: u32) -> Result<(), ScheduleError> {
        if index == 0 || index > self.trial_count {
            return Err(ScheduleError::InvalidIndex { index, trial_count: self.trial_count });
        }
        Ok(())
    }

    /// The one plan check that `process_trial` repeats on every call.
    pub fn check_loss_reachable(&self) -> Result<(), ScheduleError> {
        if self.forced_loss_warning_ordinal as usize > self.warning_trials.len() {
            return Err(ScheduleError::InvalidPlan(format!(
                "forced loss on warning #{} but only {} warning trial(s) configured",
                self.forced_loss_warning_ordinal,
                self.warning_trials.len()
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.trial_count == 0 {
            return Err(ScheduleError::InvalidPlan("trial_count must be positive".to_string()));
        }
        if self.trial_duration <= 0.0
            || std::time::Duration::try_from_secs_f64(self.trial_duration).is_err()
        {
            return Err(ScheduleError::InvalidPlan(format!(
                "trial_duration must be a positive number of seconds, got {}",
                self.trial_duration
            )));
        }
        if self.forced_loss_warning_ordinal == 0 {
            return Err(ScheduleError::InvalidPlan(
                "forced_loss_warning_ordinal must be at least 1".to_string(),
            ));
        }
        self.check_loss_reachable()?;
        let out_of_range = |i: &u32| *i == 0 || *i > self.trial_count;
        if let Some(i) = self.bonus_trials.iter().find(|i| out_of_range(i)) {
            return Err(ScheduleError::InvalidPlan(format!(
                "bonus trial {} outside 1..={}",
                i, self.trial_count
            )));
        }
        if let Some(i) = self.warning_trials.iter().find(|i| out_of_range(i)) {
            return Err(ScheduleError::InvalidPlan(format!(
                "warning trial {} outside 1..={}",
                i, self.trial_count
            )));
        }
        let mut seen = BTreeSet::new();
        if let Some(i) = self.warning_trials.iter().find(|i| !seen.insert(**i)) {
            return Err(ScheduleError::InvalidPlan(format!("warning trial {} listed twice", i)));
        }
        Ok(())
    }

    /// Trial on which the forced loss lands, if the plan reaches it.
    pub fn loss_trial(&self) -> Option<u32> {
        let ordinal = self.forced_loss_warning_ordinal as usize;
        if ordinal == 0 {
            return None;
        }
        let mut sorted = self.warning_trials.clone();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.get(ordinal - 1).copied()
    }
}
