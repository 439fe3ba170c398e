//! Trial scheduler and coin ledger.
//!
//! Walks the plan one trial at a time, applying bonus and warning rules to
//! an explicit `LedgerState`. No I/O, no timing: the session layer owns the
//! clock and the screen.

use serde::{Deserialize, Serialize};

use crate::coins::Coins;
use crate::events::{Marker, MarkerSink, NullSink};
pub use crate::plan::{ScheduleError, TrialPlan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balance: Coins,
    pub warnings_seen: u32,
    /// Set once the forced loss has fired.
    pub loss_applied: bool,
}

impl LedgerState {
    pub fn new(plan: &TrialPlan) -> Self {
        Self {
            balance: plan.starting_balance,
            warnings_seen: 0,
            loss_applied: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub subject_id: String,
    pub trial_index: u32,
    pub bonus_awarded: bool,
    pub warning_raised: bool,
    pub loss_triggered: bool,
    pub balance_after: Coins,
}

impl TrialRecord {
    pub fn is_event(&self) -> bool {
        self.bonus_awarded || self.warning_raised
    }
}

/// Apply one trial's rules to `ledger`. Not idempotent: a second call with
/// the same index applies the bonus and the warning again.
pub fn process_trial(
    plan: &TrialPlan,
    ledger: &mut LedgerState,
    index: u32,
) -> Result<TrialRecord, ScheduleError> {
    plan.check_index(index)?;
    plan.check_loss_reachable()?;

    let bonus_awarded = plan.is_bonus(index);
    if bonus_awarded {
        ledger.balance = ledger.balance.saturating_add(plan.bonus_amount);
    }

    let warning_raised = plan.is_warning(index);
    if warning_raised {
        ledger.warnings_seen += 1;
    }

    let loss_triggered = warning_raised && ledger.warnings_seen == plan.forced_loss_warning_ordinal;
    if loss_triggered {
        ledger.balance = Coins::ZERO;
        ledger.loss_applied = true;
    }

    Ok(TrialRecord {
        subject_id: String::new(),
        trial_index: index,
        bonus_awarded,
        warning_raised,
        loss_triggered,
        balance_after: ledger.balance,
    })
}

/// Markers implied by one processed trial, in emission order.
pub fn trial_markers(record: &TrialRecord) -> Vec<Marker> {
    let index = record.trial_index;
    let mut out = vec![Marker::TrialShown { index }];
    if record.bonus_awarded {
        out.push(Marker::Bonus { index });
    }
    if record.warning_raised {
        out.push(Marker::Alarm { index });
        if record.loss_triggered {
            out.push(Marker::Lost { index });
        } else {
            out.push(Marker::NoLose { index });
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub records: Vec<TrialRecord>,
    pub ledger: LedgerState,
}

pub fn run(plan: &TrialPlan, subject_id: &str) -> Result<RunOutcome, ScheduleError> {
    run_with_markers(plan, subject_id, &mut NullSink)
}

/// `run` plus sync markers: `start`, the per-trial markers, `end`.
pub fn run_with_markers<S: MarkerSink + ?Sized>(
    plan: &TrialPlan,
    subject_id: &str,
    sink: &mut S,
) -> Result<RunOutcome, ScheduleError> {
    plan.validate()?;
    let mut scheduler = Scheduler::new(plan, subject_id);
    sink.emit(&Marker::Start);
    while let Some(record) = scheduler.step()? {
        for marker in trial_markers(&record) {
            sink.emit(&marker);
        }
    }
    sink.emit(&Marker::End);
    Ok(scheduler.finish())
}

/// Step-wise driver over a validated plan, for callers that interleave
/// trials with waiting and drawing.
#[derive(Debug)]
pub struct Scheduler<'a> {
    plan: &'a TrialPlan,
    subject_id: String,
    ledger: LedgerState,
    next_index: u32,
    records: Vec<TrialRecord>,
}

impl<'a> Scheduler<'a> {
    pub fn new(plan: &'a TrialPlan, subject_id: &str) -> Self {
        Self {
            plan,
            subject_id: subject_id.to_string(),
            ledger: LedgerState::new(plan),
            next_index: 1,
            records: Vec::with_capacity(plan.trial_count as usize),
        }
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn is_done(&self) -> bool {
        self.next_index > self.plan.trial_count
    }

    /// Process the next trial. `None` once every trial has run.
    pub fn step(&mut self) -> Result<Option<TrialRecord>, ScheduleError> {
        if self.is_done() {
            return Ok(None);
        }
        let mut record = process_trial(self.plan, &mut self.ledger, self.next_index)?;
        record.subject_id = self.subject_id.clone();
        self.next_index += 1;
        self.records.push(record.clone());
        Ok(Some(record))
    }

    /// Consume the scheduler. Partial if stopped early.
    pub fn finish(self) -> RunOutcome {
        RunOutcome {
            records: self.records,
            ledger: self.ledger,
        }
    }
}
