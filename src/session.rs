//! Session driver: paces the scheduler in real time, drives the presenter,
//! emits sync markers and flushes the trial log, also on early exit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use crate::coins::Coins;
use crate::config::SessionConfig;
use crate::events::{Marker, MarkerSink};
use crate::ledger::{LedgerState, Scheduler, TrialRecord};
use crate::logging::{self, log, obj, v_str, Domain, Level};
use crate::output::{self, RunManifest, TrialLog};
use crate::stimuli;

/// Screen and sound side of a session. Implementations draw, play cues,
/// and may block; the driver owns all pacing.
#[async_trait]
pub trait Presenter: Send {
    async fn intro(&mut self, balance: Coins) -> Result<()>;
    async fn show_trial(&mut self, index: u32, stimulus: &str) -> Result<()>;
    /// Coin sound, played slightly ahead of the balance update.
    async fn coin_cue(&mut self, index: u32) -> Result<()>;
    async fn show_balance(&mut self, balance: Coins) -> Result<()>;
    async fn show_countdown(&mut self, index: u32, remaining: u32) -> Result<()>;
    async fn show_result(&mut self, index: u32, lost: bool) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Headless presenter: every screen becomes a log line.
#[derive(Debug, Default)]
pub struct ConsolePresenter;

fn screen(event: &str, fields: &[(&str, serde_json::Value)]) {
    log(Level::Info, Domain::Screen, event, obj(fields));
}

#[async_trait]
impl Presenter for ConsolePresenter {
    async fn intro(&mut self, balance: Coins) -> Result<()> {
        screen("intro", &[("text", v_str(&format!("Bonus: {} Shekels", balance)))]);
        Ok(())
    }

    async fn show_trial(&mut self, index: u32, stimulus: &str) -> Result<()> {
        screen("stimulus", &[("trial", json!(index)), ("image", v_str(stimulus))]);
        Ok(())
    }

    async fn coin_cue(&mut self, index: u32) -> Result<()> {
        screen("coin_cue", &[("trial", json!(index))]);
        Ok(())
    }

    async fn show_balance(&mut self, balance: Coins) -> Result<()> {
        screen("balance", &[("text", v_str(&format!("Bonus: {} Shekels", balance)))]);
        Ok(())
    }

    async fn show_countdown(&mut self, index: u32, remaining: u32) -> Result<()> {
        log(
            Level::Debug,
            Domain::Screen,
            "countdown",
            obj(&[
                ("trial", json!(index)),
                ("text", v_str(&format!("Time remaining: {} sec", remaining))),
            ]),
        );
        Ok(())
    }

    async fn show_result(&mut self, index: u32, lost: bool) -> Result<()> {
        let text = if lost { "YOU LOST ALL YOUR COINS!" } else { "YOU SURVIVED THIS ROUND!" };
        screen("result", &[("trial", json!(index)), ("text", v_str(text))]);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared stop flag. Also trips when the kill file exists.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    kill_file: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_file(path: &Path) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            kill_file: Some(path.to_path_buf()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.kill_file {
            Some(path) if path.exists() => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// Trip the token on Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log(Level::Warn, Domain::Session, "ctrl_c", obj(&[]));
                token.cancel();
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

/// Sleep for `total`, checking `cancel` every `poll`.
async fn wait(total: Duration, poll: Duration, cancel: &CancelToken) -> Flow {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Flow::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Flow::Continue;
        }
        let slice = if poll.is_zero() { deadline - now } else { poll.min(deadline - now) };
        sleep(slice).await;
    }
}

macro_rules! pace {
    ($wait:expr) => {
        if $wait.await == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
    };
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub subject_id: String,
    pub records: Vec<TrialRecord>,
    /// Stimulus shown on trial `i` at position `i - 1`.
    pub stimuli: Vec<String>,
    pub ledger: LedgerState,
    pub early_exit: bool,
    pub rows_written: usize,
    pub interrupted_trial: Option<u32>,
    pub csv_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub async fn run_session<P, S>(
    cfg: &SessionConfig,
    presenter: &mut P,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<SessionReport>
where
    P: Presenter + ?Sized,
    S: MarkerSink + ?Sized,
{
    if let Err(err) = cfg.plan.validate() {
        log(
            Level::Error,
            Domain::Schedule,
            "plan_rejected",
            obj(&[("error", v_str(&err.to_string()))]),
        );
        return Err(err).context("session not started");
    }

    let started = Utc::now();
    let trial_log = match TrialLog::create(
        &cfg.out_dir.join(output::csv_filename(&cfg.subject_id, started)),
        cfg.record_mode,
    ) {
        Ok(opened) => opened,
        Err(err) => {
            log(
                Level::Error,
                Domain::Output,
                "trial_log_unavailable",
                obj(&[("error", v_str(&format!("{:#}", err)))]),
            );
            return Err(err).context("session not started");
        }
    };
    let csv_path = trial_log.path().to_path_buf();
    let stimuli = load_stimuli(cfg);
    let clock = Instant::now();

    log(
        Level::Info,
        Domain::Session,
        "session_start",
        obj(&[
            ("subject_id", v_str(&cfg.subject_id)),
            ("trials", json!(cfg.plan.trial_count)),
            ("trial_secs", json!(cfg.plan.trial_duration)),
            ("csv", v_str(&csv_path.display().to_string())),
        ]),
    );

    let mut scheduler = Scheduler::new(&cfg.plan, &cfg.subject_id);
    sink.emit(&Marker::Start);
    let mut interrupted = None;
    let driven = match presenter.intro(cfg.plan.starting_balance).await {
        Ok(()) => drive(cfg, &stimuli, &mut scheduler, presenter, sink, cancel, &mut interrupted).await,
        Err(err) => Err(err),
    };

    let early_exit = !matches!(driven, Ok(Flow::Continue));
    if early_exit {
        sink.emit(&Marker::EarlyExit);
        log(
            Level::Warn,
            Domain::Session,
            "early_exit",
            obj(&[
                ("completed", json!(scheduler.records().len())),
                ("interrupted_trial", json!(interrupted)),
                (
                    "reason",
                    v_str(match &driven {
                        Err(_) => "presenter_error",
                        _ => "cancelled",
                    }),
                ),
            ]),
        );
    } else {
        sink.emit(&Marker::End);
    }
    if let Err(err) = presenter.close().await {
        log(Level::Warn, Domain::Screen, "close_failed", obj(&[("error", v_str(&err.to_string()))]));
    }

    let outcome = scheduler.finish();
    let rows_written = trial_log.finish(&outcome.records, &stimuli)?;
    let manifest_path = output::manifest_path(&csv_path);
    let manifest = RunManifest {
        subject_id: cfg.subject_id.clone(),
        started_at: started.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        planned_trials: cfg.plan.trial_count,
        completed_trials: outcome.records.len() as u32,
        early_exit,
        record_mode: cfg.record_mode,
        rows_written,
        interrupted_trial: interrupted,
        final_balance: outcome.ledger.balance,
        log_run_id: logging::run_id().to_string(),
        csv_path: csv_path.display().to_string(),
        csv_sha256: output::file_sha256(&csv_path)?,
    };
    output::write_manifest(&manifest_path, &manifest)?;

    logging::log_session_summary(
        &cfg.subject_id,
        cfg.plan.trial_count,
        outcome.records.len() as u32,
        early_exit,
        &outcome.ledger.balance.to_string(),
        clock.elapsed().as_secs_f64(),
    );

    driven.context("presentation failed; partial trial log written")?;

    Ok(SessionReport {
        subject_id: cfg.subject_id.clone(),
        records: outcome.records,
        stimuli,
        ledger: outcome.ledger,
        early_exit,
        rows_written,
        interrupted_trial: interrupted,
        csv_path,
        manifest_path,
    })
}

fn load_stimuli(cfg: &SessionConfig) -> Vec<String> {
    let found = match stimuli::list_images(&cfg.image_dir) {
        Ok(list) => list,
        Err(err) => {
            log(
                Level::Warn,
                Domain::Stimulus,
                "image_dir_unavailable",
                obj(&[
                    ("msg", v_str("using placeholders")),
                    ("dir", v_str(&cfg.image_dir.display().to_string())),
                    ("error", v_str(&format!("{:#}", err))),
                ]),
            );
            Vec::new()
        }
    };
    if (found.len() as u64) < cfg.plan.trial_count as u64 {
        log(
            Level::Warn,
            Domain::Stimulus,
            "padding_stimuli",
            obj(&[
                ("found", json!(found.len())),
                ("needed", json!(cfg.plan.trial_count)),
                ("placeholder", v_str(&cfg.placeholder)),
            ]),
        );
    }
    stimuli::fit_to_trials(found, cfg.plan.trial_count, &cfg.placeholder)
}

async fn drive<P, S>(
    cfg: &SessionConfig,
    stimuli: &[String],
    scheduler: &mut Scheduler<'_>,
    presenter: &mut P,
    sink: &mut S,
    cancel: &CancelToken,
    interrupted: &mut Option<u32>,
) -> Result<Flow>
where
    P: Presenter + ?Sized,
    S: MarkerSink + ?Sized,
{
    let timing = &cfg.timing;
    let trial_duration = cfg.trial_duration();

    while !scheduler.is_done() {
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        let trial_started = Instant::now();
        let record = match scheduler.step()? {
            Some(record) => record,
            None => break,
        };
        let index = record.trial_index;
        // Open until every screen of this trial has been shown.
        *interrupted = Some(index);
        let stimulus = stimuli
            .get(index as usize - 1)
            .map(String::as_str)
            .unwrap_or(cfg.placeholder.as_str());
        logging::log_trial(&record, stimulus);

        presenter.show_trial(index, stimulus).await?;
        sink.emit(&Marker::TrialShown { index });

        if record.bonus_awarded {
            presenter.coin_cue(index).await?;
            pace!(wait(timing.cue_lead, timing.poll, cancel));
            presenter.show_balance(record.balance_after).await?;
            sink.emit(&Marker::Bonus { index });
        }

        if record.warning_raised {
            sink.emit(&Marker::Alarm { index });
            for remaining in (0..=timing.countdown_secs).rev() {
                presenter.show_countdown(index, remaining).await?;
                sink.emit(&Marker::Countdown { index, remaining });
                pace!(wait(Duration::from_secs(1), timing.poll, cancel));
            }
            presenter.show_result(index, record.loss_triggered).await?;
            if record.loss_triggered {
                sink.emit(&Marker::Lost { index });
                presenter.show_balance(record.balance_after).await?;
            } else {
                sink.emit(&Marker::NoLose { index });
            }
            pace!(wait(timing.result_hold, timing.poll, cancel));
        }

        *interrupted = None;
        let left = trial_duration.saturating_sub(trial_started.elapsed());
        pace!(wait(left, timing.poll, cancel));
    }
    Ok(Flow::Continue)
}
