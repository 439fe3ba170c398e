//! End-to-end sessions on a paused clock with a scripted presenter.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use coin_task::coins::Coins;
use coin_task::config::SessionConfig;
use coin_task::events::MarkerRecorder;
use coin_task::output::{file_sha256, RecordMode, RunManifest};
use coin_task::plan::TrialPlan;
use coin_task::session::{run_session, CancelToken, Presenter};

/// Records every screen; optionally trips the token or fails on a trial.
#[derive(Default)]
struct Script {
    screens: Vec<String>,
    cancel_on_trial: Option<(u32, CancelToken)>,
    cancel_on_countdown: Option<(u32, CancelToken)>,
    fail_on_trial: Option<u32>,
}

#[async_trait]
impl Presenter for Script {
    async fn intro(&mut self, balance: Coins) -> Result<()> {
        self.screens.push(format!("intro {}", balance));
        Ok(())
    }

    async fn show_trial(&mut self, index: u32, stimulus: &str) -> Result<()> {
        if self.fail_on_trial == Some(index) {
            return Err(anyhow!("display lost"));
        }
        if let Some((at, token)) = &self.cancel_on_trial {
            if *at == index {
                token.cancel();
            }
        }
        self.screens.push(format!("trial {} {}", index, stimulus));
        Ok(())
    }

    async fn coin_cue(&mut self, index: u32) -> Result<()> {
        self.screens.push(format!("cue {}", index));
        Ok(())
    }

    async fn show_balance(&mut self, balance: Coins) -> Result<()> {
        self.screens.push(format!("balance {}", balance));
        Ok(())
    }

    async fn show_countdown(&mut self, index: u32, remaining: u32) -> Result<()> {
        if let Some((at, token)) = &self.cancel_on_countdown {
            if *at == index {
                token.cancel();
            }
        }
        self.screens.push(format!("countdown {} {}", index, remaining));
        Ok(())
    }

    async fn show_result(&mut self, index: u32, lost: bool) -> Result<()> {
        self.screens.push(format!("result {} {}", index, if lost { "lost" } else { "survived" }));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.screens.push("close".to_string());
        Ok(())
    }
}

fn config(root: &Path) -> SessionConfig {
    let mut cfg = SessionConfig::defaults("s07");
    cfg.plan = TrialPlan {
        trial_count: 6,
        trial_duration: 5.0,
        bonus_trials: [1, 2, 4, 5].into_iter().collect(),
        warning_trials: vec![3, 6],
        bonus_amount: Coins::from_cents(10),
        starting_balance: Coins::whole(5),
        forced_loss_warning_ordinal: 2,
    };
    cfg.timing.countdown_secs = 2;
    cfg.timing.result_hold = Duration::from_secs(1);
    let images = root.join("images");
    fs::create_dir_all(&images).unwrap();
    for name in ["b.png", "a.jpg", "readme.txt"] {
        File::create(images.join(name)).unwrap();
    }
    cfg.image_dir = images;
    cfg.out_dir = root.join("out");
    cfg.marker_path = cfg.out_dir.join("markers.jsonl");
    cfg
}

fn csv_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path).unwrap().lines().map(str::to_string).collect()
}

#[tokio::test(start_paused = true)]
async fn full_session_writes_every_trial() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut presenter = Script::default();
    let mut sink = MarkerRecorder::new();

    let report = run_session(&cfg, &mut presenter, &mut sink, &CancelToken::new())
        .await
        .unwrap();

    assert!(!report.early_exit);
    assert_eq!(report.records.len(), 6);
    assert_eq!(report.stimuli, vec!["a.jpg", "b.png", "placeholder", "placeholder", "placeholder", "placeholder"]);
    assert_eq!(report.ledger.balance, Coins::ZERO);

    let lines = csv_lines(&report.csv_path);
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[1], "s07,1,true,false,false,5.10,a.jpg");
    assert_eq!(lines[3], "s07,3,false,true,false,5.20,placeholder");
    assert_eq!(lines[6], "s07,6,false,true,true,0.00,placeholder");

    let labels = sink.labels();
    assert_eq!(labels.first().unwrap(), "start");
    assert_eq!(labels.last().unwrap(), "end");
    assert!(labels.contains(&"countdown_3_2".to_string()));
    assert!(labels.contains(&"countdown_3_0".to_string()));
    assert!(labels.contains(&"no_lose_3".to_string()));
    assert!(labels.contains(&"lost_6".to_string()));
    assert!(!labels.contains(&"early_exit".to_string()));

    assert!(presenter.screens.contains(&"result 6 lost".to_string()));
    assert!(presenter.screens.contains(&"balance 0.00".to_string()));
    assert_eq!(presenter.screens.last().unwrap(), "close");

    let manifest: RunManifest =
        serde_json::from_str(&fs::read_to_string(&report.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.completed_trials, 6);
    assert_eq!(manifest.planned_trials, 6);
    assert!(!manifest.early_exit);
    assert_eq!(manifest.interrupted_trial, None);
    assert_eq!(manifest.csv_sha256, file_sha256(&report.csv_path).unwrap());
}

#[tokio::test(start_paused = true)]
async fn session_paces_each_trial() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.plan.warning_trials = vec![3];
    cfg.plan.forced_loss_warning_ordinal = 1;
    let start = tokio::time::Instant::now();
    run_session(&cfg, &mut Script::default(), &mut MarkerRecorder::new(), &CancelToken::new())
        .await
        .unwrap();
    // Six 5 s trials; the warning trial's 3 s countdown + 1 s hold fit inside.
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(start.elapsed() < Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn cancellation_flushes_partial_log() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let cancel = CancelToken::new();
    let mut presenter = Script {
        cancel_on_trial: Some((4, cancel.clone())),
        ..Script::default()
    };
    let mut sink = MarkerRecorder::new();

    let report = run_session(&cfg, &mut presenter, &mut sink, &cancel).await.unwrap();

    assert!(report.early_exit);
    assert_eq!(report.records.len(), 4);
    // Cancelled during trial 4's coin cue.
    assert_eq!(report.interrupted_trial, Some(4));
    assert_eq!(csv_lines(&report.csv_path).len(), 5);
    let labels = sink.labels();
    assert_eq!(labels.last().unwrap(), "early_exit");
    assert!(!labels.contains(&"end".to_string()));
    assert!(!labels.contains(&"trial_shown_5".to_string()));
}

#[tokio::test(start_paused = true)]
async fn presenter_failure_still_writes_then_errors() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut presenter = Script {
        fail_on_trial: Some(2),
        ..Script::default()
    };
    let mut sink = MarkerRecorder::new();

    let result = run_session(&cfg, &mut presenter, &mut sink, &CancelToken::new()).await;
    assert!(result.is_err());
    assert_eq!(sink.labels().last().unwrap(), "early_exit");

    let out: Vec<_> = fs::read_dir(cfg.out_dir).unwrap().map(|e| e.unwrap().path()).collect();
    let csv = out
        .iter()
        .find(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .expect("partial csv written");
    // Trial 2 was processed before the screen failed.
    assert_eq!(csv_lines(csv).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_plan_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.plan.forced_loss_warning_ordinal = 5;
    let mut presenter = Script::default();
    let mut sink = MarkerRecorder::new();

    let result = run_session(&cfg, &mut presenter, &mut sink, &CancelToken::new()).await;
    assert!(result.is_err());
    assert!(sink.markers.is_empty());
    assert!(presenter.screens.is_empty());
    assert!(!cfg.out_dir.exists());
}

#[tokio::test(start_paused = true)]
async fn missing_images_use_placeholders_and_events_only_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.image_dir = dir.path().join("nowhere");
    cfg.placeholder = "blank.png".to_string();
    cfg.record_mode = RecordMode::EventsOnly;
    cfg.plan.bonus_trials = [1].into_iter().collect();

    let report = run_session(&cfg, &mut Script::default(), &mut MarkerRecorder::new(), &CancelToken::new())
        .await
        .unwrap();
    assert!(report.stimuli.iter().all(|s| s == "blank.png"));
    // Trial 1 (bonus only) and the two warnings.
    assert_eq!(report.rows_written, 3);
    let lines = csv_lines(&report.csv_path);
    assert_eq!(lines[1], "s07,1,true,false,false,5.10,blank.png");
}

#[tokio::test(start_paused = true)]
async fn cancel_during_loss_countdown_marks_trial_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let cancel = CancelToken::new();
    let mut presenter = Script {
        cancel_on_countdown: Some((6, cancel.clone())),
        ..Script::default()
    };
    let mut sink = MarkerRecorder::new();

    let report = run_session(&cfg, &mut presenter, &mut sink, &cancel).await.unwrap();

    assert!(report.early_exit);
    assert_eq!(report.records.len(), 6);
    // The ledger committed the loss, the subject never saw it.
    assert!(report.records[5].loss_triggered);
    assert!(!sink.labels().contains(&"lost_6".to_string()));
    assert!(!presenter.screens.contains(&"result 6 lost".to_string()));
    assert_eq!(report.interrupted_trial, Some(6));

    let manifest: RunManifest =
        serde_json::from_str(&fs::read_to_string(&report.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.interrupted_trial, Some(6));
    assert_eq!(manifest.completed_trials, 6);
}

#[tokio::test(start_paused = true)]
async fn unusable_out_dir_fails_before_anything_is_shown() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    fs::write(&cfg.out_dir, b"not a directory").unwrap();
    cfg.plan = TrialPlan::timed_protocol();
    let mut presenter = Script::default();
    let mut sink = MarkerRecorder::new();
    let start = tokio::time::Instant::now();

    let result = run_session(&cfg, &mut presenter, &mut sink, &CancelToken::new()).await;

    assert!(result.is_err());
    assert!(presenter.screens.is_empty());
    assert!(sink.markers.is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn trial_log_exists_with_header_once_session_starts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut presenter = Script {
        fail_on_trial: Some(1),
        ..Script::default()
    };

    let result = run_session(&cfg, &mut presenter, &mut MarkerRecorder::new(), &CancelToken::new()).await;
    assert!(result.is_err());

    let csv = fs::read_dir(&cfg.out_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .expect("trial log created");
    // Trial 1 was committed before its screen failed.
    assert_eq!(csv_lines(&csv).len(), 2);
    assert!(csv_lines(&csv)[0].starts_with("subject_number,"));
}
