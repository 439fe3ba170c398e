use anyhow::{Context, Result};
use serde_json::json;

use coin_task::config::SessionConfig;
use coin_task::events::{LogSink, MarkerFile, Tee};
use coin_task::logging::{log, obj, v_str, Domain, Level};
use coin_task::session::{run_session, CancelToken, ConsolePresenter};

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = SessionConfig::from_env()?;
    // Subject id on the command line wins over SUBJECT_ID.
    if let Some(subject) = std::env::args().nth(1) {
        cfg.subject_id = subject;
    }

    let markers = MarkerFile::open(&cfg.marker_path)
        .with_context(|| format!("open marker stream {}", cfg.marker_path.display()))?;
    log(
        Level::Info,
        Domain::Marker,
        "stream_open",
        obj(&[("path", v_str(&cfg.marker_path.display().to_string()))]),
    );
    let mut sink = Tee(markers, LogSink);

    let cancel = CancelToken::with_kill_file(&cfg.kill_file);
    cancel.cancel_on_ctrl_c();

    let mut presenter = ConsolePresenter;
    let report = run_session(&cfg, &mut presenter, &mut sink, &cancel).await?;

    if sink.0.has_failed() {
        log(
            Level::Warn,
            Domain::Marker,
            "stream_incomplete",
            obj(&[("path", v_str(&cfg.marker_path.display().to_string()))]),
        );
    }
    log(
        Level::Info,
        Domain::Output,
        "written",
        obj(&[
            ("csv", v_str(&report.csv_path.display().to_string())),
            ("manifest", v_str(&report.manifest_path.display().to_string())),
            ("rows", json!(report.rows_written)),
            ("early_exit", json!(report.early_exit)),
            ("final_balance", v_str(&report.ledger.balance.to_string())),
        ]),
    );
    Ok(())
}
