//! Sync markers for the physiological recording stream.
//!
//! The scheduler only knows the `MarkerSink` hook. Whatever forwards the
//! labels to recording hardware lives behind it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Marker {
    Start,
    TrialShown { index: u32 },
    Bonus { index: u32 },
    Alarm { index: u32 },
    Countdown { index: u32, remaining: u32 },
    Lost { index: u32 },
    NoLose { index: u32 },
    End,
    EarlyExit,
}

impl Marker {
    /// Label pushed on the stream, e.g. `alarm_4` or `countdown_4_10`.
    pub fn label(&self) -> String {
        match self {
            Marker::Start => "start".to_string(),
            Marker::TrialShown { index } => format!("trial_shown_{}", index),
            Marker::Bonus { index } => format!("bonus_{}", index),
            Marker::Alarm { index } => format!("alarm_{}", index),
            Marker::Countdown { index, remaining } => format!("countdown_{}_{}", index, remaining),
            Marker::Lost { index } => format!("lost_{}", index),
            Marker::NoLose { index } => format!("no_lose_{}", index),
            Marker::End => "end".to_string(),
            Marker::EarlyExit => "early_exit".to_string(),
        }
    }
}

pub trait MarkerSink {
    fn emit(&mut self, marker: &Marker);
}

impl<S: MarkerSink + ?Sized> MarkerSink for &mut S {
    fn emit(&mut self, marker: &Marker) {
        (**self).emit(marker)
    }
}

impl<S: MarkerSink + ?Sized> MarkerSink for Box<S> {
    fn emit(&mut self, marker: &Marker) {
        (**self).emit(marker)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MarkerSink for NullSink {
    fn emit(&mut self, _marker: &Marker) {}
}

/// Keeps every marker in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct MarkerRecorder {
    pub markers: Vec<Marker>,
}

impl MarkerRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.markers.iter().map(Marker::label).collect()
    }
}

impl MarkerSink for MarkerRecorder {
    fn emit(&mut self, marker: &Marker) {
        self.markers.push(*marker);
    }
}

/// Forwards markers into the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MarkerSink for LogSink {
    fn emit(&mut self, marker: &Marker) {
        log(Level::Debug, Domain::Marker, "marker", obj(&[("label", v_str(&marker.label()))]));
    }
}

/// Append-only JSONL marker file, one `{"ts","label"}` per line.
#[derive(Debug)]
pub struct MarkerFile {
    writer: BufWriter<File>,
    failed: bool,
}

impl MarkerFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            failed: false,
        })
    }

    /// True once any write has failed. Markers are best effort; the CSV is not.
    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

impl MarkerSink for MarkerFile {
    fn emit(&mut self, marker: &Marker) {
        let line = json!({
            "ts": chrono::Utc::now().timestamp_millis(),
            "label": marker.label(),
        });
        let result = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush());
        if let Err(err) = result {
            if !self.failed {
                log(
                    Level::Warn,
                    Domain::Marker,
                    "marker_write_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
            self.failed = true;
        }
    }
}

/// Fans one marker out to two sinks.
pub struct Tee<A, B>(pub A, pub B);

impl<A: MarkerSink, B: MarkerSink> MarkerSink for Tee<A, B> {
    fn emit(&mut self, marker: &Marker) {
        self.0.emit(marker);
        self.1.emit(marker);
    }
}
