//! Progress sinks and formatting helpers.
//!
//! Sinks are purely observational: they receive phase and status events and
//! never influence control flow.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::{ProgressSink, StatusLevel};

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn start_phase(&self, _name: &str, _total: u64) {}
    fn update(&self, _current: u64, _status: &str, _bytes: Option<u64>) {}
    fn complete_phase(&self, _summary: &str) {}
    fn status(&self, _message: &str, _level: StatusLevel) {}
}

/// Sink that forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn start_phase(&self, name: &str, _total: u64) {
        info!("phase started: {}", name);
    }

    fn update(&self, current: u64, status: &str, bytes: Option<u64>) {
        match bytes {
            Some(b) => tracing::debug!("{} [{}] ({})", status, current, format_bytes(b)),
            None => tracing::debug!("{} [{}]", status, current),
        }
    }

    fn complete_phase(&self, summary: &str) {
        info!("phase complete: {}", summary);
    }

    fn status(&self, message: &str, level: StatusLevel) {
        match level {
            StatusLevel::Info | StatusLevel::Success => info!("{}", message),
            StatusLevel::Warn => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }
    }
}

/// One JSON progress line.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ProgressEvent<'a> {
    PhaseStart {
        name: &'a str,
        total: u64,
    },
    Update {
        current: u64,
        status: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<u64>,
    },
    PhaseComplete {
        summary: &'a str,
    },
    Status {
        message: &'a str,
        level: StatusLevel,
    },
}

#[derive(Serialize)]
struct ProgressLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: ProgressEvent<'a>,
}

/// Sink that writes one JSON object per event, one per line.
pub struct JsonProgress {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonProgress {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// JSON lines on stderr.
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    fn emit(&self, event: ProgressEvent<'_>) {
        let line = ProgressLine {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        match serde_json::to_string(&line) {
            Ok(json) => {
                let mut out = self.out.lock();
                if let Err(e) = writeln!(out, "{}", json) {
                    warn!("failed to write progress: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize progress: {}", e),
        }
    }
}

impl ProgressSink for JsonProgress {
    fn start_phase(&self, name: &str, total: u64) {
        self.emit(ProgressEvent::PhaseStart { name, total });
    }

    fn update(&self, current: u64, status: &str, bytes: Option<u64>) {
        self.emit(ProgressEvent::Update {
            current,
            status,
            bytes,
        });
    }

    fn complete_phase(&self, summary: &str) {
        self.emit(ProgressEvent::PhaseComplete { summary });
    }

    fn status(&self, message: &str, level: StatusLevel) {
        self.emit(ProgressEvent::Status { message, level });
    }
}

/// Prefixes every phase name and message with an operation id.
pub struct ScopedProgress {
    scope: String,
    inner: Arc<dyn ProgressSink>,
}

impl ScopedProgress {
    pub fn new(scope: impl Into<String>, inner: Arc<dyn ProgressSink>) -> Self {
        Self {
            scope: scope.into(),
            inner,
        }
    }
}

impl ProgressSink for ScopedProgress {
    fn start_phase(&self, name: &str, total: u64) {
        self.inner
            .start_phase(&format!("[{}] {}", self.scope, name), total);
    }

    fn update(&self, current: u64, status: &str, bytes: Option<u64>) {
        self.inner
            .update(current, &format!("[{}] {}", self.scope, status), bytes);
    }

    fn complete_phase(&self, summary: &str) {
        self.inner
            .complete_phase(&format!("[{}] {}", self.scope, summary));
    }

    fn status(&self, message: &str, level: StatusLevel) {
        self.inner
            .status(&format!("[{}] {}", self.scope, message), level);
    }
}

/// Human-readable byte size, e.g. `1.50 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Human-readable duration, e.g. `1h 2m 3s`, `2m 5s`, `850ms`.
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis() as u64;
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}.{:01}s", s, (ms % 1000) / 100)
    }
}
