//! Structured run events.
//!
//! Every lifecycle event is appended to `logs.jsonl` as
//! `{ts, level, run_id, event, module, msg, extra}` and mirrored to
//! `tracing` for console output. Write failures never take the run down.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

pub struct EventLogger {
    run_id: String,
    sink: Option<Mutex<BufWriter<File>>>,
}

impl EventLogger {
    pub fn new(run_id: impl Into<String>, log_path: Option<&Path>) -> std::io::Result<Self> {
        let sink = match log_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };
        Ok(Self {
            run_id: run_id.into(),
            sink,
        })
    }

    /// Console-only logger (tests, cleanup command).
    pub fn disabled() -> Self {
        Self {
            run_id: "n/a".to_string(),
            sink: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn info(&self, event: &str, module: &str, msg: &str, extra: Value) {
        self.log(EventLevel::Info, event, module, msg, extra);
    }

    pub fn warn(&self, event: &str, module: &str, msg: &str, extra: Value) {
        self.log(EventLevel::Warn, event, module, msg, extra);
    }

    pub fn error(&self, event: &str, module: &str, msg: &str, extra: Value) {
        self.log(EventLevel::Error, event, module, msg, extra);
    }

    pub fn log(&self, level: EventLevel, event: &str, module: &str, msg: &str, extra: Value) {
        match level {
            EventLevel::Info => info!(event, module, %extra, "{msg}"),
            EventLevel::Warn => warn!(event, module, %extra, "{msg}"),
            EventLevel::Error => error!(event, module, %extra, "{msg}"),
        }

        let Some(sink) = &self.sink else {
            return;
        };
        let record = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "level": level.as_str(),
            "run_id": self.run_id,
            "event": event,
            "module": module,
            "msg": msg,
            "extra": extra,
        });
        let mut writer = sink.lock();
        let _ = writeln!(writer, "{record}");
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.jsonl");
        let logger = EventLogger::new("run_x", Some(&path)).unwrap();
        logger.info("stage_start", "runner", "Stage started", json!({"stage": "universe"}));
        logger.warn("stage_timeout_warning", "runner", "deadline", json!({}));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "stage_start");
        assert_eq!(first["run_id"], "run_x");
        assert_eq!(first["level"], "INFO");
        assert_eq!(first["extra"]["stage"], "universe");
        assert!(first["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = EventLogger::disabled();
        logger.error("x", "y", "z", json!({}));
    }
}
