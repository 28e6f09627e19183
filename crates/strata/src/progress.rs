//! Sync progress reporting.
//!
//! Renders [`SyncEvent`]s so users see what is being scanned, how much is
//! left, and when search is up to date. Progress goes to **stderr** so
//! stdout stays parseable for scripts.

use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use strata_core::events::{NoopSink, SyncEvent, SyncEventSink};

/// Human-friendly progress: `sync 3f2a9c  1,234 / 5,000 files`.
pub struct StderrProgress;

impl SyncEventSink for StderrProgress {
    fn emit(&self, event: &SyncEvent) {
        let line = match event {
            SyncEvent::Started {
                source_id,
                root,
                total,
            } => format!(
                "sync {}  {}  {} files\n",
                source_id,
                root,
                format_number(*total as u64)
            ),
            SyncEvent::Progress {
                source_id,
                processed,
                total,
            } => format!(
                "sync {}  {} / {} files\n",
                source_id,
                format_number(*processed as u64),
                format_number(*total as u64)
            ),
            SyncEvent::Completed { report } => format!(
                "sync {}  done in {} ms\n",
                report.source_id, report.duration_ms
            ),
            SyncEvent::Failed { source_id, error } => {
                format!("sync {}  failed: {}\n", source_id, error)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl SyncEventSink for JsonProgress {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Arc<dyn SyncEventSink> {
        match self {
            ProgressMode::Off => Arc::new(NoopSink),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("unknown progress mode '{}': use off, human or json", other),
        }
    }
}
