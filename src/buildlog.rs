//! Append-only build log
//!
//! Every line a deployment emits is tagged with its build id and application
//! id. Sinks never fail: a sink that cannot store a line drops it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// One line of deployment output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildLogLine {
    pub build_id: String,
    pub application_id: String,
    pub line: String,
    pub time: DateTime<Utc>,
}

/// Destination for build log lines
pub trait BuildLogSink: Send + Sync {
    fn append(&self, line: BuildLogLine);
}

/// In-memory sink, used by the CLI summary and by tests
#[derive(Default)]
pub struct MemoryBuildLog {
    lines: Mutex<Vec<BuildLogLine>>,
}

impl MemoryBuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines of one build, oldest first
    pub fn lines(&self, build_id: &str) -> Vec<BuildLogLine> {
        let mut lines: Vec<_> = self
            .lines
            .lock()
            .iter()
            .filter(|l| l.build_id == build_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.time);
        lines
    }

    /// Just the text of one build's lines, oldest first
    pub fn text(&self, build_id: &str) -> Vec<String> {
        self.lines(build_id).into_iter().map(|l| l.line).collect()
    }
}

impl BuildLogSink for MemoryBuildLog {
    fn append(&self, line: BuildLogLine) {
        self.lines.lock().push(line);
    }
}

/// Sink that forwards lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBuildLog;

impl BuildLogSink for TracingBuildLog {
    fn append(&self, line: BuildLogLine) {
        info!(
            target: "build",
            build = %line.build_id,
            app = %line.application_id,
            "{}",
            line.line
        );
    }
}

/// Sink that writes to several sinks
pub struct FanoutBuildLog {
    sinks: Vec<Arc<dyn BuildLogSink>>,
}

impl FanoutBuildLog {
    pub fn new(sinks: Vec<Arc<dyn BuildLogSink>>) -> Self {
        Self { sinks }
    }
}

impl BuildLogSink for FanoutBuildLog {
    fn append(&self, line: BuildLogLine) {
        for sink in &self.sinks {
            sink.append(line.clone());
        }
    }
}

/// Identity of one deployment attempt plus the sink its lines go to
#[derive(Clone)]
pub struct BuildContext {
    pub build_id: String,
    pub application_id: String,
    sink: Arc<dyn BuildLogSink>,
}

impl BuildContext {
    pub fn new(build_id: &str, application_id: &str, sink: Arc<dyn BuildLogSink>) -> Self {
        Self {
            build_id: build_id.to_string(),
            application_id: application_id.to_string(),
            sink,
        }
    }

    /// Context with a fresh build id
    pub fn generate(application_id: &str, sink: Arc<dyn BuildLogSink>) -> Self {
        Self::new(&uuid::Uuid::new_v4().to_string(), application_id, sink)
    }

    pub fn log(&self, line: impl Into<String>) {
        self.sink.append(BuildLogLine {
            build_id: self.build_id.clone(),
            application_id: self.application_id.clone(),
            line: line.into(),
            time: Utc::now(),
        });
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("build_id", &self.build_id)
            .field("application_id", &self.application_id)
            .finish()
    }
}
