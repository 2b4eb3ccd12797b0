use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::{Map, Value};

use crate::now_utc_iso;

pub type EventPayload = Map<String, Value>;

/// Append-only writer for an exercise's `events.jsonl`.
///
/// Every line carries `type`, `run_id` and `ts`, then the writer's scope
/// fields, then the caller payload (later keys win). Clones share one file lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    log: Arc<RunLog>,
    scope: EventPayload,
}

#[derive(Debug)]
struct RunLog {
    path: PathBuf,
    run_id: String,
    append_lock: Mutex<()>,
}

impl RunLog {
    fn append(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let _held = self
            .append_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        let log = RunLog {
            path: path.into(),
            run_id: run_id.into(),
            append_lock: Mutex::new(()),
        };
        Self {
            log: Arc::new(log),
            scope: EventPayload::new(),
        }
    }

    /// Returns a writer that adds `key` to every event it emits.
    pub fn scoped(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut scope = self.scope.clone();
        scope.insert(key.to_string(), value.into());
        Self {
            log: Arc::clone(&self.log),
            scope,
        }
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn run_id(&self) -> &str {
        &self.log.run_id
    }

    fn compose(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".into(), event_type.into());
        event.insert("run_id".into(), self.log.run_id.as_str().into());
        event.insert("ts".into(), now_utc_iso().into());
        event.extend(self.scope.clone());
        event.extend(payload);
        event
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = Value::Object(self.compose(event_type, payload));
        self.log.append(&serde_json::to_string(&event)?)?;
        Ok(event)
    }
}
