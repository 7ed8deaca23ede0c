use std::{sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TRACE_TARGET_SCRIPT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Log,
    Error,
}

/// One line of script console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub time: SystemTime,
    pub message: String,
}

/// Console output captured for one session. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct SessionOutput {
    entries: Arc<Mutex<Vec<OutputEntry>>>,
}

impl SessionOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry built from `args` and mirror it to tracing.
    pub fn write(&self, kind: OutputKind, args: &[Value]) {
        let message = format_message(args);
        match kind {
            OutputKind::Log => tracing::info!(target: TRACE_TARGET_SCRIPT, "{message}"),
            OutputKind::Error => tracing::warn!(target: TRACE_TARGET_SCRIPT, "{message}"),
        }
        self.entries.lock().push(OutputEntry {
            kind,
            time: SystemTime::now(),
            message,
        });
    }

    #[must_use]
    pub fn entries(&self) -> Vec<OutputEntry> {
        self.entries.lock().clone()
    }

    /// Remove and return everything captured so far.
    #[must_use]
    pub fn take(&self) -> Vec<OutputEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Strings verbatim, everything else as compact JSON, space separated.
fn format_message(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match arg {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    out
}
