use std::time::Duration;

use serde_json::{Map, Value};

/// One unit of code submitted to a [`Cluster`](super::Cluster).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub code: String,
    /// Zero means unbounded.
    pub timeout: Duration,
    /// Assigned into script scope before `code` runs.
    pub globals: Map<String, Value>,
    /// Passed through to the worker untouched.
    pub context: Map<String, Value>,
}

impl Task {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_context(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }
}
