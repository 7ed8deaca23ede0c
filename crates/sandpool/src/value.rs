//! Serialization helpers shared by the engine boundary and the worker
//! channel. Everything crossing either boundary is JSON text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorPayload};

/// Parse JSON text, treating any failure as absent.
#[must_use]
pub fn try_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// Answer to one invocation: an error slot followed by zero or more result
/// values. Encoded as the JSON array `[error|null, ...results]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub error: Option<ErrorPayload>,
    pub results: Vec<Value>,
}

impl Resolution {
    /// No error and no value. Used by side-effect capabilities.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            error: None,
            results: Vec::new(),
        }
    }

    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            error: None,
            results: vec![value],
        }
    }

    #[must_use]
    pub const fn values(results: Vec<Value>) -> Self {
        Self {
            error: None,
            results,
        }
    }

    #[must_use]
    pub fn error(error: &Error) -> Self {
        Self {
            error: Some(error.to_payload()),
            results: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let mut items = Vec::with_capacity(self.results.len() + 1);
        items.push(
            self.error
                .as_ref()
                .and_then(|e| serde_json::to_value(e).ok())
                .unwrap_or(Value::Null),
        );
        items.extend(self.results.iter().cloned());
        Value::Array(items).to_string()
    }

    /// # Errors
    /// Returns [`Error::Protocol`] if `text` is not a resolution array.
    pub fn decode(text: &str) -> Result<Self, Error> {
        let Some(Value::Array(mut items)) = try_parse(text) else {
            return Err(Error::Protocol(format!("malformed resolution: {text}")));
        };
        if items.is_empty() {
            return Ok(Self::empty());
        }
        let error = match items.remove(0) {
            Value::Null => None,
            Value::String(message) => Some(ErrorPayload::new(message)),
            other => Some(
                serde_json::from_value(other)
                    .map_err(|e| Error::Protocol(format!("malformed error slot: {e}")))?,
            ),
        };
        Ok(Self {
            error,
            results: items,
        })
    }

    /// # Errors
    /// Returns the error slot converted into an [`Error`].
    pub fn into_result(self) -> Result<Vec<Value>, Error> {
        match self.error {
            Some(payload) => Err(payload.into()),
            None => Ok(self.results),
        }
    }
}

/// Result text produced by an engine for one run: `{"value": V}` or
/// `{"error": {"message": M}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ScriptOutcome {
    #[must_use]
    pub const fn ok(value: Value) -> Self {
        Self { value, error: None }
    }

    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            error: Some(ErrorPayload::new(message)),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Parse engine result text. `None` when the engine produced nothing
    /// usable.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match try_parse(text)? {
            value @ Value::Object(_) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    /// # Errors
    /// Returns the script's error, if it raised one.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(payload) => Err(payload.into()),
            None => Ok(self.value),
        }
    }
}
