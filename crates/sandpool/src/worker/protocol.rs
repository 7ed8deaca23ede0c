//! Newline-delimited JSON messages exchanged with a worker process.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    dispatch::CallKind,
    error::{Error, ErrorPayload},
    sandbox::OutputEntry,
};

/// Parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Initialize {
        #[serde(default)]
        template: String,
        #[serde(default)]
        functions: Vec<String>,
        #[serde(default)]
        async_functions: Vec<String>,
    },
    Execute {
        code: String,
        /// JSON object text.
        #[serde(default = "empty_object")]
        globals: String,
        /// JSON object text, passed through untouched.
        #[serde(default = "empty_object")]
        context: String,
    },
    Callback {
        id: u64,
        /// Encoded resolution array.
        args: String,
    },
    Exit,
}

/// Worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Ready {
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    Invoke {
        id: u64,
        kind: CallKind,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Result {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<ErrorPayload>,
        #[serde(default)]
        output: Vec<OutputEntry>,
    },
}

fn empty_object() -> String {
    "{}".to_string()
}

/// One message plus the trailing newline.
///
/// # Errors
/// Returns an error if the message cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> std::io::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// # Errors
/// Returns [`Error::Protocol`] for anything that is not a known command.
pub fn decode_command(line: &str) -> Result<Command, Error> {
    decode(line)
}

/// # Errors
/// Returns [`Error::Protocol`] for anything that is not a known event.
pub fn decode_event(line: &str) -> Result<Event, Error> {
    decode(line)
}

fn decode<T: DeserializeOwned>(line: &str) -> Result<T, Error> {
    serde_json::from_str(line.trim_end()).map_err(|e| Error::Protocol(format!("{e}: {line}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Command, Event, decode_command, decode_event, encode_line};
    use crate::{dispatch::CallKind, error::ErrorKind};

    #[test]
    fn wire_shape() {
        let line = encode_line(&Command::Callback {
            id: 7,
            args: "[null,5]".to_string(),
        })
        .expect("encode");
        assert_eq!(line, "{\"type\":\"callback\",\"id\":7,\"args\":\"[null,5]\"}\n");

        let line = encode_line(&Command::Exit).expect("encode");
        assert_eq!(line, "{\"type\":\"exit\"}\n");
    }

    #[test]
    fn execute_defaults_to_empty_scopes() {
        let command = decode_command(r#"{"type":"execute","code":"return 1"}"#).expect("decode");
        assert_eq!(
            command,
            Command::Execute {
                code: "return 1".to_string(),
                globals: "{}".to_string(),
                context: "{}".to_string(),
            }
        );
    }

    #[test]
    fn invoke_event() {
        let event = decode_event(
            r#"{"type":"invoke","id":3,"kind":"async","name":"fetch","args":[1,"a"]}"#,
        )
        .expect("decode");
        assert_eq!(
            event,
            Event::Invoke {
                id: 3,
                kind: CallKind::Async,
                name: "fetch".to_string(),
                args: vec![json!(1), json!("a")],
            }
        );
    }

    #[test]
    fn unknown_messages_are_protocol_errors() {
        let err = decode_command(r#"{"type":"reboot"}"#).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let err = decode_event("not json").expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
