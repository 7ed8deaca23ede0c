//! A small line-oriented script language for exercising `sandpool` end to
//! end.
//!
//! One statement per line; blank lines and `#` comments are skipped.
//!
//! ```text
//! declare sync add            # route `call add` through dispatchSync
//! globals {"x": 1}            # merge an object into scope
//! let sum = call add [$x, 2]  # bind the first result of a call
//! all fetch [[1], [2]]        # concurrent calls, array of results
//! call log ["sum is", $sum]   # any other target is a raw capability
//! sleep 10
//! throw "bad input"
//! return $sum
//! abort                       # kill the process
//! ```
//!
//! The result of a run is the value of `return`, or of the last expression
//! statement.

mod parse;

use std::{collections::HashMap, time::Duration};

use futures::future::join_all;
use sandpool::{
    CallKind, Dispatch, Engine, ErrorPayload, Invocation, Resolution,
    dispatch::{DISPATCH_ASYNC, DISPATCH_SYNC},
    value::ScriptOutcome,
};
use serde_json::{Map, Value};

pub use parse::ParseError;
use parse::{Expr, Statement};

enum Flow {
    Next(Value),
    Return(Value),
}

#[derive(Debug, Default)]
pub struct ScriptEngine {
    vars: Map<String, Value>,
    declared: HashMap<String, CallKind>,
    next_call: u64,
}

impl ScriptEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.vars.clear();
        self.declared.clear();
    }

    async fn run(&mut self, code: &str, dispatch: &dyn Dispatch) -> String {
        let mut last = Value::Null;
        for (index, line) in code.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let statement = match parse::statement(line) {
                Ok(statement) => statement,
                Err(err) => {
                    return ScriptOutcome::err(format!("line {}: {err}", index + 1)).encode();
                }
            };
            match self.exec(statement, dispatch).await {
                Ok(Flow::Next(value)) => last = value,
                Ok(Flow::Return(value)) => return ScriptOutcome::ok(value).encode(),
                Err(error) => {
                    return ScriptOutcome {
                        value: Value::Null,
                        error: Some(error),
                    }
                    .encode();
                }
            }
        }
        ScriptOutcome::ok(last).encode()
    }

    async fn exec(
        &mut self,
        statement: Statement,
        dispatch: &dyn Dispatch,
    ) -> Result<Flow, ErrorPayload> {
        match statement {
            Statement::Declare(kind, name) => {
                self.declared.insert(name, kind);
                Ok(Flow::Next(Value::Null))
            }
            Statement::Globals(expr) => match self.eval(expr, dispatch).await? {
                Value::Object(globals) => {
                    self.vars.extend(globals);
                    Ok(Flow::Next(Value::Null))
                }
                Value::Null => Ok(Flow::Next(Value::Null)),
                other => Err(ErrorPayload::new(format!(
                    "globals must be an object, got {other}"
                ))),
            },
            Statement::Let(name, expr) => {
                let value = self.eval(expr, dispatch).await?;
                self.vars.insert(name, value);
                Ok(Flow::Next(Value::Null))
            }
            Statement::Expr(expr) => Ok(Flow::Next(self.eval(expr, dispatch).await?)),
            Statement::Return(None) => Ok(Flow::Return(Value::Null)),
            Statement::Return(Some(expr)) => Ok(Flow::Return(self.eval(expr, dispatch).await?)),
            Statement::Throw(expr) => Err(thrown(self.eval(expr, dispatch).await?)),
            Statement::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Flow::Next(Value::Null))
            }
            Statement::Abort => {
                tracing::warn!("script requested abort");
                std::process::abort()
            }
        }
    }

    async fn eval(&mut self, expr: Expr, dispatch: &dyn Dispatch) -> Result<Value, ErrorPayload> {
        match expr {
            Expr::Literal(text) => self.literal(&text),
            Expr::Call { target, args } => {
                let Value::Array(args) = self.literal(&args)? else {
                    return Err(ErrorPayload::new("call arguments must be a list"));
                };
                let invocation = self.invocation(&target, args);
                call(dispatch, invocation).await
            }
            Expr::All { target, args } => {
                let Value::Array(lists) = self.literal(&args)? else {
                    return Err(ErrorPayload::new("all expects a list of argument lists"));
                };
                let mut invocations = Vec::with_capacity(lists.len());
                for list in lists {
                    let Value::Array(args) = list else {
                        return Err(ErrorPayload::new("all expects a list of argument lists"));
                    };
                    invocations.push(self.invocation(&target, args));
                }
                let results = join_all(invocations.into_iter().map(|i| call(dispatch, i))).await;
                results.into_iter().collect::<Result<Vec<_>, _>>().map(Value::Array)
            }
        }
    }

    fn literal(&self, text: &str) -> Result<Value, ErrorPayload> {
        parse::literal(text, &self.vars).map_err(|err| ErrorPayload::new(err.to_string()))
    }

    /// Declared names go through the registry capabilities; anything else is
    /// invoked as a capability by name.
    fn invocation(&mut self, target: &str, mut args: Vec<Value>) -> Invocation {
        self.next_call += 1;
        let name = match self.declared.get(target) {
            Some(kind) => {
                args.insert(0, Value::String(target.to_string()));
                match kind {
                    CallKind::Sync => DISPATCH_SYNC,
                    CallKind::Async => DISPATCH_ASYNC,
                }
            }
            None => target,
        };
        Invocation {
            id: self.next_call,
            name: name.to_string(),
            args: Value::Array(args).to_string(),
        }
    }
}

async fn call(dispatch: &dyn Dispatch, invocation: Invocation) -> Result<Value, ErrorPayload> {
    let text = dispatch.dispatch(invocation).await;
    let resolution = Resolution::decode(&text).map_err(|err| err.to_payload())?;
    if let Some(error) = resolution.error {
        return Err(error);
    }
    let mut results = resolution.results;
    Ok(match results.len() {
        0 => Value::Null,
        1 => results.remove(0),
        _ => Value::Array(results),
    })
}

fn thrown(value: Value) -> ErrorPayload {
    match value {
        Value::String(message) => ErrorPayload::new(message),
        Value::Object(ref map) => match map.get("message") {
            Some(Value::String(message)) => ErrorPayload::new(message.clone()),
            _ => ErrorPayload::new(value.to_string()),
        },
        other => ErrorPayload::new(other.to_string()),
    }
}

#[async_trait::async_trait]
impl Engine for ScriptEngine {
    async fn initialize(&mut self, bootstrap: &str, dispatch: &dyn Dispatch) -> String {
        self.reset();
        self.run(bootstrap, dispatch).await
    }

    async fn execute(&mut self, code: &str, dispatch: &dyn Dispatch) -> String {
        self.run(code, dispatch).await
    }

    async fn finalize(&mut self, _dispatch: &dyn Dispatch) {
        self.reset();
    }

    fn declare(&self, kind: CallKind, name: &str) -> String {
        format!("declare {} {name}", kind.as_str())
    }

    fn assign_globals(&self, globals: &str) -> String {
        format!("globals {globals}")
    }
}
