//! Single-session lifecycle around one [`Engine`] instance.
//!
//! Typical flow:
//! 1. Register host functions on a [`FunctionRegistry`].
//! 2. Build a [`Sandbox`] from an engine and that registry.
//! 3. [`Sandbox::eval`] code, or drive [`Sandbox::initialize`],
//!    [`Sandbox::execute`] and [`Sandbox::finalize`] by hand.

mod output;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use output::{OutputEntry, OutputKind, SessionOutput};

use crate::{
    dispatch::{CallKind, Dispatcher, FunctionRegistry, Registry},
    engine::{Engine, render_bootstrap},
    error::{Error, Result},
    value::ScriptOutcome,
};

/// Result of one evaluation together with the console output it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub output: Vec<OutputEntry>,
}

pub struct Sandbox<E> {
    engine: E,
    registry: Arc<FunctionRegistry>,
    output: SessionOutput,
    dispatcher: Dispatcher,
    template: String,
}

impl<E: Engine> Sandbox<E> {
    pub fn new(engine: E, registry: FunctionRegistry) -> Self {
        let registry = Arc::new(registry);
        let output = SessionOutput::new();
        let dispatcher = Dispatcher::new(registry.clone(), output.clone());
        Self {
            engine,
            registry,
            output,
            dispatcher,
            template: String::new(),
        }
    }

    /// Code run after the registration shims on every initialize.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    #[cfg(feature = "request")]
    #[must_use]
    pub fn with_http(mut self, http: crate::request::HttpProxy) -> Self {
        self.dispatcher = self.dispatcher.with_http(http);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn output(&self) -> &SessionOutput {
        &self.output
    }

    /// Registration shims for every registered name, then the template.
    #[must_use]
    pub fn bootstrap(&self) -> String {
        render_bootstrap(
            &self.engine,
            &self.registry.names(CallKind::Sync),
            &self.registry.names(CallKind::Async),
            &self.template,
        )
    }

    /// Start a fresh context and run the bootstrap in it.
    ///
    /// Resolves with the template's value, or `null` if the engine produced
    /// no parseable result.
    ///
    /// # Errors
    /// Returns the error thrown by the template.
    pub async fn initialize(&mut self) -> Result<Value> {
        self.output.clear();
        let bootstrap = self.bootstrap();
        let text = self.engine.initialize(&bootstrap, &self.dispatcher).await;
        ScriptOutcome::parse(&text).map_or(Ok(Value::Null), ScriptOutcome::into_result)
    }

    /// Run `code` in the initialized context.
    ///
    /// # Errors
    /// Returns [`Error::NoResult`] if the engine produced nothing parseable,
    /// or the error the script threw.
    pub async fn execute(&mut self, code: &str) -> Result<Value> {
        let text = self.engine.execute(code, &self.dispatcher).await;
        let Some(outcome) = ScriptOutcome::parse(&text) else {
            tracing::debug!(%text, "engine returned no result");
            return Err(Error::NoResult);
        };
        outcome.into_result()
    }

    /// Tear down the context and drop any asynchronous call still pending.
    pub async fn finalize(&mut self) {
        self.engine.finalize(&self.dispatcher).await;
        self.registry.cancel_pending();
    }

    /// Initialize, execute `code`, finalize.
    ///
    /// # Errors
    /// Returns the first error raised by the template or by `code`.
    pub async fn eval(&mut self, code: &str) -> Result<Evaluation> {
        if let Err(err) = self.initialize().await {
            self.finalize().await;
            return Err(err);
        }
        let value = self.execute(code).await;
        self.finalize().await;
        Ok(Evaluation {
            value: value?,
            output: self.output.entries(),
        })
    }
}
