//! Boundary to the isolation engine that actually runs script code.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::dispatch::CallKind;

/// One capability call trapped by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Correlation token, unique within one engine context.
    pub id: u64,
    pub name: String,
    /// Argument list as JSON text.
    pub args: String,
}

/// Reply path for trapped capability calls. The future resolves to the
/// encoded resolution array.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, invocation: Invocation) -> BoxFuture<'_, String>;
}

impl<T: Dispatch + ?Sized> Dispatch for Arc<T> {
    fn dispatch(&self, invocation: Invocation) -> BoxFuture<'_, String> {
        (**self).dispatch(invocation)
    }
}

/// An isolated script context.
///
/// Every method that runs code returns result text of the form
/// `{"value": V}` or `{"error": {"message": M}}`. Anything else is treated
/// as "no result" by the caller.
#[async_trait::async_trait]
pub trait Engine: Send + 'static {
    /// Discard any previous context and run `bootstrap` in a fresh one.
    async fn initialize(&mut self, bootstrap: &str, dispatch: &dyn Dispatch) -> String;

    /// Run `code` in the current context.
    async fn execute(&mut self, code: &str, dispatch: &dyn Dispatch) -> String;

    /// Release the current context. Safe to call at any time.
    async fn finalize(&mut self, dispatch: &dyn Dispatch);

    /// Source for the shim that makes a host function named `name`
    /// callable from script code.
    fn declare(&self, kind: CallKind, name: &str) -> String;

    /// Source that assigns each entry of a JSON object into script scope.
    fn assign_globals(&self, globals: &str) -> String;
}

/// Registration shims for every name, followed by the template.
pub fn render_bootstrap<E: Engine + ?Sized>(
    engine: &E,
    sync_names: &[String],
    async_names: &[String],
    template: &str,
) -> String {
    let mut out = String::new();
    let shims = sync_names
        .iter()
        .map(|n| (CallKind::Sync, n))
        .chain(async_names.iter().map(|n| (CallKind::Async, n)));
    for (kind, name) in shims {
        out.push_str(&engine.declare(kind, name));
        out.push('\n');
    }
    out.push_str(template);
    out
}
