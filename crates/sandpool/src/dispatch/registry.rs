use std::{
    any::Any,
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::pending::PendingCalls;
use crate::{error::Error, value::Resolution};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type SyncFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(Vec<Value>, Completion) + Send + Sync>;

type AsyncOutcome = Result<Vec<Value>, BoxError>;

/// Which registry a named host function lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Sync,
    Async,
}

impl CallKind {
    /// Capability name a script uses to reach this registry.
    #[must_use]
    pub const fn capability(self) -> &'static str {
        match self {
            Self::Sync => super::DISPATCH_SYNC,
            Self::Async => super::DISPATCH_ASYNC,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Source of named host functions for `dispatchSync` / `dispatchAsync`.
#[async_trait::async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Names registered under `kind`, in a stable order.
    fn names(&self, kind: CallKind) -> Vec<String>;

    /// Resolve one named call. Lookup misses and host failures are reported
    /// in the returned resolution, never raised.
    async fn call(&self, kind: CallKind, name: &str, args: Vec<Value>) -> Resolution;

    /// Drop every call still waiting for a completion.
    fn cancel_pending(&self) {}
}

#[async_trait::async_trait]
impl<T: Registry + ?Sized> Registry for Arc<T> {
    fn names(&self, kind: CallKind) -> Vec<String> {
        (**self).names(kind)
    }

    async fn call(&self, kind: CallKind, name: &str, args: Vec<Value>) -> Resolution {
        (**self).call(kind, name, args).await
    }

    fn cancel_pending(&self) {
        (**self).cancel_pending();
    }
}

/// Completion handle given to asynchronous host functions.
///
/// Consumed by [`Completion::finish`], so a call resolves at most once.
/// Dropping it unfinished cancels the call.
pub struct Completion {
    id: u64,
    pending: Arc<PendingCalls<AsyncOutcome>>,
}

impl Completion {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn finish(self, result: Result<Vec<Value>, BoxError>) {
        self.pending.complete(self.id, result);
    }

    pub fn ok(self, value: Value) {
        self.finish(Ok(vec![value]));
    }

    pub fn fail(self, err: impl Into<BoxError>) {
        self.finish(Err(err.into()));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// Host functions callable from scripts.
///
/// Cloning copies the function tables but gives the clone its own
/// correlation table, so one registry can seed many independent sessions.
#[derive(Default)]
pub struct FunctionRegistry {
    sync_fns: RwLock<BTreeMap<String, SyncFn>>,
    async_fns: RwLock<BTreeMap<String, AsyncFn>>,
    pending: Arc<PendingCalls<AsyncOutcome>>,
}

impl Clone for FunctionRegistry {
    fn clone(&self) -> Self {
        Self {
            sync_fns: RwLock::new(self.sync_fns.read().clone()),
            async_fns: RwLock::new(self.async_fns.read().clone()),
            pending: Arc::default(),
        }
    }
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous host function. Replaces any previous
    /// definition with the same name.
    pub fn define<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Vec<Value>) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.sync_fns.write().insert(name.into(), Arc::new(f));
        self
    }

    /// Register an asynchronous host function. The call resolves when the
    /// supplied [`Completion`] is finished.
    pub fn define_async<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Vec<Value>, Completion) + Send + Sync + 'static,
    {
        self.async_fns.write().insert(name.into(), Arc::new(f));
        self
    }

    /// Number of asynchronous calls still waiting for their completion.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn call_sync(&self, name: &str, args: Vec<Value>) -> Resolution {
        let f = self.sync_fns.read().get(name).cloned();
        let Some(f) = f else {
            return Resolution::error(&Error::unknown_function(name));
        };
        match catch_unwind(AssertUnwindSafe(|| f(args))) {
            Ok(Ok(value)) => Resolution::value(value),
            Ok(Err(err)) => Resolution::error(&Error::HostFunction(err.to_string())),
            Err(panic) => Resolution::error(&host_panic(name, panic.as_ref())),
        }
    }

    async fn call_async(&self, name: &str, args: Vec<Value>) -> Resolution {
        let f = self.async_fns.read().get(name).cloned();
        let Some(f) = f else {
            return Resolution::error(&Error::unknown_function(name));
        };
        let (id, rx) = self.pending.register();
        let done = Completion {
            id,
            pending: Arc::clone(&self.pending),
        };
        // A panic drops the completion, which removes the pending slot.
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(args, done))) {
            return Resolution::error(&host_panic(name, panic.as_ref()));
        }
        match rx.await {
            Ok(Ok(results)) => Resolution::values(results),
            Ok(Err(err)) => Resolution::error(&Error::HostFunction(err.to_string())),
            Err(_) => Resolution::error(&Error::HostFault(format!(
                "asynchronous function '{name}' was cancelled"
            ))),
        }
    }
}

/// Text carried by a panic payload, if it is a string.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

fn host_panic(name: &str, panic: &(dyn Any + Send)) -> Error {
    let message = panic_message(panic);
    tracing::error!(function = name, panic = message, "host function panicked");
    Error::HostFunction(format!("host function '{name}' panicked: {message}"))
}

#[async_trait::async_trait]
impl Registry for FunctionRegistry {
    fn names(&self, kind: CallKind) -> Vec<String> {
        match kind {
            CallKind::Sync => self.sync_fns.read().keys().cloned().collect(),
            CallKind::Async => self.async_fns.read().keys().cloned().collect(),
        }
    }

    async fn call(&self, kind: CallKind, name: &str, args: Vec<Value>) -> Resolution {
        match kind {
            CallKind::Sync => self.call_sync(name, args),
            CallKind::Async => self.call_async(name, args).await,
        }
    }

    fn cancel_pending(&self) {
        let dropped = self.pending.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "cancelled pending asynchronous calls");
        }
    }
}
