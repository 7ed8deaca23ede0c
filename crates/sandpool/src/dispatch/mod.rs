//! Resolution of capability calls trapped inside a running script.

mod pending;
mod registry;

use std::sync::Arc;

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;

pub use pending::PendingCalls;
pub use registry::{AsyncFn, BoxError, CallKind, Completion, FunctionRegistry, Registry, SyncFn};
pub(crate) use registry::panic_message;

use crate::{
    engine::{Dispatch, Invocation},
    error::Error,
    sandbox::{OutputKind, SessionOutput},
    value::{Resolution, try_parse},
};

pub const DISPATCH_SYNC: &str = "dispatchSync";
pub const DISPATCH_ASYNC: &str = "dispatchAsync";
pub const HTTP_REQUEST: &str = "httpRequest";
pub const LOG: &str = "log";
pub const ERROR: &str = "error";

/// Routes each [`Invocation`] to the registry, the HTTP proxy or the
/// session output.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn Registry>,
    output: SessionOutput,
    #[cfg(feature = "request")]
    http: crate::request::HttpProxy,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn Registry>, output: SessionOutput) -> Self {
        Self {
            registry,
            output,
            #[cfg(feature = "request")]
            http: crate::request::HttpProxy::default(),
        }
    }

    #[cfg(feature = "request")]
    #[must_use]
    pub fn with_http(mut self, http: crate::request::HttpProxy) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub const fn output(&self) -> &SessionOutput {
        &self.output
    }

    /// Resolve one invocation. Every failure is reported in the returned
    /// resolution.
    pub async fn resolve(&self, invocation: &Invocation) -> Resolution {
        let args = match parse_args(&invocation.args) {
            Ok(args) => args,
            Err(err) => {
                tracing::debug!(name = %invocation.name, %err, "rejected invocation");
                return Resolution::error(&err);
            }
        };

        match invocation.name.as_str() {
            DISPATCH_SYNC => self.call(CallKind::Sync, args).await,
            DISPATCH_ASYNC => self.call(CallKind::Async, args).await,
            LOG => {
                self.output.write(OutputKind::Log, &args);
                Resolution::empty()
            }
            ERROR => {
                self.output.write(OutputKind::Error, &args);
                Resolution::empty()
            }
            HTTP_REQUEST => self.http_request(args).await,
            _ => Resolution::empty(),
        }
    }

    async fn call(&self, kind: CallKind, mut args: Vec<Value>) -> Resolution {
        let name = match args.first() {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(other) => return Resolution::error(&Error::unknown_function(&other.to_string())),
            None => return Resolution::error(&Error::unknown_function("")),
        };
        args.remove(0);
        self.registry.call(kind, &name, args).await
    }

    #[cfg(feature = "request")]
    async fn http_request(&self, args: Vec<Value>) -> Resolution {
        let options = args.into_iter().next().unwrap_or(Value::Null);
        self.http.send(options).await
    }

    #[cfg(not(feature = "request"))]
    #[allow(clippy::unused_async)]
    async fn http_request(&self, _args: Vec<Value>) -> Resolution {
        Resolution::error(&Error::HostFault(
            "outbound HTTP is not available in this build".to_string(),
        ))
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&self, invocation: Invocation) -> BoxFuture<'_, String> {
        async move { self.resolve(&invocation).await.encode() }.boxed()
    }
}

fn parse_args(text: &str) -> Result<Vec<Value>, Error> {
    match try_parse(text) {
        Some(Value::Array(args)) => Ok(args),
        Some(other) => Err(Error::invalid_invocation(format_args!(
            "expected an argument list, got {other}"
        ))),
        None => Err(Error::invalid_invocation(format_args!(
            "not valid JSON: {text}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::{Value, json};

    use super::{Dispatcher, FunctionRegistry};
    use crate::{
        engine::Invocation,
        error::ErrorKind,
        sandbox::{OutputKind, SessionOutput},
        value::Resolution,
    };

    fn invocation(name: &str, args: &str) -> Invocation {
        Invocation {
            id: 1,
            name: name.to_string(),
            args: args.to_string(),
        }
    }

    fn dispatcher(registry: FunctionRegistry) -> Dispatcher {
        Dispatcher::new(Arc::new(registry), SessionOutput::new())
    }

    #[tokio::test]
    async fn unknown_sync_name() {
        let d = dispatcher(FunctionRegistry::new());
        let resolution = d.resolve(&invocation("dispatchSync", r#"["nope"]"#)).await;
        let err = resolution.into_result().expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
    }

    #[tokio::test]
    async fn sync_function_sums() {
        let registry = FunctionRegistry::new();
        registry.define("add", |args| {
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        let d = dispatcher(registry);

        let encoded = d
            .resolve(&invocation("dispatchSync", r#"["add", 2, 3]"#))
            .await
            .encode();
        assert_eq!(encoded, "[null,5]");
    }

    #[tokio::test]
    async fn malformed_args_never_reach_the_function() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = FunctionRegistry::new();
        let counter = Arc::clone(&calls);
        registry.define("add", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let d = dispatcher(registry);

        for args in ["[\"add\", 2", "{\"name\": \"add\"}"] {
            let err = d
                .resolve(&invocation("dispatchSync", args))
                .await
                .into_result()
                .expect_err("invalid");
            assert_eq!(err.kind(), ErrorKind::InvalidInvocation);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_capability_is_a_no_op() {
        let d = dispatcher(FunctionRegistry::new());
        let resolution = d.resolve(&invocation("somethingNew", "[1]")).await;
        assert_eq!(resolution, Resolution::empty());
        assert_eq!(resolution.encode(), "[null]");
    }

    #[tokio::test]
    async fn log_and_error_are_captured() {
        let d = dispatcher(FunctionRegistry::new());
        assert_eq!(
            d.resolve(&invocation("log", r#"["hello", 1]"#)).await,
            Resolution::empty()
        );
        d.resolve(&invocation("error", r#"[{"a": 1}]"#)).await;

        let entries = d.output().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, OutputKind::Log);
        assert_eq!(entries[0].message, "hello 1");
        assert_eq!(entries[1].kind, OutputKind::Error);
        assert_eq!(entries[1].message, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn async_calls_resolve_independently() {
        let registry = FunctionRegistry::new();
        registry.define_async("echo", |args, done| {
            let value = args.into_iter().next().unwrap_or(Value::Null);
            tokio::spawn(async move {
                let delay = value.as_u64().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                done.ok(value);
            });
        });
        let d = dispatcher(registry);

        let slow = invocation("dispatchAsync", r#"["echo", 30]"#);
        let fast = invocation("dispatchAsync", r#"["echo", 1]"#);
        let (slow, fast) = tokio::join!(d.resolve(&slow), d.resolve(&fast));
        assert_eq!(slow.encode(), "[null,30]");
        assert_eq!(fast.encode(), "[null,1]");
    }

    #[tokio::test]
    async fn host_errors_fill_the_error_slot() {
        let registry = FunctionRegistry::new();
        registry.define("fail", |_| Err("disk on fire".into()));
        registry.define_async("fail_later", |_, done| done.fail("not today"));
        let d = dispatcher(registry);

        let err = d
            .resolve(&invocation("dispatchSync", r#"["fail"]"#))
            .await
            .into_result()
            .expect_err("sync failure");
        assert_eq!(err.kind(), ErrorKind::HostFunction);
        assert_eq!(err.to_string(), "disk on fire");

        let err = d
            .resolve(&invocation("dispatchAsync", r#"["fail_later"]"#))
            .await
            .into_result()
            .expect_err("async failure");
        assert_eq!(err.kind(), ErrorKind::HostFunction);
    }
}
