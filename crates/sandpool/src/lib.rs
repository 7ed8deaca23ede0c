pub mod cluster;
pub mod dispatch;
pub mod engine;
pub mod error;
#[cfg(feature = "request")]
pub mod request;
pub mod sandbox;
pub mod value;
pub mod worker;

/// Tracing target that mirrors script console output.
pub const TRACE_TARGET_SCRIPT: &str = "sandpool::script";

pub use cluster::{Cluster, ClusterConfig, PoolStats, Task};
pub use dispatch::{
    BoxError, CallKind, Completion, Dispatcher, FunctionRegistry, PendingCalls, Registry,
};
pub use engine::{Dispatch, Engine, Invocation};
pub use error::{Error, ErrorKind, ErrorPayload, Result};
pub use sandbox::{Evaluation, OutputEntry, OutputKind, Sandbox, SessionOutput};
pub use value::Resolution;
