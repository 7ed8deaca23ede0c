//! Supervised pool of worker processes.
//!
//! A [`Cluster`] keeps a fixed number of workers alive, admits tasks in
//! submission order with at most one task per worker, and replaces any
//! worker that times out, crashes or disconnects.

mod cell;
mod config;
mod pool;
mod queue;
mod task;

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Weak},
};

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

pub use cell::ResultCell;
pub use config::ClusterConfig;
pub use pool::PoolStats;
pub use task::Task;

use self::{
    pool::{Pool, TaskCell, WorkerChannel, WorkerEvent},
    queue::TaskQueue,
};
use crate::{
    dispatch::{Registry, panic_message},
    error::{Error, Result},
    sandbox::Evaluation,
    value::Resolution,
    worker::protocol::{Command, Event},
};

#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ClusterConfig>,
    registry: Arc<dyn Registry>,
    pool: Arc<Mutex<Pool>>,
    queue: TaskQueue,
    signals: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.pool.lock().shutdown();
        if let Some(signals) = self.signals.lock().take() {
            signals.abort();
        }
    }
}

impl Cluster {
    /// Build the pool and start its workers. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns [`Error::WorkerCrashed`] if a worker cannot be spawned.
    pub fn new(config: ClusterConfig, registry: impl Registry) -> Result<Self> {
        let config = Arc::new(config);
        let registry: Arc<dyn Registry> = Arc::new(registry);
        let cluster = Self {
            inner: Arc::new(Inner {
                pool: Pool::new(Arc::clone(&config), Arc::clone(&registry)),
                queue: TaskQueue::new(config.workers),
                signals: Mutex::new(None),
                config,
                registry,
            }),
        };
        cluster.start()?;
        Ok(cluster)
    }

    /// Resume accepting tasks and top the pool up. Starting a running
    /// cluster only tops it up.
    ///
    /// # Errors
    /// Returns [`Error::WorkerCrashed`] if a worker cannot be spawned.
    pub fn start(&self) -> Result<()> {
        if self.inner.config.handle_signals {
            let mut signals = self.inner.signals.lock();
            if signals.is_none() {
                *signals = Some(tokio::spawn(listen_for_signals(Arc::downgrade(
                    &self.inner,
                ))));
            }
        }
        self.inner.pool.lock().start()
    }

    /// Kill every worker and fail queued and running tasks with
    /// [`Error::HostFault`]. Safe to call repeatedly; [`Cluster::start`]
    /// resumes.
    pub fn shutdown(&self) {
        self.inner.pool.lock().shutdown();
        self.inner.queue.rearm();
        self.inner.registry.cancel_pending();
        tracing::debug!("cluster shut down");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.pool.lock().is_running()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.lock().stats()
    }

    /// OS process ids of the live workers, idle ones first.
    #[must_use]
    pub fn worker_pids(&self) -> Vec<u32> {
        self.inner.pool.lock().pids()
    }

    /// Tasks holding a worker or about to.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.queue.in_flight()
    }

    #[must_use]
    pub fn registry(&self) -> &dyn Registry {
        &*self.inner.registry
    }

    /// Queue `task` and wait for its result.
    ///
    /// # Errors
    /// Returns [`Error::HostFault`] if the cluster is not running or shuts
    /// down first, [`Error::Timeout`] if the task overruns its timeout, a
    /// worker fault if the worker dies, or the error the script raised.
    pub async fn execute(&self, task: Task) -> Result<Evaluation> {
        if !self.is_running() {
            return Err(Error::HostFault("cluster is not running".to_string()));
        }
        let (cell, rx) = TaskCell::new();
        let slots = self.inner.queue.slots();
        tokio::spawn(run_task(Arc::clone(&self.inner), slots, task, cell));
        rx.await
            .unwrap_or_else(|_| Err(Error::HostFault("task was abandoned".to_string())))
    }
}

async fn run_task(
    inner: Arc<Inner>,
    slots: Arc<tokio::sync::Semaphore>,
    task: Task,
    cell: Arc<TaskCell>,
) {
    let Some(_permit) = TaskQueue::acquire(slots).await else {
        cell.resolve(Err(Error::HostFault("cluster was shut down".to_string())));
        return;
    };

    let channel = loop {
        let popped = {
            let mut pool = inner.pool.lock();
            if !pool.is_running() {
                drop(pool);
                cell.resolve(Err(Error::HostFault("cluster was shut down".to_string())));
                return;
            }
            pool.pop(&cell)
        };
        match popped {
            Ok(Some(channel)) => break channel,
            Ok(None) => tokio::task::yield_now().await,
            Err(err) => {
                cell.resolve(Err(err));
                return;
            }
        }
    };

    let _assignment = Assignment {
        inner: &inner,
        id: channel.id,
        cell: &cell,
    };
    drive(&inner, &channel, task, &cell).await;
}

/// Fails the task and discards its worker if driving it ends without a
/// resolution, including by panic or by the runtime dropping the task.
struct Assignment<'a> {
    inner: &'a Inner,
    id: u64,
    cell: &'a TaskCell,
}

impl Drop for Assignment<'_> {
    fn drop(&mut self) {
        let mut pool = self.inner.pool.lock();
        let abandoned = Error::WorkerCrashed("task ended without a result".to_string());
        if self.cell.resolve(Err(abandoned)) {
            tracing::error!(worker = self.id, "task ended without a result");
            pool.remove(self.id);
        }
    }
}

/// Send the task to its worker and relay host calls until the worker
/// answers or the task is resolved some other way.
async fn drive(inner: &Inner, channel: &WorkerChannel, task: Task, cell: &TaskCell) {
    let id = channel.id;
    let Task {
        code,
        timeout,
        globals,
        context,
    } = task;

    let execute = Command::Execute {
        code,
        globals: Value::Object(globals).to_string(),
        context: Value::Object(context).to_string(),
    };
    if channel.commands.send(execute).is_err() {
        fail(inner, id, cell, Error::WorkerDisconnected);
        return;
    }
    inner.pool.lock().arm_timer(id, timeout);

    let mut events = channel.events.lock().await;
    let mut calls = FuturesUnordered::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(WorkerEvent::Message(Event::Result { value, error, output })) => {
                    let outcome = match error {
                        Some(payload) => Err(payload.into()),
                        None => Ok(Evaluation { value, output }),
                    };
                    complete(inner, id, cell, outcome);
                    return;
                }
                Some(WorkerEvent::Message(Event::Ready { error })) => {
                    if let Some(error) = error {
                        tracing::warn!(worker = id, error = %error.message, "worker template failed");
                    }
                }
                Some(WorkerEvent::Message(Event::Invoke { id: call, kind, name, args })) => {
                    let registry = Arc::clone(&inner.registry);
                    calls.push(async move {
                        let resolution = AssertUnwindSafe(registry.call(kind, &name, args))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                let message = panic_message(panic.as_ref());
                                tracing::error!(worker = id, function = %name, panic = message, "host call panicked");
                                Resolution::error(&Error::HostFunction(format!(
                                    "host function '{name}' panicked: {message}"
                                )))
                            });
                        (call, resolution)
                    });
                }
                Some(WorkerEvent::Error(message)) => {
                    tracing::warn!(worker = id, %message, "worker channel error");
                    fail(inner, id, cell, Error::WorkerCrashed(message));
                    return;
                }
                Some(WorkerEvent::Closed) | None => {
                    fail(inner, id, cell, Error::WorkerDisconnected);
                    return;
                }
            },
            Some((call, resolution)) = calls.next(), if !calls.is_empty() => {
                let callback = Command::Callback { id: call, args: resolution.encode() };
                if channel.commands.send(callback).is_err() {
                    tracing::debug!(worker = id, call, "worker gone before callback");
                }
            }
        }
    }
}

/// Resolve and return the worker to idle as one step, so a racing timer
/// sees either a running task or an idle worker.
fn complete(inner: &Inner, id: u64, cell: &TaskCell, outcome: Result<Evaluation>) {
    let mut pool = inner.pool.lock();
    cell.resolve(outcome);
    pool.finish(id);
}

fn fail(inner: &Inner, id: u64, cell: &TaskCell, err: Error) {
    let mut pool = inner.pool.lock();
    cell.resolve(Err(err));
    pool.remove(id);
}

async fn listen_for_signals(inner: Weak<Inner>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::warn!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let code = tokio::select! {
        () = ctrl_c => 130,
        () = terminate => 143,
    };

    if let Some(inner) = inner.upgrade() {
        tracing::info!("termination signal received; shutting down workers");
        inner.pool.lock().shutdown();
        inner.queue.rearm();
    }
    std::process::exit(code);
}
