use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use super::{ClusterConfig, cell::ResultCell};
use crate::{
    dispatch::{CallKind, Registry},
    error::{Error, Result},
    sandbox::Evaluation,
    worker::protocol::{self, Command, Event},
};

pub(super) type TaskCell = ResultCell<Result<Evaluation>>;

/// What the reader and writer tasks report about one worker.
#[derive(Debug)]
pub(super) enum WorkerEvent {
    Message(Event),
    /// The channel failed: a write error or an unreadable message.
    Error(String),
    /// The worker closed its output.
    Closed,
}

/// The part of a worker a running task talks to.
pub(super) struct WorkerChannel {
    pub(super) id: u64,
    pub(super) commands: UnboundedSender<Command>,
    pub(super) events: tokio::sync::Mutex<UnboundedReceiver<WorkerEvent>>,
}

struct WorkerRecord {
    id: u64,
    child: Child,
    channel: Arc<WorkerChannel>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
    cell: Option<Arc<TaskCell>>,
}

impl WorkerRecord {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn kill(mut self) {
        self.clear_timer();
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(worker = self.id, ?err, "worker already gone");
        }
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Configured pool size.
    pub size: usize,
    pub idle: usize,
    pub active: usize,
}

/// Worker membership. Every record is in exactly one of `idle` or `active`.
pub(super) struct Pool {
    config: Arc<ClusterConfig>,
    registry: Arc<dyn Registry>,
    idle: VecDeque<WorkerRecord>,
    active: HashMap<u64, WorkerRecord>,
    next_id: u64,
    running: bool,
    me: Weak<Mutex<Self>>,
}

impl Pool {
    pub(super) fn new(config: Arc<ClusterConfig>, registry: Arc<dyn Registry>) -> Arc<Mutex<Self>> {
        Arc::new_cyclic(|me| {
            Mutex::new(Self {
                config,
                registry,
                idle: VecDeque::new(),
                active: HashMap::new(),
                next_id: 1,
                running: false,
                me: me.clone(),
            })
        })
    }

    pub(super) const fn is_running(&self) -> bool {
        self.running
    }

    fn len(&self) -> usize {
        self.idle.len() + self.active.len()
    }

    pub(super) fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.config.workers,
            idle: self.idle.len(),
            active: self.active.len(),
        }
    }

    /// Spawn workers until the pool is back at its configured size.
    pub(super) fn ensure(&mut self) -> Result<()> {
        while self.running && self.len() < self.config.workers {
            let record = self.spawn()?;
            self.idle.push_back(record);
        }
        Ok(())
    }

    fn spawn(&mut self) -> Result<WorkerRecord> {
        let id = self.next_id;
        self.next_id += 1;

        let mut child = self.config.command().spawn().map_err(|err| {
            tracing::error!(
                worker = id,
                program = %self.config.program.display(),
                ?err,
                "failed to spawn worker"
            );
            Error::WorkerCrashed(format!("spawn: {err}"))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::WorkerCrashed("worker stdio is not piped".to_string()));
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_commands(stdin, command_rx, event_tx.clone()));
        let reader = tokio::spawn(read_events(id, stdout, event_tx, self.me.clone()));

        // Queued ahead of any task; the worker handles commands in order.
        let initialize = Command::Initialize {
            template: self.config.template.clone(),
            functions: self.registry.names(CallKind::Sync),
            async_functions: self.registry.names(CallKind::Async),
        };
        if command_tx.send(initialize).is_err() {
            return Err(Error::WorkerDisconnected);
        }

        tracing::debug!(worker = id, pid = ?child.id(), "spawned worker");
        Ok(WorkerRecord {
            id,
            child,
            channel: Arc::new(WorkerChannel {
                id,
                commands: command_tx,
                events: tokio::sync::Mutex::new(event_rx),
            }),
            reader,
            writer,
            timer: None,
            cell: None,
        })
    }

    /// Top up, then move the oldest idle worker to active on behalf of
    /// `cell`. `None` if no worker is idle yet.
    pub(super) fn pop(&mut self, cell: &Arc<TaskCell>) -> Result<Option<Arc<WorkerChannel>>> {
        self.ensure()?;
        let Some(mut record) = self.idle.pop_front() else {
            return Ok(None);
        };
        record.cell = Some(Arc::clone(cell));
        let channel = Arc::clone(&record.channel);
        self.active.insert(record.id, record);
        debug_assert_eq!(self.len(), self.config.workers);
        Ok(Some(channel))
    }

    /// Return a worker whose task completed to the idle set.
    pub(super) fn finish(&mut self, id: u64) {
        let Some(mut record) = self.active.remove(&id) else {
            return;
        };
        record.clear_timer();
        record.cell = None;
        if self.running {
            self.idle.push_back(record);
        } else {
            record.kill();
        }
    }

    /// Kill and forget a worker, then restore the pool size.
    pub(super) fn remove(&mut self, id: u64) {
        let record = match self.active.remove(&id) {
            Some(record) => record,
            None => match self.idle.iter().position(|r| r.id == id) {
                Some(index) => match self.idle.remove(index) {
                    Some(record) => record,
                    None => return,
                },
                None => return,
            },
        };
        tracing::debug!(worker = id, "removing worker");
        record.kill();
        if let Err(err) = self.ensure() {
            tracing::warn!(?err, "could not replace worker");
        }
    }

    /// Drop an idle worker whose channel closed.
    fn reap_idle(&mut self, id: u64) {
        if self.idle.iter().any(|r| r.id == id) {
            tracing::warn!(worker = id, "idle worker exited");
            self.remove(id);
        }
    }

    /// Kill the worker and fail its current task if it has not replied
    /// within `timeout`. Zero disables the timer.
    ///
    /// The timer is bound to the task the worker holds now, so a timer that
    /// fires after that task finished never touches a later one.
    pub(super) fn arm_timer(&mut self, id: u64, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let Some(cell) = self.active.get(&id).and_then(|r| r.cell.clone()) else {
            return;
        };
        let me = self.me.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(pool) = me.upgrade() else {
                return;
            };
            let mut pool = pool.lock();
            let Some(record) = pool
                .active
                .get_mut(&id)
                .filter(|r| r.cell.as_ref().is_some_and(|c| Arc::ptr_eq(c, &cell)))
            else {
                return;
            };
            // Dropping our own handle detaches it instead of aborting.
            record.timer.take();
            record.cell.take();
            if cell.resolve(Err(Error::Timeout(timeout))) {
                tracing::warn!(worker = id, ?timeout, "task timed out");
            }
            pool.remove(id);
        });
        match self.active.get_mut(&id) {
            Some(record) => record.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub(super) fn pids(&self) -> Vec<u32> {
        self.idle
            .iter()
            .chain(self.active.values())
            .filter_map(|r| r.child.id())
            .collect()
    }

    pub(super) fn start(&mut self) -> Result<()> {
        self.running = true;
        self.ensure()
    }

    /// Kill every worker. Tasks still running fail with
    /// [`Error::HostFault`].
    pub(super) fn shutdown(&mut self) {
        self.running = false;
        for (_, mut record) in self.active.drain() {
            if let Some(cell) = record.cell.take() {
                cell.resolve(Err(Error::HostFault("cluster was shut down".to_string())));
            }
            record.kill();
        }
        for record in self.idle.drain(..) {
            record.kill();
        }
    }
}

async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: UnboundedReceiver<Command>,
    events: UnboundedSender<WorkerEvent>,
) {
    while let Some(command) = commands.recv().await {
        let written = async {
            let line = protocol::encode_line(&command)?;
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            let _ = events.send(WorkerEvent::Error(err.to_string()));
            return;
        }
    }
}

async fn read_events(
    id: u64,
    stdout: ChildStdout,
    events: UnboundedSender<WorkerEvent>,
    pool: Weak<Mutex<Pool>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match protocol::decode_event(&line) {
                Ok(event) => {
                    if events.send(WorkerEvent::Message(event)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(worker = id, %err, "unreadable worker message");
                    let _ = events.send(WorkerEvent::Error(err.to_string()));
                    break;
                }
            },
            Ok(None) => {
                let _ = events.send(WorkerEvent::Closed);
                break;
            }
            Err(err) => {
                let _ = events.send(WorkerEvent::Error(err.to_string()));
                break;
            }
        }
    }
    if let Some(pool) = pool.upgrade() {
        pool.lock().reap_idle(id);
    }
}
