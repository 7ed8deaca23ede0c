//! Worker side of the pool: one engine instance driven by commands read from
//! the parent.

pub mod protocol;
mod remote;

use std::{io, ops::ControlFlow, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

pub use protocol::{Command, Event};
pub use remote::RemoteRegistry;

use crate::{
    dispatch::{CallKind, Dispatcher, Registry},
    engine::{Engine, render_bootstrap},
    error::{Error, Result},
    sandbox::SessionOutput,
    value::ScriptOutcome,
};

pub struct Worker<E> {
    engine: E,
    initialized: bool,
    remote: Arc<RemoteRegistry>,
    output: SessionOutput,
    dispatcher: Dispatcher,
    events: UnboundedSender<Event>,
}

impl<E: Engine> Worker<E> {
    /// Events produced while handling commands are sent on `events`.
    pub fn new(engine: E, events: UnboundedSender<Event>) -> Self {
        let remote = Arc::new(RemoteRegistry::new());
        let output = SessionOutput::new();
        let dispatcher = Dispatcher::new(remote.clone(), output.clone());
        Self {
            engine,
            initialized: false,
            remote,
            output,
            dispatcher,
            events,
        }
    }

    #[cfg(feature = "request")]
    #[must_use]
    pub fn with_http(mut self, http: crate::request::HttpProxy) -> Self {
        self.dispatcher = self.dispatcher.with_http(http);
        self
    }

    #[must_use]
    pub fn remote(&self) -> Arc<RemoteRegistry> {
        Arc::clone(&self.remote)
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// # Errors
    /// Returns an error if the event channel to the parent is gone.
    pub async fn handle(&mut self, command: Command) -> Result<ControlFlow<()>> {
        match command {
            Command::Initialize {
                template,
                functions,
                async_functions,
            } => {
                self.remote.set_names(functions, async_functions);
                self.connect();
                let error = self.reset(true, &template).await;
                self.emit(Event::Ready { error })?;
            }
            Command::Execute {
                code,
                globals,
                context,
            } => {
                tracing::trace!(%context, "execute");
                self.connect();
                self.reset(false, "").await;
                self.output.clear();
                let script = format!("{}\n{code}", self.engine.assign_globals(&globals));
                let text = self.engine.execute(&script, &self.dispatcher).await;
                let event = match ScriptOutcome::parse(&text) {
                    Some(ScriptOutcome { value, error }) => Event::Result {
                        value,
                        error,
                        output: self.output.take(),
                    },
                    None => Event::Result {
                        value: serde_json::Value::Null,
                        error: Some(Error::NoResult.to_payload()),
                        output: self.output.take(),
                    },
                };
                self.emit(event)?;
            }
            Command::Callback { id, args } => {
                if !self.remote.deliver(id, args) {
                    tracing::debug!(id, "callback for unknown call");
                }
            }
            Command::Exit => {
                self.disconnect();
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Start a fresh engine context when forced or when none exists yet.
    /// Returns the error thrown by the bootstrap, if any.
    async fn reset(&mut self, force: bool, template: &str) -> Option<crate::ErrorPayload> {
        if !force && self.initialized {
            return None;
        }
        if self.initialized {
            self.engine.finalize(&self.dispatcher).await;
        }
        let bootstrap = render_bootstrap(
            &self.engine,
            &self.remote.names(CallKind::Sync),
            &self.remote.names(CallKind::Async),
            template,
        );
        let text = self.engine.initialize(&bootstrap, &self.dispatcher).await;
        self.initialized = true;
        ScriptOutcome::parse(&text).and_then(|outcome| outcome.error)
    }

    pub fn connect(&self) {
        if !self.remote.is_connected() {
            self.remote.connect(self.events.clone());
        }
    }

    pub fn disconnect(&self) {
        if self.remote.is_connected() {
            self.remote.disconnect();
        }
    }

    fn emit(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
    }
}

/// Drive `engine` with commands read from `input`, writing events to
/// `output`, until `exit` or end of input.
///
/// Callbacks are delivered as soon as they are read, so asynchronous calls
/// made by a running script can complete while it is still executing.
///
/// # Errors
/// Returns an error for an unknown or malformed command, or if either
/// stream fails.
pub async fn serve<E, R, W>(engine: E, input: R, output: W) -> Result<()>
where
    E: Engine,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_with(engine, input, output, std::convert::identity).await
}

/// Like [`serve`], with a hook to configure the [`Worker`] first.
///
/// # Errors
/// See [`serve`].
pub async fn serve_with<E, R, W, F>(engine: E, input: R, output: W, configure: F) -> Result<()>
where
    E: Engine,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Worker<E>) -> Worker<E>,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let mut worker = configure(Worker::new(engine, event_tx));

    let reader = tokio::spawn(read_commands(input, worker.remote(), command_tx));
    let writer = tokio::spawn(write_events(output, event_rx));

    let result = loop {
        let command = match command_rx.recv().await {
            None => break Ok(()),
            Some(Err(err)) => break Err(err),
            Some(Ok(command)) => command,
        };
        match worker.handle(command).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    // Dropping the last event sender lets the writer drain and finish.
    worker.disconnect();
    drop(worker);
    reader.abort();
    let written = writer
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?;
    result.and(written)
}

async fn read_commands<R: AsyncRead + Unpin>(
    input: R,
    remote: Arc<RemoteRegistry>,
    commands: UnboundedSender<Result<Command>>,
) {
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(err) => {
                let _ = commands.send(Err(err.into()));
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode_command(&line) {
            Ok(Command::Callback { id, args }) => {
                if !remote.deliver(id, args) {
                    tracing::debug!(id, "callback for unknown call");
                }
            }
            Ok(command) => {
                if commands.send(Ok(command)).is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::error!(%err, "invalid command");
                let _ = commands.send(Err(err));
                return;
            }
        }
    }
}

async fn write_events<W: AsyncWrite + Unpin>(
    mut output: W,
    mut events: UnboundedReceiver<Event>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        let line = protocol::encode_line(&event)?;
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}
