use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::protocol::Event;
use crate::{
    dispatch::{CallKind, PendingCalls, Registry},
    error::Error,
    value::Resolution,
};

/// Registry stand-in inside a worker: every named call is forwarded to the
/// parent as an `invoke` event and answered by a `callback` command.
#[derive(Default)]
pub struct RemoteRegistry {
    sync_names: RwLock<Vec<String>>,
    async_names: RwLock<Vec<String>>,
    pending: PendingCalls<String>,
    channel: RwLock<Option<UnboundedSender<Event>>>,
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_names(&self, sync_names: Vec<String>, async_names: Vec<String>) {
        *self.sync_names.write() = sync_names;
        *self.async_names.write() = async_names;
    }

    pub fn connect(&self, events: UnboundedSender<Event>) {
        *self.channel.write() = Some(events);
    }

    /// Stop forwarding and cancel every call still waiting for a callback.
    pub fn disconnect(&self) {
        self.channel.write().take();
        self.pending.clear();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.read().is_some()
    }

    /// Hand a callback from the parent to the call waiting on `id`.
    /// Returns `false` if nothing was waiting.
    pub fn deliver(&self, id: u64, args: String) -> bool {
        self.pending.complete(id, args)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait::async_trait]
impl Registry for RemoteRegistry {
    fn names(&self, kind: CallKind) -> Vec<String> {
        match kind {
            CallKind::Sync => self.sync_names.read().clone(),
            CallKind::Async => self.async_names.read().clone(),
        }
    }

    async fn call(&self, kind: CallKind, name: &str, args: Vec<Value>) -> Resolution {
        let events = self.channel.read().clone();
        let Some(events) = events else {
            return Resolution::error(&Error::HostFault("worker is not connected".to_string()));
        };
        let (id, rx) = self.pending.register();
        let invoke = Event::Invoke {
            id,
            kind,
            name: name.to_string(),
            args,
        };
        if events.send(invoke).is_err() {
            self.pending.cancel(id);
            return Resolution::error(&Error::HostFault("worker channel closed".to_string()));
        }
        match rx.await {
            Ok(text) => Resolution::decode(&text).unwrap_or_else(|err| Resolution::error(&err)),
            Err(_) => Resolution::error(&Error::HostFault(format!(
                "call to '{name}' was cancelled"
            ))),
        }
    }

    fn cancel_pending(&self) {
        self.pending.clear();
    }
}
