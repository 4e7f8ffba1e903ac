//! Generic socket shell over an attach/detach/send policy
//!
//! A logical socket owns any number of endpoints, one per connected bridge
//! address, and delegates distribution decisions to its policy. Endpoint
//! lifecycle events arrive on a channel and are applied by a pump task;
//! user-facing calls mutate the same state behind a mutex, so nothing here
//! holds a lock across an await.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use haltalk_core::Message;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, EndpointEvent, EndpointHandle, EndpointId, EndpointState};
use crate::transport::Connector;

#[derive(Error, Debug)]
pub enum SendError {
    /// No endpoint attached; the caller sees this synchronously
    #[error("no endpoint attached")]
    NotReady,
    /// The socket personality is receive-only
    #[error("socket is receive-only")]
    Unsupported,
    /// The endpoint task is gone
    #[error("endpoint {0} is gone")]
    EndpointGone(EndpointId),
}

/// One fully reassembled inbound message
#[derive(Debug)]
pub struct Inbound {
    /// Endpoint the message arrived on. Messages from different endpoints
    /// are causally independent.
    pub endpoint: EndpointId,
    pub message: Message,
}

/// Write surface the policies operate on
pub(crate) struct EndpointRegistry {
    entries: HashMap<EndpointId, RegistryEntry>,
}

struct RegistryEntry {
    handle: EndpointHandle,
    state: EndpointState,
}

impl EndpointRegistry {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Write one frame through an endpoint
    pub(crate) fn write(
        &mut self,
        id: EndpointId,
        frame: &str,
        more: bool,
    ) -> Result<(), SendError> {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.handle.write(frame, more),
            None => Err(SendError::EndpointGone(id)),
        }
    }
}

/// Capability set a concrete socket personality supplies
pub(crate) trait SocketPolicy: Send + 'static {
    /// An endpoint became active; returns true when the socket just became
    /// writable. Runs before any other outbound traffic can reach the
    /// endpoint, so replay-on-attach frames go out first.
    fn attach(&mut self, id: EndpointId, registry: &mut EndpointRegistry) -> bool;

    /// An endpoint was lost
    fn detach(&mut self, id: EndpointId);

    /// Submit one outbound frame
    fn send(
        &mut self,
        frame: &str,
        more: bool,
        registry: &mut EndpointRegistry,
    ) -> Result<(), SendError>;

    /// Whether outbound capacity exists
    fn has_out(&self) -> bool;
}

pub(crate) struct SocketCore<P> {
    policy: P,
    registry: EndpointRegistry,
    next_id: u64,
    connector: Arc<dyn Connector>,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
    inbound_tx: Option<mpsc::UnboundedSender<Inbound>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    reconnect_delay: Duration,
}

/// Generic socket over a [`SocketPolicy`]; cloning shares the socket
pub(crate) struct SocketBase<P: SocketPolicy> {
    inner: Arc<Mutex<SocketCore<P>>>,
}

impl<P: SocketPolicy> Clone for SocketBase<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: SocketPolicy> SocketBase<P> {
    pub(crate) fn new(connector: Arc<dyn Connector>, policy: P, reconnect_delay: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(SocketCore {
            policy,
            registry: EndpointRegistry::new(),
            next_id: 0,
            connector,
            events_tx,
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            reconnect_delay,
        }));
        tokio::spawn(pump(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    /// Open one endpoint to `address`. The endpoint reconnects on loss until
    /// `disconnect` or `close`.
    pub(crate) fn connect(&self, address: &str) -> EndpointId {
        let mut core = self.inner.lock();
        core.next_id += 1;
        let id = EndpointId(core.next_id);
        let handle = Endpoint::spawn(
            id,
            address.to_string(),
            core.connector.clone(),
            core.events_tx.clone(),
            core.reconnect_delay,
        );
        core.registry.entries.insert(
            id,
            RegistryEntry {
                handle,
                state: EndpointState::Connecting,
            },
        );
        debug!(endpoint = %id, address = %address, "Endpoint created");
        id
    }

    /// Close every endpoint opened for `address` and cancel their
    /// reconnects; returns how many endpoints were closed.
    pub(crate) fn disconnect(&self, address: &str) -> usize {
        let mut core = self.inner.lock();
        let ids: Vec<EndpointId> = core
            .registry
            .entries
            .iter()
            .filter(|(_, entry)| entry.handle.address() == address)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = core.registry.entries.remove(id) {
                entry.handle.close();
            }
            core.policy.detach(*id);
        }
        debug!(address = %address, closed = ids.len(), "Disconnected");
        ids.len()
    }

    /// Tear down all endpoints and end the inbound stream
    pub(crate) fn close(&self) {
        let mut core = self.inner.lock();
        let ids: Vec<EndpointId> = core.registry.entries.keys().copied().collect();
        for id in ids {
            if let Some(entry) = core.registry.entries.remove(&id) {
                entry.handle.close();
            }
            core.policy.detach(id);
        }
        core.inbound_tx = None;
    }

    /// The stream of fully reassembled inbound messages. Single consumer;
    /// only the first call yields the receiver.
    pub(crate) fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inner.lock().inbound_rx.take()
    }

    /// Send the frames of one complete message through the policy
    pub(crate) fn send_frames(&self, message: &Message) -> Result<(), SendError> {
        let mut core = self.inner.lock();
        let core = &mut *core;
        let count = message.frames.len();
        for (i, frame) in message.frames.iter().enumerate() {
            let more = i + 1 < count;
            core.policy.send(frame, more, &mut core.registry)?;
        }
        Ok(())
    }

    pub(crate) fn has_out(&self) -> bool {
        self.inner.lock().policy.has_out()
    }

    /// Socket-level connection state: active if any endpoint is active,
    /// connecting if any endpoint exists, closed otherwise.
    pub(crate) fn state(&self) -> EndpointState {
        let core = self.inner.lock();
        let mut state = EndpointState::Closed;
        for entry in core.registry.entries.values() {
            match entry.state {
                EndpointState::Active => return EndpointState::Active,
                EndpointState::Connecting => state = EndpointState::Connecting,
                EndpointState::Closed => {}
            }
        }
        state
    }

    /// Number of endpoints currently active
    pub(crate) fn active_endpoints(&self) -> usize {
        self.inner
            .lock()
            .registry
            .entries
            .values()
            .filter(|entry| entry.state == EndpointState::Active)
            .count()
    }

    /// Run a closure against the policy and write surface
    pub(crate) fn with_policy<R>(
        &self,
        f: impl FnOnce(&mut P, &mut EndpointRegistry) -> R,
    ) -> R {
        let mut core = self.inner.lock();
        let core = &mut *core;
        f(&mut core.policy, &mut core.registry)
    }
}

async fn pump<P: SocketPolicy>(
    inner: Weak<Mutex<SocketCore<P>>>,
    mut events_rx: mpsc::UnboundedReceiver<EndpointEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut core = inner.lock();
        let core = &mut *core;
        match event {
            EndpointEvent::Activated(id) => {
                // Disconnected while the open was in flight: the entry is
                // gone and the endpoint never gets attached
                let Some(entry) = core.registry.entries.get_mut(&id) else {
                    continue;
                };
                entry.state = EndpointState::Active;
                let ready = core.policy.attach(id, &mut core.registry);
                if ready {
                    debug!(endpoint = %id, "Socket writable");
                }
            }
            EndpointEvent::Deactivated(id) => {
                if let Some(entry) = core.registry.entries.get_mut(&id) {
                    // The endpoint reconnects on its own; a partially
                    // written message dies with the old connection
                    entry.state = EndpointState::Connecting;
                    entry.handle.reset_pending();
                }
                core.policy.detach(id);
            }
            EndpointEvent::MessageIn(id, message) => {
                if let Some(inbound_tx) = &core.inbound_tx {
                    if inbound_tx
                        .send(Inbound {
                            endpoint: id,
                            message,
                        })
                        .is_err()
                    {
                        warn!(endpoint = %id, "Inbound consumer dropped, message lost");
                    }
                }
            }
        }
    }
}
