//! Round-robin request/response socket

use std::sync::Arc;
use std::time::Duration;

use haltalk_core::Message;
use tokio::sync::mpsc;

use crate::balancer::{LoadBalancer, Route};
use crate::endpoint::{EndpointId, EndpointState, RECONNECT_DELAY};
use crate::socket::{EndpointRegistry, Inbound, SendError, SocketBase, SocketPolicy};
use crate::transport::Connector;

impl SocketPolicy for LoadBalancer {
    fn attach(&mut self, id: EndpointId, _registry: &mut EndpointRegistry) -> bool {
        LoadBalancer::attach(self, id)
    }

    fn detach(&mut self, id: EndpointId) {
        self.terminated(id);
    }

    fn send(
        &mut self,
        frame: &str,
        more: bool,
        registry: &mut EndpointRegistry,
    ) -> Result<(), SendError> {
        match self.route(more) {
            Route::Deliver(id) => registry.write(id, frame, more),
            Route::Discard => Ok(()),
            Route::Unavailable => Err(SendError::NotReady),
        }
    }

    fn has_out(&self) -> bool {
        LoadBalancer::has_out(self)
    }
}

/// Bidirectional socket distributing complete messages round-robin across
/// its endpoints.
///
/// Inbound messages from any endpoint are delivered without discrimination;
/// callers must not assume a request and its response share an endpoint.
/// Cloning shares the socket.
#[derive(Clone)]
pub struct Dealer {
    base: SocketBase<LoadBalancer>,
}

impl Dealer {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_reconnect_delay(connector, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(connector: Arc<dyn Connector>, delay: Duration) -> Self {
        Self {
            base: SocketBase::new(connector, LoadBalancer::new(), delay),
        }
    }

    /// Open one endpoint to `address`; it reconnects on loss until
    /// [`Dealer::disconnect`] or [`Dealer::close`]
    pub fn connect(&self, address: &str) -> EndpointId {
        self.base.connect(address)
    }

    /// Close every endpoint opened for `address`, cancelling reconnects
    pub fn disconnect(&self, address: &str) -> usize {
        self.base.disconnect(address)
    }

    /// Tear down all endpoints and end the inbound stream
    pub fn close(&self) {
        self.base.close();
    }

    /// The stream of inbound messages; single consumer
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.base.incoming()
    }

    /// Send one complete message. Fails synchronously with
    /// [`SendError::NotReady`] when no endpoint is attached.
    pub fn send(&self, message: &Message) -> Result<(), SendError> {
        self.base.send_frames(message)
    }

    pub fn has_out(&self) -> bool {
        self.base.has_out()
    }

    pub fn state(&self) -> EndpointState {
        self.base.state()
    }

    pub fn active_endpoints(&self) -> usize {
        self.base.active_endpoints()
    }
}
