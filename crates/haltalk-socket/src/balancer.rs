//! Round-robin distribution of outbound messages across endpoints

use crate::endpoint::EndpointId;

/// Where the balancer routed one outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Deliver through this endpoint
    Deliver(EndpointId),
    /// Remainder of a message whose endpoint vanished; consume and discard
    Discard,
    /// No endpoint attached
    Unavailable,
}

/// Fans complete messages round-robin across attached endpoints.
///
/// A message stays pinned to the endpoint that took its first frame. If that
/// endpoint is removed mid-message, the remaining frames of the message are
/// discarded rather than handed to a different peer, so no fragment of one
/// logical message reaches two remotes.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    endpoints: Vec<EndpointId>,
    current: usize,
    in_progress: bool,
    dropping: bool,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint; returns true when the socket just became writable
    pub fn attach(&mut self, id: EndpointId) -> bool {
        self.endpoints.push(id);
        self.endpoints.len() == 1
    }

    /// Remove an endpoint. Removing the one currently mid-message switches
    /// the balancer into dropping mode until that message completes.
    pub fn terminated(&mut self, id: EndpointId) {
        let Some(index) = self.endpoints.iter().position(|e| *e == id) else {
            return;
        };
        if index == self.current && self.in_progress {
            self.dropping = true;
        }
        self.endpoints.remove(index);
        if index < self.current {
            self.current -= 1;
        }
        if self.current >= self.endpoints.len() {
            self.current = 0;
        }
    }

    /// Route one outbound frame. The cursor advances only when a message
    /// completes, so all frames of one message share an endpoint.
    pub fn route(&mut self, more: bool) -> Route {
        if self.dropping {
            self.in_progress = more;
            self.dropping = more;
            return Route::Discard;
        }
        if self.endpoints.is_empty() {
            return Route::Unavailable;
        }
        let id = self.endpoints[self.current];
        self.in_progress = more;
        if !more {
            self.current = (self.current + 1) % self.endpoints.len();
        }
        Route::Deliver(id)
    }

    /// Whether the caller may still submit frames: true while a drop is
    /// being drained or at least one endpoint is attached.
    pub fn has_out(&self) -> bool {
        self.dropping || !self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
