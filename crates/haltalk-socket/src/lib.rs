//! Haltalk Socket - reconnecting, load-balanced logical sockets
//!
//! A logical socket (Dealer or Subscriber) is backed by any number of
//! endpoints, one per connected bridge address. Each endpoint owns one
//! transport connection and reconnects on loss; the socket policy decides
//! how outbound frames are distributed and what is replayed when a
//! connection comes back.

pub mod balancer;
pub mod dealer;
pub mod endpoint;
pub mod socket;
pub mod subscriber;
pub mod transport;

pub use balancer::{LoadBalancer, Route};
pub use dealer::Dealer;
pub use endpoint::{EndpointId, EndpointState, RECONNECT_DELAY};
pub use socket::{Inbound, SendError};
pub use subscriber::Subscriber;
pub use transport::{Connection, Connector, TransportError, WsConnector, SUBPROTOCOL};
