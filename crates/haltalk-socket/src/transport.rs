//! Transport seam between sockets and the WebSocket bridge

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Subprotocol token negotiated when opening a bridge connection
pub const SUBPROTOCOL: &str = "haltalk.json";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Recv(String),
}

/// One open transport connection carrying text frames in order
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text frame; `None` once the peer closed
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens transport connections for endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError>;
}

/// WebSocket connector negotiating the Haltalk subprotocol
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = address
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(address = %address, status = %response.status(), "WebSocket open");

        let (sink, stream) = stream.split();
        Ok(Box::new(WsConnection { sink, stream }))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsConnection {
    sink: SplitSink<WsStream, WsMessage>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.to_string())),
                Ok(WsMessage::Close(_)) => return None,
                // Ping/pong are answered by the library; binary frames are
                // not part of the json policy
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Recv(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! In-memory transport for tests

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Connector handing out in-memory connections; every accepted connection
    /// surfaces as a [`MockRemote`] on the receiver returned by [`MockConnector::new`].
    #[derive(Clone)]
    pub struct MockConnector {
        accept_tx: mpsc::UnboundedSender<MockRemote>,
        refuse: Arc<AtomicBool>,
    }

    impl MockConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MockRemote>) {
            let (accept_tx, accept_rx) = mpsc::unbounded_channel();
            (
                Self {
                    accept_tx,
                    refuse: Arc::new(AtomicBool::new(false)),
                },
                accept_rx,
            )
        }

        /// Make subsequent connect attempts fail while set
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let remote = MockRemote {
                address: address.to_string(),
                outbound: out_rx,
                inbound: Some(in_tx),
            };
            self.accept_tx
                .send(remote)
                .map_err(|_| TransportError::Connect("no acceptor".into()))?;
            Ok(Box::new(MockConnection {
                out_tx: Some(out_tx),
                in_rx,
            }))
        }
    }

    /// Test-side handle to one accepted connection
    pub struct MockRemote {
        pub address: String,
        outbound: mpsc::UnboundedReceiver<String>,
        inbound: Option<mpsc::UnboundedSender<String>>,
    }

    impl MockRemote {
        /// Next wire frame the client sent; `None` once the client closed
        pub async fn sent(&mut self) -> Option<String> {
            self.outbound.recv().await
        }

        /// Wire frame the client sent, if one is already queued
        pub fn try_sent(&mut self) -> Option<String> {
            self.outbound.try_recv().ok()
        }

        /// Deliver one wire frame to the client
        pub fn push(&self, wire: &str) {
            if let Some(inbound) = &self.inbound {
                let _ = inbound.send(wire.to_string());
            }
        }

        /// Close the connection from the remote side
        pub fn hang_up(&mut self) {
            self.inbound = None;
        }
    }

    struct MockConnection {
        out_tx: Option<mpsc::UnboundedSender<String>>,
        in_rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            match &self.out_tx {
                Some(tx) => tx
                    .send(text)
                    .map_err(|_| TransportError::Send("peer gone".into())),
                None => Err(TransportError::Send("closed".into())),
            }
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.in_rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.out_tx = None;
        }
    }
}
