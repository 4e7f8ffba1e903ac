//! Backend log stream subscriber

use std::sync::Arc;

use anyhow::{Context, Result};
use haltalk_core::proto;
use haltalk_socket::{Connector, EndpointState, Inbound, Subscriber, WsConnector};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::diagnostics::ProtocolStats;
use crate::remote::{RemoteConfig, LOG_SERVICE};

/// Topic the backend publishes log records on
pub const LOG_TOPIC: &str = "log";

/// Events from the log channel
#[derive(Debug, Clone)]
pub enum LoggerEvent {
    /// One backend log record
    Log(Value),
    /// Anything other than a log message is a protocol error on this channel
    ProtocolError(Value),
}

/// Subscriber to the backend log stream, pre-subscribed to [`LOG_TOPIC`]
pub struct Logger {
    subscriber: Subscriber,
    shared: Arc<Mutex<ProtocolStats>>,
    events: broadcast::Sender<LoggerEvent>,
}

impl Logger {
    /// Open the log channel through the bridge
    pub fn connect(config: &RemoteConfig) -> Result<Self> {
        let url = config.subscriber_url(LOG_SERVICE, &[("subscribe", LOG_TOPIC)]);
        Self::with_connector(Arc::new(WsConnector), &url)
    }

    /// Open over a caller-supplied transport
    pub fn with_connector(connector: Arc<dyn Connector>, url: &str) -> Result<Self> {
        let subscriber = Subscriber::new(connector);
        subscriber.connect(url);
        subscriber.subscribe(LOG_TOPIC);
        let incoming = subscriber
            .incoming()
            .context("log inbound stream already taken")?;
        let shared = Arc::new(Mutex::new(ProtocolStats::default()));
        let (events, _) = broadcast::channel(256);
        tokio::spawn(run(incoming, shared.clone(), events.clone()));
        Ok(Self {
            subscriber,
            shared,
            events,
        })
    }

    /// Subscribe to channel events
    pub fn events(&self) -> broadcast::Receiver<LoggerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> ProtocolStats {
        *self.shared.lock()
    }

    pub fn state(&self) -> EndpointState {
        self.subscriber.state()
    }

    /// Close the channel; no further events are delivered
    pub fn close(&self) {
        self.subscriber.close();
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}

async fn run(
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<Mutex<ProtocolStats>>,
    events: broadcast::Sender<LoggerEvent>,
) {
    while let Some(inbound) = incoming.recv().await {
        let Some(payload) = inbound.message.payload() else {
            continue;
        };
        let msg: Value = match serde_json::from_str(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Inbound message is not valid JSON");
                continue;
            }
        };
        match proto::message_type(&msg) {
            Some(proto::LOG_MESSAGE) => {
                let _ = events.send(LoggerEvent::Log(msg));
            }
            other => {
                shared.lock().errors += 1;
                warn!(msg_type = ?other, "Unexpected message on log channel");
                let _ = events.send(LoggerEvent::ProtocolError(msg));
            }
        }
    }
    debug!("Log dispatch ended");
}
