//! Remote HAL component state tracker
//!
//! Subscribes to one component's channel and mirrors its pins in a
//! handle-indexed shadow table. A full update carries complete pin records
//! inside `comp` containers; an incremental update carries partial records
//! that are merged field-by-field into existing entries.

use std::sync::Arc;

use anyhow::{Context, Result};
use haltalk_core::{proto, Pin, PinChange, ShadowTable};
use haltalk_socket::{Connector, EndpointState, Inbound, Subscriber, WsConnector};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::diagnostics::ProtocolStats;
use crate::remote::{RemoteConfig, HALRCOMP_SERVICE};

/// Events from a remote component channel
#[derive(Debug, Clone)]
pub enum HalrcompEvent {
    /// A pin appeared in a full update
    PinDefined(Pin),
    /// A pin changed through an incremental update
    PinUpdated(Pin),
    /// A protocol-level error message; the connection stays up
    ProtocolError(Value),
    /// A message with an unrecognized type
    Undefined(Value),
}

struct CompState {
    pins: ShadowTable<Pin>,
    stats: ProtocolStats,
}

/// Tracks the pins of one remote HAL component
pub struct Halrcomp {
    name: String,
    subscriber: Subscriber,
    shared: Arc<Mutex<CompState>>,
    events: broadcast::Sender<HalrcompEvent>,
}

impl Halrcomp {
    /// Open the component channel through the bridge
    pub fn connect(config: &RemoteConfig, name: &str) -> Result<Self> {
        let url = config.subscriber_url(HALRCOMP_SERVICE, &[("subscribe", name)]);
        Self::with_connector(Arc::new(WsConnector), &url, name)
    }

    /// Open over a caller-supplied transport
    pub fn with_connector(connector: Arc<dyn Connector>, url: &str, name: &str) -> Result<Self> {
        let subscriber = Subscriber::new(connector);
        subscriber.connect(url);
        subscriber.subscribe(name);
        let incoming = subscriber
            .incoming()
            .context("component inbound stream already taken")?;
        let shared = Arc::new(Mutex::new(CompState {
            pins: ShadowTable::new(),
            stats: ProtocolStats::default(),
        }));
        let (events, _) = broadcast::channel(256);
        tokio::spawn(run(incoming, shared.clone(), events.clone()));
        Ok(Self {
            name: name.to_string(),
            subscriber,
            shared,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to channel events
    pub fn events(&self) -> broadcast::Receiver<HalrcompEvent> {
        self.events.subscribe()
    }

    /// Shadow copy of the pin at `handle`
    pub fn pin(&self, handle: i32) -> Option<Pin> {
        self.shared.lock().pins.get(handle).cloned()
    }

    /// Shadow copies of all tracked pins
    pub fn pins(&self) -> Vec<Pin> {
        self.shared
            .lock()
            .pins
            .iter()
            .map(|(_, pin)| pin.clone())
            .collect()
    }

    pub fn stats(&self) -> ProtocolStats {
        self.shared.lock().stats
    }

    pub fn state(&self) -> EndpointState {
        self.subscriber.state()
    }

    /// Close the channel; no further events are delivered
    pub fn close(&self) {
        self.subscriber.close();
    }
}

impl Drop for Halrcomp {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}

async fn run(
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<Mutex<CompState>>,
    events: broadcast::Sender<HalrcompEvent>,
) {
    while let Some(inbound) = incoming.recv().await {
        let Some(payload) = inbound.message.payload() else {
            continue;
        };
        match serde_json::from_str::<Value>(payload) {
            Ok(msg) => dispatch(&shared, &events, msg),
            Err(e) => warn!(error = %e, "Inbound message is not valid JSON"),
        }
    }
    debug!("Component dispatch ended");
}

fn dispatch(
    shared: &Mutex<CompState>,
    events: &broadcast::Sender<HalrcompEvent>,
    msg: Value,
) {
    let mut state = shared.lock();
    match proto::message_type(&msg) {
        Some(proto::HALRCOMP_FULL_UPDATE) => full_update(&mut state, events, &msg),
        Some(proto::HALRCOMP_INCREMENTAL_UPDATE) => incremental_update(&mut state, events, &msg),
        Some(proto::HALRCOMP_ERROR) | Some(proto::STP_NOGROUP) => {
            state.stats.errors += 1;
            warn!(payload = %msg, "Protocol error from backend");
            let _ = events.send(HalrcompEvent::ProtocolError(msg));
        }
        other => {
            state.stats.undef += 1;
            debug!(msg_type = ?other, "Undefined message type");
            let _ = events.send(HalrcompEvent::Undefined(msg));
        }
    }
}

fn full_update(
    state: &mut CompState,
    events: &broadcast::Sender<HalrcompEvent>,
    msg: &Value,
) {
    let Some(containers) = msg.get("comp").and_then(Value::as_array) else {
        state.stats.errors += 1;
        warn!("Full update without comp containers");
        return;
    };
    for container in containers {
        let Some(pins) = container.get("pin").and_then(Value::as_array) else {
            continue;
        };
        for record in pins {
            match serde_json::from_value::<Pin>(record.clone()) {
                Ok(pin) => {
                    state.pins.insert(pin.handle, pin.clone());
                    let _ = events.send(HalrcompEvent::PinDefined(pin));
                }
                Err(e) => {
                    state.stats.errors += 1;
                    warn!(error = %e, "Malformed pin record in full update");
                }
            }
        }
    }
}

fn incremental_update(
    state: &mut CompState,
    events: &broadcast::Sender<HalrcompEvent>,
    msg: &Value,
) {
    let Some(changes) = msg.get("pin").and_then(Value::as_array) else {
        state.stats.errors += 1;
        warn!("Incremental update without pin records");
        return;
    };
    for record in changes {
        let change: PinChange = match serde_json::from_value(record.clone()) {
            Ok(change) => change,
            Err(e) => {
                state.stats.errors += 1;
                warn!(error = %e, "Malformed pin change");
                continue;
            }
        };
        match state.pins.merge_with(change.handle, |pin| pin.apply(&change)) {
            Ok(pin) => {
                let pin = pin.clone();
                let _ = events.send(HalrcompEvent::PinUpdated(pin));
            }
            Err(e) => {
                // Never creates an entry; the record is dropped
                state.stats.errors += 1;
                warn!(error = %e, "Incremental update dropped");
            }
        }
    }
}
