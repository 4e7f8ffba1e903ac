//! Signal group state tracker
//!
//! Subscribes to one signal group and mirrors its member signals in a
//! handle-indexed shadow table. Full updates carry complete signal records
//! nested in `group` containers; incremental updates carry a flat list of
//! partial records merged into existing entries.

use std::sync::Arc;

use anyhow::{Context, Result};
use haltalk_core::{proto, ShadowTable, Signal, SignalChange};
use haltalk_socket::{Connector, EndpointState, Inbound, Subscriber, WsConnector};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::diagnostics::ProtocolStats;
use crate::remote::{RemoteConfig, HALGROUP_SERVICE};

/// Events from a signal group channel
#[derive(Debug, Clone)]
pub enum HalgroupEvent {
    /// A signal appeared in a full update
    SignalDefined(Signal),
    /// A signal changed through an incremental update
    SignalUpdated(Signal),
    /// A protocol-level error message; the connection stays up
    ProtocolError(Value),
    /// A message with an unrecognized type
    Undefined(Value),
}

struct GroupState {
    signals: ShadowTable<Signal>,
    stats: ProtocolStats,
}

/// Tracks the signals of one remote group
pub struct Halgroup {
    name: String,
    subscriber: Subscriber,
    shared: Arc<Mutex<GroupState>>,
    events: broadcast::Sender<HalgroupEvent>,
}

impl Halgroup {
    /// Open the group channel through the bridge
    pub fn connect(config: &RemoteConfig, name: &str) -> Result<Self> {
        let url = config.subscriber_url(HALGROUP_SERVICE, &[("group", name)]);
        Self::with_connector(Arc::new(WsConnector), &url, name)
    }

    /// Open over a caller-supplied transport
    pub fn with_connector(connector: Arc<dyn Connector>, url: &str, name: &str) -> Result<Self> {
        let subscriber = Subscriber::new(connector);
        subscriber.connect(url);
        subscriber.subscribe(name);
        let incoming = subscriber
            .incoming()
            .context("group inbound stream already taken")?;
        let shared = Arc::new(Mutex::new(GroupState {
            signals: ShadowTable::new(),
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
    pub fn events(&self) -> broadcast::Receiver<HalgroupEvent> {
        self.events.subscribe()
    }

    /// Shadow copy of the signal at `handle`
    pub fn signal(&self, handle: i32) -> Option<Signal> {
        self.shared.lock().signals.get(handle).cloned()
    }

    /// Shadow copies of all tracked signals
    pub fn signals(&self) -> Vec<Signal> {
        self.shared
            .lock()
            .signals
            .iter()
            .map(|(_, signal)| signal.clone())
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

impl Drop for Halgroup {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}

async fn run(
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<Mutex<GroupState>>,
    events: broadcast::Sender<HalgroupEvent>,
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
    debug!("Group dispatch ended");
}

fn dispatch(
    shared: &Mutex<GroupState>,
    events: &broadcast::Sender<HalgroupEvent>,
    msg: Value,
) {
    let mut state = shared.lock();
    match proto::message_type(&msg) {
        Some(proto::HALGROUP_FULL_UPDATE) => full_update(&mut state, events, &msg),
        Some(proto::HALGROUP_INCREMENTAL_UPDATE) => incremental_update(&mut state, events, &msg),
        Some(proto::HALGROUP_ERROR) | Some(proto::STP_NOGROUP) => {
            state.stats.errors += 1;
            warn!(payload = %msg, "Protocol error from backend");
            let _ = events.send(HalgroupEvent::ProtocolError(msg));
        }
        other => {
            state.stats.undef += 1;
            debug!(msg_type = ?other, "Undefined message type");
            let _ = events.send(HalgroupEvent::Undefined(msg));
        }
    }
}

fn full_update(
    state: &mut GroupState,
    events: &broadcast::Sender<HalgroupEvent>,
    msg: &Value,
) {
    let Some(containers) = msg.get("group").and_then(Value::as_array) else {
        state.stats.errors += 1;
        warn!("Full update without group containers");
        return;
    };
    for container in containers {
        let Some(members) = container.get("member").and_then(Value::as_array) else {
            continue;
        };
        for member in members {
            // Members that are not signals (nested group references) are
            // not tracked here
            let Some(record) = member.get("signal") else {
                continue;
            };
            match serde_json::from_value::<Signal>(record.clone()) {
                Ok(signal) => {
                    state.signals.insert(signal.handle, signal.clone());
                    let _ = events.send(HalgroupEvent::SignalDefined(signal));
                }
                Err(e) => {
                    state.stats.errors += 1;
                    warn!(error = %e, "Malformed signal record in full update");
                }
            }
        }
    }
}

fn incremental_update(
    state: &mut GroupState,
    events: &broadcast::Sender<HalgroupEvent>,
    msg: &Value,
) {
    let Some(changes) = msg.get("signal").and_then(Value::as_array) else {
        state.stats.errors += 1;
        warn!("Incremental update without signal records");
        return;
    };
    for record in changes {
        let change: SignalChange = match serde_json::from_value(record.clone()) {
            Ok(change) => change,
            Err(e) => {
                state.stats.errors += 1;
                warn!(error = %e, "Malformed signal change");
                continue;
            }
        };
        match state
            .signals
            .merge_with(change.handle, |signal| signal.apply(&change))
        {
            Ok(signal) => {
                let signal = signal.clone();
                let _ = events.send(HalgroupEvent::SignalUpdated(signal));
            }
            Err(e) => {
                // Never creates an entry; the record is dropped
                state.stats.errors += 1;
                warn!(error = %e, "Incremental update dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haltalk_core::hal::{HAL_FLOAT, HAL_S32};
    use haltalk_core::HalValue;
    use haltalk_socket::transport::mock::{MockConnector, MockRemote};
    use serde_json::json;
    use tokio::time::{sleep, Duration};

    async fn connect_group() -> (Halgroup, MockRemote, broadcast::Receiver<HalgroupEvent>) {
        let (connector, mut accepted) = MockConnector::new();
        let group =
            Halgroup::with_connector(Arc::new(connector), "mock://bridge", "status").unwrap();
        let events = group.events();
        let mut remote = accepted.recv().await.unwrap();
        while group.state() != EndpointState::Active {
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(remote.sent().await.unwrap(), "01status");
        (group, remote, events)
    }

    fn push_msg(remote: &MockRemote, msg: &Value) {
        remote.push(&format!("0{}", msg));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_then_incremental_update() {
        let (group, remote, mut events) = connect_group().await;

        push_msg(
            &remote,
            &json!({"type": proto::HALGROUP_FULL_UPDATE, "group": [{"name": "status", "member": [
                {"signal": {"handle": 10, "name": "feed", "type": HAL_FLOAT, "halfloat": 100.0}},
                {"signal": {"handle": 11, "name": "line", "type": HAL_S32, "hals32": 0}},
                {"groupname": "nested"},
            ]}]}),
        );

        match events.recv().await {
            Ok(HalgroupEvent::SignalDefined(signal)) => {
                assert_eq!(signal.name, "feed");
                assert_eq!(signal.value(), Some(HalValue::Float(100.0)));
            }
            other => panic!("expected signal definition, got {:?}", other),
        }
        assert!(matches!(
            events.recv().await,
            Ok(HalgroupEvent::SignalDefined(_))
        ));
        // The nested group reference is not a signal
        assert_eq!(group.signals().len(), 2);

        push_msg(
            &remote,
            &json!({"type": proto::HALGROUP_INCREMENTAL_UPDATE, "signal": [
                {"handle": 11, "hals32": 42},
            ]}),
        );
        match events.recv().await {
            Ok(HalgroupEvent::SignalUpdated(signal)) => {
                assert_eq!(signal.name, "line");
                assert_eq!(signal.value(), Some(HalValue::S32(42)));
            }
            other => panic!("expected signal update, got {:?}", other),
        }
        assert_eq!(group.signal(11).unwrap().hals32, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_unknown_handle_is_counted_and_skipped() {
        let (group, remote, mut events) = connect_group().await;

        push_msg(
            &remote,
            &json!({"type": proto::HALGROUP_INCREMENTAL_UPDATE, "signal": [
                {"handle": 99, "halfloat": 1.0},
            ]}),
        );
        push_msg(
            &remote,
            &json!({"type": proto::HALGROUP_FULL_UPDATE, "group": [{"member": [
                {"signal": {"handle": 10, "name": "feed", "type": HAL_FLOAT, "halfloat": 0.0}},
            ]}]}),
        );
        assert!(matches!(
            events.recv().await,
            Ok(HalgroupEvent::SignalDefined(_))
        ));

        assert_eq!(group.stats().errors, 1);
        assert!(group.signal(99).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nogroup_is_a_protocol_error() {
        let (group, remote, mut events) = connect_group().await;

        push_msg(&remote, &json!({"type": proto::STP_NOGROUP}));
        match events.recv().await {
            Ok(HalgroupEvent::ProtocolError(msg)) => {
                assert_eq!(proto::message_type(&msg), Some(proto::STP_NOGROUP));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(group.stats().errors, 1);
    }
}
