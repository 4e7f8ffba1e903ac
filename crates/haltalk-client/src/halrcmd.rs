//! HAL remote command channel with keepalive
//!
//! Commands go out through a dealer; a repeating ping probes the channel.
//! A ping that is never acknowledged before the next tick marks the channel
//! inactive, and any inbound message marks it active again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use haltalk_core::{proto, Message};
use haltalk_socket::{Connector, Dealer, EndpointState, Inbound, SendError, WsConnector};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::remote::{RemoteConfig, HALRCMD_SERVICE};

/// Period of the keepalive ping
pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// Events a command channel reports
#[derive(Debug, Clone)]
pub enum HalrcmdEvent {
    /// Liveness of the channel as judged by the keepalive
    Active(bool),
    /// Any inbound message other than the ping acknowledge
    Message(Value),
}

/// Command channel to the HAL backend
pub struct Halrcmd {
    dealer: Dealer,
    events: broadcast::Sender<HalrcmdEvent>,
}

impl Halrcmd {
    /// Open the command channel through the bridge
    pub fn connect(config: &RemoteConfig) -> Result<Self> {
        Self::with_connector(Arc::new(WsConnector), &config.dealer_url(HALRCMD_SERVICE))
    }

    /// Open over a caller-supplied transport
    pub fn with_connector(connector: Arc<dyn Connector>, url: &str) -> Result<Self> {
        let dealer = Dealer::new(connector);
        dealer.connect(url);
        let incoming = dealer
            .incoming()
            .context("command channel inbound stream already taken")?;
        let (events, _) = broadcast::channel(64);
        tokio::spawn(run(dealer.clone(), incoming, events.clone()));
        Ok(Self { dealer, events })
    }

    /// Subscribe to channel events
    pub fn events(&self) -> broadcast::Receiver<HalrcmdEvent> {
        self.events.subscribe()
    }

    /// Send one command message; the value must carry its `type` field.
    /// Fails synchronously when no endpoint is attached.
    pub fn send(&self, msg: &Value) -> Result<(), SendError> {
        self.dealer.send(&Message::single(msg.to_string()))
    }

    /// Build and send a command of `msg_type` with the given fields
    pub fn send_command(&self, msg_type: i32, fields: Map<String, Value>) -> Result<(), SendError> {
        let mut msg = fields;
        msg.insert("type".to_string(), msg_type.into());
        self.dealer.send(&Message::single(Value::Object(msg).to_string()))
    }

    pub fn state(&self) -> EndpointState {
        self.dealer.state()
    }

    /// Close the channel; no further events are delivered
    pub fn close(&self) {
        self.dealer.close();
    }
}

impl Drop for Halrcmd {
    fn drop(&mut self) {
        self.dealer.close();
    }
}

async fn run(
    dealer: Dealer,
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    events: broadcast::Sender<HalrcmdEvent>,
) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The interval yields immediately once; the first ping goes out a full
    // period after open
    ticker.tick().await;

    let mut ping_outstanding = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ping_outstanding {
                    debug!("Ping unacknowledged, channel inactive");
                    let _ = events.send(HalrcmdEvent::Active(false));
                }
                if let Err(e) = dealer.send(&Message::single(json!({"type": proto::PING}).to_string())) {
                    debug!(error = %e, "Ping not sent");
                }
                ping_outstanding = true;
            }
            inbound = incoming.recv() => {
                let Some(inbound) = inbound else { break };
                // Anything from the backend proves the channel alive and
                // restarts the keepalive period
                ping_outstanding = false;
                ticker.reset();
                let _ = events.send(HalrcmdEvent::Active(true));

                let Some(payload) = inbound.message.payload() else { continue };
                match serde_json::from_str::<Value>(payload) {
                    Ok(msg) => {
                        if proto::message_type(&msg) != Some(proto::PING_ACKNOWLEDGE) {
                            let _ = events.send(HalrcmdEvent::Message(msg));
                        }
                    }
                    Err(e) => warn!(error = %e, "Inbound message is not valid JSON"),
                }
            }
        }
    }
    debug!("Command channel dispatch ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use haltalk_socket::transport::mock::MockConnector;
    use tokio::time::{advance, sleep};

    async fn connect_active(
    ) -> (Halrcmd, haltalk_socket::transport::mock::MockRemote, broadcast::Receiver<HalrcmdEvent>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (connector, mut accepted) = MockConnector::new();
        let halrcmd = Halrcmd::with_connector(Arc::new(connector), "mock://bridge").unwrap();
        let events = halrcmd.events();
        let remote = accepted.recv().await.unwrap();
        while halrcmd.state() != EndpointState::Active {
            sleep(Duration::from_millis(1)).await;
        }
        (halrcmd, remote, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sent_each_interval() {
        let (_halrcmd, mut remote, mut events) = connect_active().await;

        advance(PING_INTERVAL).await;
        assert_eq!(remote.sent().await.unwrap(), "0{\"type\":210}");
        // First ping: the previous one was not outstanding, so no liveness
        // verdict yet
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_ping_marks_inactive() {
        let (_halrcmd, mut remote, mut events) = connect_active().await;

        advance(PING_INTERVAL).await;
        assert_eq!(remote.sent().await.unwrap(), "0{\"type\":210}");

        // No reply within a full interval: inactive is reported before the
        // next ping goes out
        advance(PING_INTERVAL).await;
        assert!(matches!(
            events.recv().await,
            Ok(HalrcmdEvent::Active(false))
        ));
        assert_eq!(remote.sent().await.unwrap(), "0{\"type\":210}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_acknowledge_marks_active_and_is_not_forwarded() {
        let (_halrcmd, mut remote, mut events) = connect_active().await;

        advance(PING_INTERVAL).await;
        assert_eq!(remote.sent().await.unwrap(), "0{\"type\":210}");

        remote.push("0{\"type\":215}");
        assert!(matches!(events.recv().await, Ok(HalrcmdEvent::Active(true))));

        // The acknowledge itself is not surfaced as a message
        remote.push("0{\"type\":277,\"name\":\"axis\"}");
        assert!(matches!(events.recv().await, Ok(HalrcmdEvent::Active(true))));
        match events.recv().await {
            Ok(HalrcmdEvent::Message(msg)) => {
                assert_eq!(proto::message_type(&msg), Some(proto::HALRCOMMAND_DESCRIPTION));
                assert_eq!(msg.get("name"), Some(&serde_json::json!("axis")));
            }
            other => panic!("expected message event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_injects_type() {
        let (halrcmd, mut remote, _events) = connect_active().await;

        let mut fields = Map::new();
        fields.insert("name".to_string(), "axis.0.jog".into());
        halrcmd
            .send_command(proto::HALRCOMMAND_SET, fields)
            .unwrap();

        let wire = remote.sent().await.unwrap();
        let msg: Value = serde_json::from_str(&wire[1..]).unwrap();
        assert_eq!(proto::message_type(&msg), Some(proto::HALRCOMMAND_SET));
        assert_eq!(msg.get("name"), Some(&serde_json::json!("axis.0.jog")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_when_disconnected() {
        let (connector, _accepted) = MockConnector::new();
        connector.set_refuse(true);
        let halrcmd = Halrcmd::with_connector(Arc::new(connector), "mock://bridge").unwrap();
        let err = halrcmd.send(&json!({"type": proto::PING})).unwrap_err();
        assert!(matches!(err, SendError::NotReady));
        assert_eq!(halrcmd.state(), EndpointState::Connecting);
    }
}
