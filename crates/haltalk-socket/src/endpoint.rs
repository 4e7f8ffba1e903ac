//! One transport connection with its reconnect state machine
//!
//! An endpoint owns exactly one transport connection and runs as its own
//! task: Closed → Connecting → Active on a successful open, Active → Closed
//! on any transport loss, after which a reconnect is scheduled
//! unconditionally. Only an explicit close through the handle suppresses the
//! reconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use haltalk_core::{Frame, Message, MessageAssembler};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::socket::SendError;
use crate::transport::{Connection, Connector};

/// Fixed delay before a dropped endpoint is reopened
pub const RECONNECT_DELAY: Duration = Duration::from_millis(10_000);

/// Identifies one endpoint within a logical socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub(crate) u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Connection lifecycle of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Connecting,
    Active,
}

/// Events an endpoint reports to its socket
#[derive(Debug)]
pub(crate) enum EndpointEvent {
    /// Transport opened; fired once per successful open
    Activated(EndpointId),
    /// Transport lost or closed after having been active
    Deactivated(EndpointId),
    /// One fully reassembled inbound message
    MessageIn(EndpointId, Message),
}

enum EndpointCommand {
    /// Wire-encoded frames of one complete outbound message
    Flush(Vec<String>),
    Close,
}

/// Socket-side handle to a running endpoint task
pub(crate) struct EndpointHandle {
    id: EndpointId,
    address: String,
    pending: Vec<String>,
    commands: mpsc::UnboundedSender<EndpointCommand>,
}

impl EndpointHandle {
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Buffer one outbound frame; the accumulated message is flushed to the
    /// transport once the terminal frame is written.
    pub(crate) fn write(&mut self, frame: &str, more: bool) -> Result<(), SendError> {
        self.pending.push(Frame::new(frame, more).encode());
        if !more {
            let frames = std::mem::take(&mut self.pending);
            self.commands
                .send(EndpointCommand::Flush(frames))
                .map_err(|_| SendError::EndpointGone(self.id))?;
        }
        Ok(())
    }

    /// Discard a partially written outbound message
    pub(crate) fn reset_pending(&mut self) {
        self.pending.clear();
    }

    /// Tear down the transport without scheduling a reconnect
    pub(crate) fn close(&self) {
        let _ = self.commands.send(EndpointCommand::Close);
    }
}

pub(crate) struct Endpoint;

impl Endpoint {
    /// Spawn the connection task for `address`. The task reconnects forever
    /// until closed through the returned handle (or the handle is dropped).
    pub(crate) fn spawn(
        id: EndpointId,
        address: String,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<EndpointEvent>,
        reconnect_delay: Duration,
    ) -> EndpointHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(
            id,
            address.clone(),
            connector,
            events,
            cmd_rx,
            reconnect_delay,
        ));
        EndpointHandle {
            id,
            address,
            pending: Vec::new(),
            commands: cmd_tx,
        }
    }
}

enum PumpExit {
    /// Transport error or remote close; reconnect applies
    Lost,
    /// Explicit close through the handle; no reconnect
    Closed,
}

async fn run(
    id: EndpointId,
    address: String,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    mut commands: mpsc::UnboundedReceiver<EndpointCommand>,
    reconnect_delay: Duration,
) {
    loop {
        debug!(endpoint = %id, address = %address, "Connecting");
        match connector.connect(&address).await {
            Ok(mut conn) => {
                info!(endpoint = %id, address = %address, "Endpoint active");
                if events.send(EndpointEvent::Activated(id)).is_err() {
                    // Socket is gone, nothing left to serve
                    conn.close().await;
                    return;
                }

                let exit = pump(id, conn.as_mut(), &events, &mut commands).await;
                let _ = events.send(EndpointEvent::Deactivated(id));
                match exit {
                    PumpExit::Closed => {
                        conn.close().await;
                        info!(endpoint = %id, "Endpoint closed");
                        return;
                    }
                    PumpExit::Lost => {}
                }
            }
            Err(e) => {
                warn!(endpoint = %id, address = %address, error = %e, "Connect failed");
            }
        }

        // Messages queued for the lost connection die with it; the
        // reconnected endpoint starts with empty buffers.
        loop {
            match commands.try_recv() {
                Ok(EndpointCommand::Close) => return,
                Ok(EndpointCommand::Flush(_)) => continue,
                Err(_) => break,
            }
        }

        debug!(endpoint = %id, delay_ms = reconnect_delay.as_millis() as u64, "Reconnect scheduled");
        let sleep = tokio::time::sleep(reconnect_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(EndpointCommand::Close) | None => return,
                    // Not attached while down; the frames are discarded
                    Some(EndpointCommand::Flush(_)) => {}
                },
            }
        }
    }
}

async fn pump(
    id: EndpointId,
    conn: &mut dyn Connection,
    events: &mpsc::UnboundedSender<EndpointEvent>,
    commands: &mut mpsc::UnboundedReceiver<EndpointCommand>,
) -> PumpExit {
    let mut assembler = MessageAssembler::new();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(EndpointCommand::Flush(frames)) => {
                    for frame in frames {
                        if let Err(e) = conn.send(frame).await {
                            warn!(endpoint = %id, error = %e, "Send failed");
                            return PumpExit::Lost;
                        }
                    }
                }
                Some(EndpointCommand::Close) | None => return PumpExit::Closed,
            },
            frame = conn.recv() => match frame {
                Some(Ok(wire)) => match assembler.push_wire(&wire) {
                    Ok(Some(message)) => {
                        let _ = events.send(EndpointEvent::MessageIn(id, message));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(endpoint = %id, error = %e, "Bad wire frame"),
                },
                Some(Err(e)) => {
                    warn!(endpoint = %id, error = %e, "Transport error");
                    return PumpExit::Lost;
                }
                None => {
                    debug!(endpoint = %id, "Transport closed by peer");
                    return PumpExit::Lost;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use tokio::time::advance;

    fn spawn_endpoint(
        connector: &MockConnector,
    ) -> (
        EndpointHandle,
        mpsc::UnboundedReceiver<EndpointEvent>,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Endpoint::spawn(
            EndpointId(1),
            "mock://bridge".to_string(),
            Arc::new(connector.clone()),
            events_tx,
            RECONNECT_DELAY,
        );
        (handle, events_rx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_flushes_on_terminal_frame() {
        let (connector, mut accepted) = MockConnector::new();
        let (mut handle, mut events) = spawn_endpoint(&connector);

        let mut remote = accepted.recv().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));

        handle.write("first", true).unwrap();
        settle().await;
        assert_eq!(remote.try_sent(), None);

        handle.write("second", false).unwrap();
        assert_eq!(remote.sent().await.unwrap(), "1first");
        assert_eq!(remote.sent().await.unwrap(), "0second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_reassembly() {
        let (connector, mut accepted) = MockConnector::new();
        let (_handle, mut events) = spawn_endpoint(&connector);

        let remote = accepted.recv().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));

        remote.push("1head");
        remote.push("0tail");
        match events.recv().await {
            Some(EndpointEvent::MessageIn(_, message)) => {
                assert_eq!(message.frames, vec!["head", "tail"]);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_loss() {
        let (connector, mut accepted) = MockConnector::new();
        let (mut handle, mut events) = spawn_endpoint(&connector);

        let mut remote = accepted.recv().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));

        // Deactivated fires with the loss, not with the reconnect
        remote.hang_up();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Deactivated(_))
        ));

        // A message queued while down is discarded, and no reconnect is
        // attempted before the fixed delay
        handle.write("stale", false).unwrap();
        settle().await;
        assert!(accepted.try_recv().is_err());

        advance(RECONNECT_DELAY).await;
        let mut remote = accepted.recv().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));
        settle().await;
        assert_eq!(remote.try_sent(), None);

        // Exactly one reconnect was scheduled
        settle().await;
        assert!(accepted.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_suppresses_reconnect() {
        let (connector, mut accepted) = MockConnector::new();
        let (handle, mut events) = spawn_endpoint(&connector);

        let mut remote = accepted.recv().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));

        handle.close();
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Deactivated(_))
        ));
        assert_eq!(remote.sent().await, None);

        advance(RECONNECT_DELAY * 2).await;
        settle().await;
        assert!(accepted.try_recv().is_err());
        // The task ended, so the event channel drained
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_retries_without_deactivation() {
        let (connector, mut accepted) = MockConnector::new();
        connector.set_refuse(true);
        let (_handle, mut events) = spawn_endpoint(&connector);

        settle().await;
        assert!(accepted.try_recv().is_err());
        assert!(events.try_recv().is_err());

        connector.set_refuse(false);
        advance(RECONNECT_DELAY).await;
        assert!(accepted.recv().await.is_some());
        // First event ever is the activation; no deactivation was reported
        // for opens that never happened
        assert!(matches!(
            events.recv().await,
            Some(EndpointEvent::Activated(_))
        ));
    }
}
