//! Signaling channel
//!
//! Owns one relay connection. Outbound messages are validated and encoded
//! before they reach the transport; inbound frames are decoded by a pump task
//! and fanned out to subscribers by event name. Malformed inbound frames are
//! logged and dropped so one bad frame never stalls the session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::error::{Error, Result};
use crate::models::ConnectionId;
use crate::protocol::{ClientMessage, EventKind, ProtocolError, ServerMessage};

/// Outbound half of a relay connection
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Deliver one encoded frame to the relay
    async fn send(&self, frame: String) -> Result<()>;
}

/// Everything needed to talk to the relay over one connection
pub struct SignalingLink {
    /// Handle the relay assigned to this connection
    pub connection_id: ConnectionId,
    pub transport: Arc<dyn SignalingTransport>,
    /// Frames delivered by the relay; closes when the relay drops us
    pub inbound: mpsc::UnboundedReceiver<String>,
}

pub struct SignalingChannel {
    local_id: ConnectionId,
    transport: Arc<dyn SignalingTransport>,
    bus: EventBus<ServerMessage>,
    disconnected: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Start pumping inbound frames from `link`
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(link: SignalingLink) -> Arc<Self> {
        let SignalingLink {
            connection_id,
            transport,
            inbound,
        } = link;

        let bus = EventBus::new("signaling");
        let disconnected = CancellationToken::new();
        let pump = tokio::spawn(pump_frames(
            connection_id.clone(),
            inbound,
            bus.clone(),
            disconnected.clone(),
        ));

        info!(connection_id = %connection_id, "Signaling channel connected");

        Arc::new(Self {
            local_id: connection_id,
            transport,
            bus,
            disconnected,
            pump: Mutex::new(Some(pump)),
        })
    }

    #[must_use]
    pub const fn local_id(&self) -> &ConnectionId {
        &self.local_id
    }

    /// Validate, encode and send `message`
    pub async fn emit(&self, message: ClientMessage) -> Result<()> {
        let kind = message.kind();
        let frame = message.encode()?;

        if self.disconnected.is_cancelled() {
            return Err(Error::SignalingDelivery(format!(
                "cannot send {kind}: relay connection lost"
            )));
        }

        self.transport.send(frame).await.map_err(|err| match err {
            Error::SignalingDelivery(msg) => Error::SignalingDelivery(msg),
            other => Error::SignalingDelivery(format!("cannot send {kind}: {other}")),
        })?;

        debug!(
            connection_id = %self.local_id,
            event = %kind,
            to = ?message.recipient().map(ConnectionId::as_str),
            "Signaling message sent"
        );
        Ok(())
    }

    /// Receive inbound messages whose event is one of `kinds`
    #[must_use]
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription<ServerMessage> {
        let kinds = kinds.to_vec();
        self.bus
            .subscribe_filtered(move |message: &ServerMessage| kinds.contains(&message.kind()))
    }

    #[must_use]
    pub fn subscribe_all(&self) -> Subscription<ServerMessage> {
        self.bus.subscribe()
    }

    /// Decode one inbound frame and deliver it to subscribers
    pub fn dispatch(&self, frame: &str) -> std::result::Result<usize, ProtocolError> {
        dispatch_frame(&self.bus, frame)
    }

    /// Cancelled once the relay connection is gone
    #[must_use]
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.disconnected.is_cancelled()
    }

    /// Stop receiving frames
    pub fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.disconnected.cancel();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

fn dispatch_frame(bus: &EventBus<ServerMessage>, frame: &str) -> std::result::Result<usize, ProtocolError> {
    let message = ServerMessage::decode(frame)?;
    Ok(bus.publish(message))
}

async fn pump_frames(
    connection_id: ConnectionId,
    mut inbound: mpsc::UnboundedReceiver<String>,
    bus: EventBus<ServerMessage>,
    disconnected: CancellationToken,
) {
    while let Some(frame) = inbound.recv().await {
        match dispatch_frame(&bus, &frame) {
            Ok(delivered) => {
                debug!(connection_id = %connection_id, delivered, "Signaling frame dispatched");
            }
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "Dropping invalid signaling frame");
            }
        }
    }

    info!(connection_id = %connection_id, "Relay connection closed");
    disconnected.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoomId, SessionDescription};
    use crate::protocol::{JoinRequest, OfferTo};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SignalingTransport for RecordingTransport {
        async fn send(&self, frame: String) -> Result<()> {
            if self.fail {
                return Err(Error::SignalingDelivery("socket closed".to_string()));
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn channel(
        transport: Arc<RecordingTransport>,
    ) -> (Arc<SignalingChannel>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::connect(SignalingLink {
            connection_id: ConnectionId::from("sockA"),
            transport,
            inbound: rx,
        });
        (channel, tx)
    }

    #[tokio::test]
    async fn test_emit_encodes_frame() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, _tx) = channel(Arc::clone(&transport));

        channel
            .emit(ClientMessage::RoomJoin(JoinRequest {
                email: "a@x.com".to_string(),
                room: RoomId::from("42"),
            }))
            .await
            .unwrap();

        let frames = transport.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"event\":\"room:join\""));
    }

    #[tokio::test]
    async fn test_emit_rejects_invalid_message() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, _tx) = channel(Arc::clone(&transport));

        let err = channel
            .emit(ClientMessage::UserCall(OfferTo {
                to: ConnectionId::from("sockB"),
                offer: SessionDescription::answer("v=0"),
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert!(transport.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_emit_failure_is_delivery_error() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..RecordingTransport::default()
        });
        let (channel, _tx) = channel(transport);

        let err = channel
            .emit(ClientMessage::RoomJoin(JoinRequest {
                email: "a@x.com".to_string(),
                room: RoomId::from("42"),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingDelivery(_)));
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_event() {
        let (channel, tx) = channel(Arc::new(RecordingTransport::default()));
        let mut joined = channel.subscribe(&[EventKind::UserJoined]);
        let mut all = channel.subscribe_all();

        tx.send(r#"{"event":"user:left","data":{"id":"sockB"}}"#.to_string()).unwrap();
        tx.send(r#"{"event":"user:joined","data":{"email":"b@x.com","id":"sockB"}}"#.to_string())
            .unwrap();

        let msg = joined.recv().await.unwrap();
        assert_eq!(msg.kind(), EventKind::UserJoined);
        assert_eq!(all.recv().await.unwrap().kind(), EventKind::UserLeft);
        assert_eq!(all.recv().await.unwrap().kind(), EventKind::UserJoined);
    }

    #[tokio::test]
    async fn test_invalid_frames_are_dropped() {
        let (channel, tx) = channel(Arc::new(RecordingTransport::default()));
        let mut all = channel.subscribe_all();

        tx.send("not json".to_string()).unwrap();
        tx.send(r#"{"event":"user:call","data":{}}"#.to_string()).unwrap();
        tx.send(r#"{"event":"user:left","data":{"id":"sockB"}}"#.to_string()).unwrap();

        let msg = all.recv().await.unwrap();
        assert_eq!(msg.kind(), EventKind::UserLeft);
        assert!(channel.dispatch("{}").is_err());
    }

    #[tokio::test]
    async fn test_relay_loss_cancels_token() {
        let transport = Arc::new(RecordingTransport::default());
        let (channel, tx) = channel(transport);
        let token = channel.disconnected();
        assert!(channel.is_connected());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();

        let err = channel
            .emit(ClientMessage::RoomJoin(JoinRequest {
                email: "a@x.com".to_string(),
                room: RoomId::from("42"),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingDelivery(_)));
    }
}
