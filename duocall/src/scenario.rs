//! Scripted call scenarios between two participants

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use duocall_core::{
    CallSession, Config, ConnectionId, PeerConnectionFactory, RoomId, SessionEvent, SessionHandle, SessionOptions,
    SessionSnapshot, SignalingChannel, StreamId, Subscription, SyntheticMediaSource,
};
use duocall_relay::{OccupantInfo, RelayHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Every scenario in turn
    All,
    /// Join, call, and exchange streams in both directions
    Call,
    /// Connected call followed by a screen share
    Renegotiate,
    /// Both participants call at the same moment
    Glare,
}

impl Scenario {
    #[must_use]
    pub fn expand(self) -> Vec<Self> {
        match self {
            Self::All => vec![Self::Call, Self::Renegotiate, Self::Glare],
            other => vec![other],
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub room: RoomId,
    pub occupants: Vec<OccupantInfo>,
    pub participants: Vec<SessionSnapshot>,
}

struct Participant {
    name: &'static str,
    handle: SessionHandle,
    events: Subscription<SessionEvent>,
    media: Arc<SyntheticMediaSource>,
    task: JoinHandle<()>,
}

impl Participant {
    async fn wait<P>(&mut self, what: &str, predicate: P) -> Result<SessionEvent>
    where
        P: FnMut(&SessionEvent) -> bool,
    {
        self.handle
            .wait_for(&mut self.events, predicate)
            .await
            .with_context(|| format!("{} waiting for {what}", self.name))
    }

    async fn stop(self) {
        if let Err(err) = self.handle.leave().await {
            warn!(participant = self.name, error = %err, "Leave failed");
        }
        self.handle.shutdown();
        if let Err(err) = self.task.await {
            warn!(participant = self.name, error = %err, "Session task ended abnormally");
        }
    }
}

pub struct Runner {
    config: Config,
    factory: Arc<dyn PeerConnectionFactory>,
    room: RoomId,
}

impl Runner {
    pub fn new(config: Config, factory: Arc<dyn PeerConnectionFactory>, room: RoomId) -> Self {
        Self { config, factory, room }
    }

    pub async fn run(&self, scenario: Scenario) -> Result<ScenarioReport> {
        info!(scenario = ?scenario, room_id = %self.room, "Running scenario");

        let hub = RelayHub::new();
        let mut alice = self.participant(&hub, "alice", "sockA", "alice@example.com");
        let mut bob = self.participant(&hub, "bob", "sockB", "bob@example.com");

        self.join_both(&mut alice, &mut bob).await?;

        match scenario {
            Scenario::Call => Self::call(&mut alice, &mut bob).await?,
            Scenario::Renegotiate => {
                Self::call(&mut alice, &mut bob).await?;
                Self::screen_share(&mut alice, &mut bob).await?;
            }
            Scenario::Glare => Self::glare(&mut alice, &mut bob).await?,
            Scenario::All => anyhow::bail!("`all` expands into individual scenarios"),
        }

        let report = ScenarioReport {
            scenario,
            room: self.room.clone(),
            occupants: hub.occupants(&self.room),
            participants: vec![alice.handle.snapshot().await?, bob.handle.snapshot().await?],
        };

        alice.stop().await;
        bob.stop().await;
        info!(scenario = ?scenario, "Scenario complete");
        Ok(report)
    }

    fn participant(&self, hub: &RelayHub, name: &'static str, id: &str, email: &str) -> Participant {
        let link = hub.connect_as(ConnectionId::from(id)).unwrap_or_else(|_| hub.connect());
        let channel = SignalingChannel::connect(link);
        let media = Arc::new(SyntheticMediaSource::new(name));
        let (handle, task) = CallSession::spawn(
            channel,
            Arc::clone(&self.factory),
            media.clone(),
            SessionOptions::from_config(email, &self.config),
        );
        let events = handle.subscribe();

        Participant {
            name,
            handle,
            events,
            media,
            task,
        }
    }

    async fn join_both(&self, alice: &mut Participant, bob: &mut Participant) -> Result<()> {
        alice.handle.join(self.room.clone()).await?;
        alice.wait("join ack", |e| matches!(e, SessionEvent::Joined { .. })).await?;

        bob.handle.join(self.room.clone()).await?;
        bob.wait("join ack", |e| matches!(e, SessionEvent::Joined { .. })).await?;
        alice.wait("bob", |e| matches!(e, SessionEvent::PeerJoined { .. })).await?;
        Ok(())
    }

    /// Alice calls; each side then sends its local stream
    async fn call(alice: &mut Participant, bob: &mut Participant) -> Result<()> {
        alice.handle.call().await?;
        bob.wait("incoming call", |e| matches!(e, SessionEvent::Connected { .. })).await?;
        alice.wait("answer", |e| matches!(e, SessionEvent::Connected { .. })).await?;

        // Alice's tracks go out in a renegotiation once the call connects
        alice.wait("alice streams", |e| matches!(e, SessionEvent::Renegotiated { .. })).await?;

        bob.handle.send_streams().await?;
        bob.wait("bob streams", |e| matches!(e, SessionEvent::Renegotiated { .. })).await?;
        Ok(())
    }

    async fn screen_share(alice: &mut Participant, bob: &mut Participant) -> Result<()> {
        let screen = alice.media.screen_share();
        let stream: StreamId = alice.handle.add_track(screen).await?;
        info!(stream_id = %stream, "Alice shares a screen");

        alice.wait("screen share", |e| matches!(e, SessionEvent::Renegotiated { .. })).await?;
        let snapshot = bob.handle.snapshot().await?;
        info!(remote_streams = snapshot.remote_streams.len(), "Bob after screen share");
        Ok(())
    }

    async fn glare(alice: &mut Participant, bob: &mut Participant) -> Result<()> {
        let (from_alice, from_bob) = tokio::join!(alice.handle.call(), bob.handle.call());
        if let Err(err) = &from_alice {
            info!(error = %err, "Alice's call lost the race");
        }
        if let Err(err) = &from_bob {
            info!(error = %err, "Bob's call lost the race");
        }

        alice.wait("connection", |e| matches!(e, SessionEvent::Connected { .. })).await?;
        bob.wait("connection", |e| matches!(e, SessionEvent::Connected { .. })).await?;
        Ok(())
    }
}
