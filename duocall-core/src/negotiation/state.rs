use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use super::{
    Effect, FailureKind, NegotiationEvent, NegotiationFailure, NegotiationPolicy, Phase, Role, RoundKind,
};
use crate::models::{ConnectionId, SessionDescription};
use crate::protocol::{AnswerTo, ClientMessage, OfferTo};

/// Negotiation state of one peer pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Negotiation {
    local: ConnectionId,
    remote: ConnectionId,
    phase: Phase,
    role: Role,
    connected: bool,
    renegotiation_queued: bool,
    /// Our offer awaiting the remote answer
    #[serde(skip)]
    offer_in_flight: Option<SessionDescription>,
    rounds_completed: u32,
    #[serde(skip)]
    policy: NegotiationPolicy,
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: Negotiation,
    pub effects: Vec<Effect>,
}

impl Negotiation {
    #[must_use]
    pub const fn new(local: ConnectionId, remote: ConnectionId, policy: NegotiationPolicy) -> Self {
        Self {
            local,
            remote,
            phase: Phase::Idle,
            role: Role::None,
            connected: false,
            renegotiation_queued: false,
            offer_in_flight: None,
            rounds_completed: 0,
            policy,
        }
    }

    #[must_use]
    pub const fn local(&self) -> &ConnectionId {
        &self.local
    }

    #[must_use]
    pub const fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn renegotiation_queued(&self) -> bool {
        self.renegotiation_queued
    }

    #[must_use]
    pub const fn offer_in_flight(&self) -> bool {
        self.offer_in_flight.is_some()
    }

    #[must_use]
    pub const fn rounds_completed(&self) -> u32 {
        self.rounds_completed
    }

    /// Apply `event` and return the next state with its effects
    #[must_use]
    pub fn step(self, event: NegotiationEvent) -> Transition {
        let before = self.phase;
        let transition = match event {
            NegotiationEvent::CallRequested => self.on_call_requested(),
            NegotiationEvent::OfferCreated(offer) => self.on_offer_created(offer),
            NegotiationEvent::RemoteOffer { from, kind, offer } => self.on_remote_offer(&from, kind, offer),
            NegotiationEvent::AnswerCreated(answer) => self.on_answer_created(answer),
            NegotiationEvent::AnswerSent => self.on_answer_sent(),
            NegotiationEvent::RemoteAnswer { from, kind, answer } => self.on_remote_answer(&from, kind, answer),
            NegotiationEvent::AnswerApplied => self.on_answer_applied(),
            NegotiationEvent::NegotiationNeeded => self.on_negotiation_needed(),
            NegotiationEvent::Failed(failure) => self.on_failed(failure),
        };

        if transition.state.phase != before {
            debug!(
                peer = %transition.state.remote,
                from = %before,
                to = %transition.state.phase,
                connected = transition.state.connected,
                "Negotiation phase changed"
            );
        }
        transition
    }

    fn on_call_requested(self) -> Transition {
        if !self.phase.is_idle() {
            let detail = format!("cannot call while negotiation is {}", self.phase);
            return self.reject(NegotiationFailure::invalid_state(detail));
        }
        if self.connected {
            return self.reject(NegotiationFailure::invalid_state("already connected"));
        }

        Transition {
            state: Self {
                phase: Phase::OfferSent(RoundKind::Initial),
                role: Role::Initiator,
                ..self
            },
            effects: vec![Effect::AcquireMedia, Effect::CreateOffer],
        }
    }

    fn on_offer_created(self, offer: SessionDescription) -> Transition {
        let Phase::OfferSent(kind) = self.phase else {
            // The round was abandoned while the offer was being produced
            return self.unchanged(vec![Effect::DiscardLocalOffer]);
        };
        if self.offer_in_flight.is_some() {
            return self.unchanged(vec![Effect::DiscardLocalOffer]);
        }

        let payload = OfferTo {
            to: self.remote.clone(),
            offer: offer.clone(),
        };
        let message = match kind {
            RoundKind::Initial => ClientMessage::UserCall(payload),
            RoundKind::Renegotiation => ClientMessage::PeerNegoNeeded(payload),
        };

        Transition {
            state: Self {
                offer_in_flight: Some(offer),
                ..self
            },
            effects: vec![Effect::Emit(message)],
        }
    }

    fn on_remote_offer(self, from: &ConnectionId, kind: RoundKind, offer: SessionDescription) -> Transition {
        if from != &self.remote {
            let detail = format!("offer from {from}, expected {}", self.remote);
            return self.reject(NegotiationFailure::invalid_state(detail));
        }

        match (self.phase, kind) {
            (Phase::Idle, RoundKind::Initial) if self.connected => {
                self.reject(NegotiationFailure::invalid_state("initial offer on a connected session"))
            }
            (Phase::Idle, RoundKind::Renegotiation) if !self.connected => {
                self.abort(NegotiationFailure::invalid_state("renegotiation offer before the call connected"))
            }
            (Phase::Idle, _) => self.answer(kind, offer),
            (Phase::OfferSent(ours), theirs) if ours == theirs => self.resolve_glare(kind, offer),
            (phase, _) => {
                let detail = format!("{kind} offer while {phase}");
                self.abort(NegotiationFailure::invalid_state(detail))
            }
        }
    }

    /// Both sides sent an offer of the same kind: the lesser handle's offer wins
    fn resolve_glare(self, kind: RoundKind, offer: SessionDescription) -> Transition {
        match self.local.cmp(&self.remote) {
            Ordering::Less => {
                info!(peer = %self.remote, round = %kind, "Glare: keeping local offer");
                self.unchanged(Vec::new())
            }
            Ordering::Greater => {
                info!(peer = %self.remote, round = %kind, "Glare: yielding to remote offer");
                let requeue = kind == RoundKind::Renegotiation;
                let yielded = Self {
                    offer_in_flight: None,
                    renegotiation_queued: self.renegotiation_queued || requeue,
                    ..self
                };
                let mut transition = yielded.answer(kind, offer);
                transition.effects.insert(0, Effect::DiscardLocalOffer);
                transition
            }
            Ordering::Equal => {
                let detail = format!("both sides use handle {}", self.local);
                self.abort(NegotiationFailure::new(FailureKind::Glare, detail))
            }
        }
    }

    fn answer(self, kind: RoundKind, offer: SessionDescription) -> Transition {
        let mut effects = Vec::with_capacity(3);
        if kind == RoundKind::Initial {
            effects.push(Effect::AcquireMedia);
            if self.policy.attach_tracks_on_answer {
                effects.push(Effect::AttachLocalTracks);
            }
        }
        effects.push(Effect::CreateAnswer(offer));

        Transition {
            state: Self {
                phase: Phase::Answering(kind),
                role: Role::Responder,
                ..self
            },
            effects,
        }
    }

    fn on_answer_created(self, answer: SessionDescription) -> Transition {
        let Phase::Answering(kind) = self.phase else {
            let detail = format!("answer produced while {}", self.phase);
            return self.reject(NegotiationFailure::invalid_state(detail));
        };

        let payload = AnswerTo {
            to: self.remote.clone(),
            ans: answer,
        };
        let message = match kind {
            RoundKind::Initial => ClientMessage::CallAccepted(payload),
            RoundKind::Renegotiation => ClientMessage::PeerNegoDone(payload),
        };

        // The round only counts once the answer is on its way
        self.unchanged(vec![Effect::Emit(message)])
    }

    fn on_answer_sent(self) -> Transition {
        let Phase::Answering(kind) = self.phase else {
            let detail = format!("answer sent while {}", self.phase);
            return self.reject(NegotiationFailure::invalid_state(detail));
        };

        let state = Self {
            phase: Phase::Idle,
            connected: true,
            rounds_completed: self.rounds_completed + 1,
            ..self
        };
        state.settle(vec![Effect::Connected(kind)])
    }

    fn on_remote_answer(self, from: &ConnectionId, kind: RoundKind, answer: SessionDescription) -> Transition {
        if from != &self.remote {
            let detail = format!("answer from {from}, expected {}", self.remote);
            return self.reject(NegotiationFailure::stale(detail));
        }

        match self.phase {
            Phase::OfferSent(ours) if ours == kind && self.offer_in_flight.is_some() => Transition {
                state: Self {
                    offer_in_flight: None,
                    ..self
                },
                effects: vec![Effect::ApplyAnswer(answer)],
            },
            Phase::Idle => {
                let detail = format!("{kind} answer with no offer outstanding");
                self.reject(NegotiationFailure::stale(detail))
            }
            phase => {
                let detail = format!("{kind} answer while {phase}");
                self.abort(NegotiationFailure::stale(detail))
            }
        }
    }

    fn on_answer_applied(self) -> Transition {
        let Phase::OfferSent(kind) = self.phase else {
            let detail = format!("answer applied while {}", self.phase);
            return self.reject(NegotiationFailure::invalid_state(detail));
        };

        let mut effects = vec![Effect::Connected(kind)];
        if kind == RoundKind::Initial {
            effects.push(Effect::AttachLocalTracks);
        }

        let state = Self {
            phase: Phase::Idle,
            connected: true,
            rounds_completed: self.rounds_completed + 1,
            ..self
        };
        state.settle(effects)
    }

    fn on_negotiation_needed(self) -> Transition {
        if self.phase.is_idle() && self.connected {
            return self.start_renegotiation(Vec::new());
        }

        debug!(peer = %self.remote, phase = %self.phase, "Renegotiation deferred");
        Transition {
            state: Self {
                renegotiation_queued: true,
                ..self
            },
            effects: Vec::new(),
        }
    }

    fn on_failed(self, failure: NegotiationFailure) -> Transition {
        if self.phase.is_idle() {
            return self.reject(failure);
        }
        self.abort(failure)
    }

    fn start_renegotiation(self, mut effects: Vec<Effect>) -> Transition {
        effects.push(Effect::CreateOffer);
        Transition {
            state: Self {
                phase: Phase::OfferSent(RoundKind::Renegotiation),
                role: Role::Initiator,
                renegotiation_queued: false,
                ..self
            },
            effects,
        }
    }

    /// Start a deferred renegotiation once the pair is idle and connected
    fn settle(self, effects: Vec<Effect>) -> Transition {
        if self.renegotiation_queued && self.connected && self.phase.is_idle() {
            debug!(peer = %self.remote, "Starting deferred renegotiation");
            return self.start_renegotiation(effects);
        }
        Transition { state: self, effects }
    }

    /// Abandon the current round; `connected` survives
    fn abort(self, failure: NegotiationFailure) -> Transition {
        warn!(
            peer = %self.remote,
            phase = %self.phase,
            kind = ?failure.kind,
            detail = %failure.detail,
            "Negotiation round aborted"
        );
        Transition {
            state: Self {
                phase: Phase::Idle,
                offer_in_flight: None,
                ..self
            },
            effects: vec![Effect::ResetPeer, Effect::Surface(failure)],
        }
    }

    /// Refuse an event without disturbing the current round
    fn reject(self, failure: NegotiationFailure) -> Transition {
        debug!(peer = %self.remote, phase = %self.phase, detail = %failure.detail, "Negotiation event rejected");
        self.unchanged(vec![Effect::Surface(failure)])
    }

    fn unchanged(self, effects: Vec<Effect>) -> Transition {
        Transition { state: self, effects }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(local: &str, remote: &str) -> Negotiation {
        Negotiation::new(
            ConnectionId::from(local),
            ConnectionId::from(remote),
            NegotiationPolicy::default(),
        )
    }

    fn offer(tag: &str) -> SessionDescription {
        SessionDescription::offer(format!("v=0\r\ns={tag}\r\n"))
    }

    fn answer(tag: &str) -> SessionDescription {
        SessionDescription::answer(format!("v=0\r\ns={tag}\r\n"))
    }

    fn remote_offer(from: &str, kind: RoundKind, tag: &str) -> NegotiationEvent {
        NegotiationEvent::RemoteOffer {
            from: ConnectionId::from(from),
            kind,
            offer: offer(tag),
        }
    }

    fn remote_answer(from: &str, kind: RoundKind, tag: &str) -> NegotiationEvent {
        NegotiationEvent::RemoteAnswer {
            from: ConnectionId::from(from),
            kind,
            answer: answer(tag),
        }
    }

    /// Run the offering side of an initial call up to the emitted offer
    fn offered(state: Negotiation) -> Negotiation {
        let t = state.step(NegotiationEvent::CallRequested);
        let t = t.state.step(NegotiationEvent::OfferCreated(offer("local")));
        t.state
    }

    fn connected(local: &str, remote: &str) -> Negotiation {
        let state = offered(pair(local, remote));
        let t = state.step(remote_answer(remote, RoundKind::Initial, "ans"));
        t.state.step(NegotiationEvent::AnswerApplied).state
    }

    /// Produce and send the answer for the pending remote offer
    fn answered(state: Negotiation, tag: &str) -> Negotiation {
        let t = state.step(NegotiationEvent::AnswerCreated(answer(tag)));
        t.state.step(NegotiationEvent::AnswerSent).state
    }

    fn has_surface(effects: &[Effect], kind: FailureKind) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::Surface(f) if f.kind == kind))
    }

    #[test]
    fn test_initial_offer_round() {
        let t = pair("sockA", "sockB").step(NegotiationEvent::CallRequested);
        assert_eq!(t.state.phase(), Phase::OfferSent(RoundKind::Initial));
        assert_eq!(t.effects, vec![Effect::AcquireMedia, Effect::CreateOffer]);

        let t = t.state.step(NegotiationEvent::OfferCreated(offer("a")));
        assert!(t.state.offer_in_flight());
        assert_eq!(
            t.effects,
            vec![Effect::Emit(ClientMessage::UserCall(OfferTo {
                to: ConnectionId::from("sockB"),
                offer: offer("a"),
            }))]
        );

        let t = t.state.step(remote_answer("sockB", RoundKind::Initial, "b"));
        assert_eq!(t.effects, vec![Effect::ApplyAnswer(answer("b"))]);
        assert!(!t.state.offer_in_flight());

        let t = t.state.step(NegotiationEvent::AnswerApplied);
        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(t.state.is_connected());
        assert_eq!(t.state.rounds_completed(), 1);
        assert_eq!(
            t.effects,
            vec![Effect::Connected(RoundKind::Initial), Effect::AttachLocalTracks]
        );
    }

    #[test]
    fn test_answer_side_initial_round() {
        let t = pair("sockB", "sockA").step(remote_offer("sockA", RoundKind::Initial, "a"));
        assert_eq!(t.state.phase(), Phase::Answering(RoundKind::Initial));
        assert_eq!(t.state.role(), Role::Responder);
        assert_eq!(t.effects, vec![Effect::AcquireMedia, Effect::CreateAnswer(offer("a"))]);

        let t = t.state.step(NegotiationEvent::AnswerCreated(answer("b")));
        assert!(!t.state.is_connected());
        assert_eq!(t.state.phase(), Phase::Answering(RoundKind::Initial));
        assert_eq!(
            t.effects,
            vec![Effect::Emit(ClientMessage::CallAccepted(AnswerTo {
                to: ConnectionId::from("sockA"),
                ans: answer("b"),
            }))]
        );

        let t = t.state.step(NegotiationEvent::AnswerSent);
        assert!(t.state.is_connected());
        assert_eq!(t.state.phase(), Phase::Idle);
        assert_eq!(t.state.rounds_completed(), 1);
        assert_eq!(t.effects, vec![Effect::Connected(RoundKind::Initial)]);
    }

    #[test]
    fn test_failed_answer_send_leaves_call_open() {
        let t = pair("sockB", "sockA").step(remote_offer("sockA", RoundKind::Initial, "a"));
        let t = t.state.step(NegotiationEvent::AnswerCreated(answer("b")));
        let t = t.state.step(NegotiationEvent::Failed(NegotiationFailure::new(
            FailureKind::SignalingDelivery,
            "relay gone",
        )));

        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(!t.state.is_connected());
        assert_eq!(t.state.rounds_completed(), 0);
        assert!(t.effects.contains(&Effect::ResetPeer));
        assert!(has_surface(&t.effects, FailureKind::SignalingDelivery));

        // Either side may try again
        let t = t.state.step(NegotiationEvent::CallRequested);
        assert_eq!(t.effects, vec![Effect::AcquireMedia, Effect::CreateOffer]);
    }

    #[test]
    fn test_answer_sent_without_answering_rejected() {
        let state = pair("sockB", "sockA");
        let t = state.clone().step(NegotiationEvent::AnswerSent);
        assert_eq!(t.state, state);
        assert!(has_surface(&t.effects, FailureKind::InvalidState));
    }

    #[test]
    fn test_attach_on_answer_policy() {
        let state = Negotiation::new(
            ConnectionId::from("sockB"),
            ConnectionId::from("sockA"),
            NegotiationPolicy {
                attach_tracks_on_answer: true,
            },
        );
        let t = state.step(remote_offer("sockA", RoundKind::Initial, "a"));
        assert_eq!(
            t.effects,
            vec![
                Effect::AcquireMedia,
                Effect::AttachLocalTracks,
                Effect::CreateAnswer(offer("a")),
            ]
        );
    }

    #[test]
    fn test_call_rejected_when_busy_or_connected() {
        let busy = offered(pair("sockA", "sockB"));
        let t = busy.clone().step(NegotiationEvent::CallRequested);
        assert_eq!(t.state, busy);
        assert!(has_surface(&t.effects, FailureKind::InvalidState));

        let live = connected("sockA", "sockB");
        let t = live.clone().step(NegotiationEvent::CallRequested);
        assert_eq!(t.state, live);
        assert!(has_surface(&t.effects, FailureKind::InvalidState));
    }

    #[test]
    fn test_answer_never_reenters_offer_sent() {
        let state = connected("sockA", "sockB");
        let t = state.step(remote_answer("sockB", RoundKind::Initial, "dup"));

        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(t.state.is_connected());
        assert!(has_surface(&t.effects, FailureKind::StaleDescription));
        assert!(!t.effects.contains(&Effect::ResetPeer));
    }

    #[test]
    fn test_glare_lesser_handle_keeps_offer() {
        let state = offered(pair("sockA", "sockB"));
        let t = state.clone().step(remote_offer("sockB", RoundKind::Initial, "b"));

        assert_eq!(t.state, state);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_glare_greater_handle_yields() {
        let state = offered(pair("sockB", "sockA"));
        let t = state.step(remote_offer("sockA", RoundKind::Initial, "a"));

        assert_eq!(t.state.phase(), Phase::Answering(RoundKind::Initial));
        assert!(!t.state.offer_in_flight());
        assert_eq!(t.effects[0], Effect::DiscardLocalOffer);
        assert_eq!(t.effects.last(), Some(&Effect::CreateAnswer(offer("a"))));
    }

    #[test]
    fn test_glare_resolves_to_one_connection() {
        let a = offered(pair("sockA", "sockB"));
        let b = offered(pair("sockB", "sockA"));

        // Each side receives the other's offer
        let a = a.step(remote_offer("sockB", RoundKind::Initial, "b")).state;
        let t = b.step(remote_offer("sockA", RoundKind::Initial, "a"));
        let b = answered(t.state, "b");

        let t = a.step(remote_answer("sockB", RoundKind::Initial, "b"));
        let a = t.state.step(NegotiationEvent::AnswerApplied).state;

        assert!(a.is_connected() && b.is_connected());
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Responder);
        assert_eq!(a.rounds_completed() + b.rounds_completed(), 2);
    }

    #[test]
    fn test_glare_equal_handles_aborts() {
        let state = offered(pair("sockA", "sockA"));
        let t = state.step(remote_offer("sockA", RoundKind::Initial, "x"));

        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(t.effects.contains(&Effect::ResetPeer));
        assert!(has_surface(&t.effects, FailureKind::Glare));
    }

    #[test]
    fn test_offer_from_stranger_rejected() {
        let state = pair("sockA", "sockB");
        let t = state.clone().step(remote_offer("sockC", RoundKind::Initial, "c"));
        assert_eq!(t.state, state);
        assert!(has_surface(&t.effects, FailureKind::InvalidState));
    }

    #[test]
    fn test_renegotiation_round() {
        let state = connected("sockA", "sockB");
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        assert_eq!(t.state.phase(), Phase::OfferSent(RoundKind::Renegotiation));
        assert_eq!(t.effects, vec![Effect::CreateOffer]);

        let t = t.state.step(NegotiationEvent::OfferCreated(offer("r")));
        assert!(matches!(t.effects[0], Effect::Emit(ClientMessage::PeerNegoNeeded(_))));

        let t = t.state.step(remote_answer("sockB", RoundKind::Renegotiation, "r"));
        let t = t.state.step(NegotiationEvent::AnswerApplied);
        assert_eq!(t.state.phase(), Phase::Idle);
        assert_eq!(t.effects, vec![Effect::Connected(RoundKind::Renegotiation)]);
        assert_eq!(t.state.rounds_completed(), 2);
    }

    #[test]
    fn test_renegotiation_answer_side() {
        let t = pair("sockB", "sockA").step(remote_offer("sockA", RoundKind::Initial, "a"));
        let state = answered(t.state, "b");

        let t = state.step(remote_offer("sockA", RoundKind::Renegotiation, "r"));
        assert_eq!(t.state.phase(), Phase::Answering(RoundKind::Renegotiation));
        assert_eq!(t.effects, vec![Effect::CreateAnswer(offer("r"))]);

        let t = t.state.step(NegotiationEvent::AnswerCreated(answer("r")));
        assert!(matches!(t.effects[0], Effect::Emit(ClientMessage::PeerNegoDone(_))));
    }

    #[test]
    fn test_second_trigger_deferred_and_coalesced() {
        let state = connected("sockA", "sockB");
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        let t = t.state.step(NegotiationEvent::NegotiationNeeded);
        let t = t.state.step(NegotiationEvent::NegotiationNeeded);
        assert!(t.effects.is_empty());
        assert!(t.state.renegotiation_queued());

        let t = t.state.step(NegotiationEvent::OfferCreated(offer("r1")));
        let t = t.state.step(remote_answer("sockB", RoundKind::Renegotiation, "r1"));
        let t = t.state.step(NegotiationEvent::AnswerApplied);

        // Exactly one deferred round starts
        assert_eq!(t.state.phase(), Phase::OfferSent(RoundKind::Renegotiation));
        assert!(!t.state.renegotiation_queued());
        assert_eq!(
            t.effects,
            vec![Effect::Connected(RoundKind::Renegotiation), Effect::CreateOffer]
        );
    }

    #[test]
    fn test_trigger_before_connection_waits() {
        let state = offered(pair("sockA", "sockB"));
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        assert!(t.effects.is_empty());

        let t = t.state.step(remote_answer("sockB", RoundKind::Initial, "b"));
        let t = t.state.step(NegotiationEvent::AnswerApplied);
        assert_eq!(t.state.phase(), Phase::OfferSent(RoundKind::Renegotiation));
        assert_eq!(
            t.effects,
            vec![
                Effect::Connected(RoundKind::Initial),
                Effect::AttachLocalTracks,
                Effect::CreateOffer,
            ]
        );
    }

    #[test]
    fn test_renegotiation_glare_requeues_loser() {
        let state = connected("sockB", "sockA");
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        let state = t.state.step(NegotiationEvent::OfferCreated(offer("b"))).state;

        let t = state.step(remote_offer("sockA", RoundKind::Renegotiation, "a"));
        assert_eq!(t.state.phase(), Phase::Answering(RoundKind::Renegotiation));
        assert!(t.state.renegotiation_queued());
        assert_eq!(
            t.effects,
            vec![Effect::DiscardLocalOffer, Effect::CreateAnswer(offer("a"))]
        );

        let t = t.state.step(NegotiationEvent::AnswerCreated(answer("a")));
        let t = t.state.step(NegotiationEvent::AnswerSent);
        assert_eq!(t.state.phase(), Phase::OfferSent(RoundKind::Renegotiation));
        assert_eq!(
            t.effects,
            vec![Effect::Connected(RoundKind::Renegotiation), Effect::CreateOffer]
        );
    }

    #[test]
    fn test_renegotiation_offer_before_connected_aborts() {
        let t = pair("sockB", "sockA").step(remote_offer("sockA", RoundKind::Renegotiation, "r"));
        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(!t.state.is_connected());
        assert!(has_surface(&t.effects, FailureKind::InvalidState));
    }

    #[test]
    fn test_mismatched_answer_aborts_round() {
        let state = connected("sockA", "sockB");
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        let state = t.state.step(NegotiationEvent::OfferCreated(offer("r"))).state;

        let t = state.step(remote_answer("sockB", RoundKind::Initial, "old"));
        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(t.state.is_connected());
        assert!(!t.state.offer_in_flight());
        assert_eq!(t.effects[0], Effect::ResetPeer);
    }

    #[test]
    fn test_failure_aborts_to_idle_keeping_connection() {
        let state = connected("sockA", "sockB");
        let t = state.step(NegotiationEvent::NegotiationNeeded);
        let t = t.state.step(NegotiationEvent::Failed(NegotiationFailure::new(
            FailureKind::SignalingDelivery,
            "peer unreachable",
        )));

        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(t.state.is_connected());
        assert!(has_surface(&t.effects, FailureKind::SignalingDelivery));

        // A new round can start afterwards
        let t = t.state.step(NegotiationEvent::NegotiationNeeded);
        assert_eq!(t.effects, vec![Effect::CreateOffer]);
    }

    #[test]
    fn test_media_failure_on_call() {
        let t = pair("sockA", "sockB").step(NegotiationEvent::CallRequested);
        let t = t.state.step(NegotiationEvent::Failed(NegotiationFailure::new(
            FailureKind::MediaAcquisition,
            "denied",
        )));
        assert_eq!(t.state.phase(), Phase::Idle);
        assert!(!t.state.is_connected());
        assert!(has_surface(&t.effects, FailureKind::MediaAcquisition));
    }

    #[test]
    fn test_late_offer_is_discarded() {
        let state = pair("sockA", "sockB");
        let t = state.step(NegotiationEvent::OfferCreated(offer("late")));
        assert_eq!(t.effects, vec![Effect::DiscardLocalOffer]);
        assert!(!t.state.offer_in_flight());
    }
}
