use std::collections::HashMap;

use super::{Effect, Negotiation, NegotiationEvent, NegotiationPolicy};
use crate::models::ConnectionId;

/// Negotiation state per peer pair, keyed by the remote handle
#[derive(Debug, Clone)]
pub struct NegotiationTable {
    local: ConnectionId,
    policy: NegotiationPolicy,
    pairs: HashMap<ConnectionId, Negotiation>,
}

impl NegotiationTable {
    #[must_use]
    pub fn new(local: ConnectionId, policy: NegotiationPolicy) -> Self {
        Self {
            local,
            policy,
            pairs: HashMap::new(),
        }
    }

    /// Feed `event` to the pair with `remote`, creating it on first use
    pub fn step(&mut self, remote: &ConnectionId, event: NegotiationEvent) -> Vec<Effect> {
        let current = self
            .pairs
            .remove(remote)
            .unwrap_or_else(|| Negotiation::new(self.local.clone(), remote.clone(), self.policy));

        let transition = current.step(event);
        self.pairs.insert(remote.clone(), transition.state);
        transition.effects
    }

    #[must_use]
    pub fn get(&self, remote: &ConnectionId) -> Option<&Negotiation> {
        self.pairs.get(remote)
    }

    /// Drop the state of one pair
    pub fn remove(&mut self, remote: &ConnectionId) -> Option<Negotiation> {
        self.pairs.remove(remote)
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Negotiation> {
        self.pairs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{Phase, RoundKind};

    #[test]
    fn test_pairs_are_independent() {
        let mut table = NegotiationTable::new(ConnectionId::from("sockA"), NegotiationPolicy::default());
        let b = ConnectionId::from("sockB");
        let c = ConnectionId::from("sockC");

        table.step(&b, NegotiationEvent::CallRequested);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&b).map(Negotiation::phase), Some(Phase::OfferSent(RoundKind::Initial)));
        assert!(table.get(&c).is_none());

        table.step(&c, NegotiationEvent::NegotiationNeeded);
        assert_eq!(table.get(&c).map(Negotiation::phase), Some(Phase::Idle));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_resets_pair() {
        let mut table = NegotiationTable::new(ConnectionId::from("sockA"), NegotiationPolicy::default());
        let b = ConnectionId::from("sockB");

        table.step(&b, NegotiationEvent::CallRequested);
        assert!(table.remove(&b).is_some());
        assert!(table.is_empty());

        // A fresh pair starts idle again
        let effects = table.step(&b, NegotiationEvent::CallRequested);
        assert_eq!(effects.len(), 2);
        assert_eq!(table.get(&b).map(Negotiation::rounds_completed), Some(0));
    }
}
