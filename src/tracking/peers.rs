//! Connected peers of one role together with their ranging sessions

use crate::core::{ConnectionState, Destination, Peer, PeerDescriptor, PeerId, RangingSample};
use crate::processing::DiscoveryToken;
use crate::ranging::{
    RangingCapability, RangingError, RangingResult, RangingSessionManager, RemovalReason,
    SessionOutcome, SessionState, TokenOutcome,
};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Peer arena keyed by [`PeerId`], plus the session manager for those peers
#[derive(Debug)]
pub struct PeerCollection {
    label: &'static str,
    peers: HashMap<PeerId, Peer>,
    /// Connection order, oldest first
    order: Vec<PeerId>,
    sessions: RangingSessionManager,
}

impl PeerCollection {
    pub fn new(label: &'static str, max_timeout_retries: u32) -> Self {
        Self {
            label,
            peers: HashMap::new(),
            order: Vec::new(),
            sessions: RangingSessionManager::new(label, max_timeout_retries),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Peer> {
        self.peers.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn sessions(&self) -> &RangingSessionManager {
        &self.sessions
    }

    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.state(peer)
    }

    /// All tracked peers, including those waiting out their removal grace
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|id| self.peers.get(id))
    }

    /// Connected peers in connection order
    pub fn connected(&self) -> impl Iterator<Item = &Peer> {
        self.peers().filter(|peer| peer.is_connected())
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    pub fn first_connected(&self) -> Option<&Peer> {
        self.connected().next()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map_or(false, |p| p.is_connected())
    }

    /// Track a newly connected peer and create its ranging session. The
    /// returned token must be shared with the peer.
    pub fn connect(
        &mut self,
        descriptor: PeerDescriptor,
        capability: &mut dyn RangingCapability,
    ) -> RangingResult<DiscoveryToken> {
        let id = descriptor.peer_id();
        match self.peers.get_mut(&id) {
            Some(existing) => {
                debug!(group = self.label, peer = %id, "peer reconnected");
                existing.descriptor = descriptor;
                existing.last_sample = None;
                existing.set_state(ConnectionState::Connected);
            }
            None => {
                self.peers.insert(id.clone(), Peer::new(descriptor));
                self.order.push(id.clone());
            }
        }
        self.sessions.peer_connected(&id, capability)
    }

    pub fn mark_token_shared(&mut self, peer: &PeerId) {
        if let Some(p) = self.peers.get_mut(peer) {
            if p.connection_state == ConnectionState::Connected {
                p.set_state(ConnectionState::TokenExchanged);
            }
        }
    }

    pub fn token_received(
        &mut self,
        peer: &PeerId,
        token: DiscoveryToken,
        capability: &mut dyn RangingCapability,
    ) -> RangingResult<TokenOutcome> {
        if !self.is_connected(peer) {
            return Err(RangingError::NoSession {
                peer: peer.to_string(),
            });
        }
        self.sessions.token_received(peer, token, capability)
    }

    /// Store a sample from an active session. Returns false when the sample
    /// was dropped.
    pub fn apply_sample(&mut self, peer: &PeerId, sample: RangingSample) -> bool {
        let Some(p) = self.peers.get_mut(peer).filter(|p| p.is_connected()) else {
            trace!(group = self.label, peer = %peer, "sample for unknown peer dropped");
            return false;
        };
        if !self.sessions.record_sample(peer, sample.clone()) {
            trace!(group = self.label, peer = %peer, "sample without active session dropped");
            return false;
        }
        p.last_sample = Some(sample);
        p.set_state(ConnectionState::Tracking);
        true
    }

    pub fn set_destination(&mut self, peer: &PeerId, destination: Destination) -> bool {
        match self.peers.get_mut(peer) {
            Some(p) => {
                p.descriptor.destination = Some(destination);
                p.last_update_ms = crate::core::now_ms();
                true
            }
            None => false,
        }
    }

    pub fn suspended(&mut self, peer: &PeerId) -> RangingResult<()> {
        self.sessions.suspended(peer)
    }

    pub fn suspension_ended(&mut self, peer: &PeerId, capability: &mut dyn RangingCapability) -> RangingResult<()> {
        self.sessions.suspension_ended(peer, capability)
    }

    pub fn removed(
        &mut self,
        peer: &PeerId,
        reason: RemovalReason,
        capability: &mut dyn RangingCapability,
    ) -> SessionOutcome {
        let outcome = self.sessions.removed(peer, reason, capability);
        self.after_outcome(peer, &outcome);
        outcome
    }

    pub fn invalidated(
        &mut self,
        peer: &PeerId,
        error: RangingError,
        capability: &mut dyn RangingCapability,
    ) -> SessionOutcome {
        let outcome = self.sessions.invalidated(peer, error, capability);
        self.after_outcome(peer, &outcome);
        outcome
    }

    fn after_outcome(&mut self, peer: &PeerId, outcome: &SessionOutcome) {
        if let Some(p) = self.peers.get_mut(peer) {
            match outcome {
                SessionOutcome::Restarted { .. } | SessionOutcome::Failed(_) => {
                    p.last_sample = None;
                    p.set_state(ConnectionState::Connected);
                }
                SessionOutcome::Rearmed { .. } | SessionOutcome::Unchanged => {}
            }
        }
    }

    /// Link went away: drop the session and keep the peer as disconnected
    /// until [`purge`](Self::purge) is called.
    pub fn mark_disconnected(&mut self, peer: &PeerId, capability: &mut dyn RangingCapability) -> bool {
        self.sessions.peer_disconnected(peer, capability);
        match self.peers.get_mut(peer) {
            Some(p) if p.is_connected() => {
                p.set_state(ConnectionState::Disconnected);
                true
            }
            _ => false,
        }
    }

    /// Remove a peer that is still disconnected. A peer that reconnected
    /// during its grace period is kept.
    pub fn purge(&mut self, peer: &PeerId) -> Option<Peer> {
        if self.is_connected(peer) {
            return None;
        }
        let removed = self.peers.remove(peer)?;
        self.order.retain(|id| id != peer);
        debug!(group = self.label, peer = %peer, "peer removed");
        Some(removed)
    }

    /// Invalidate every session and mark every peer disconnected
    pub fn disconnect_all(&mut self, capability: &mut dyn RangingCapability) -> usize {
        let count = self.sessions.invalidate_all(capability);
        for peer in self.peers.values_mut() {
            if peer.is_connected() {
                peer.set_state(ConnectionState::Disconnected);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use crate::ranging::MockRangingCapability;

    fn anchor(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(Role::Anchor, id, id.to_uppercase())
    }

    #[test]
    fn test_connect_and_track() {
        let mut peers = PeerCollection::new("anchors", 3);
        let (mut capability, _probe) = MockRangingCapability::new();
        let a = anchor("a").peer_id();

        peers.connect(anchor("a"), &mut capability).unwrap();
        peers.mark_token_shared(&a);
        assert_eq!(peers.get(&a).unwrap().connection_state, ConnectionState::TokenExchanged);

        peers
            .token_received(&a, DiscoveryToken::new(vec![5]), &mut capability)
            .unwrap();
        assert!(peers.apply_sample(&a, RangingSample::new(Some(2.5), None)));
        assert_eq!(peers.get(&a).unwrap().connection_state, ConnectionState::Tracking);
        assert_eq!(peers.get(&a).unwrap().last_distance(), Some(2.5));
    }

    #[test]
    fn test_sample_before_token_dropped() {
        let mut peers = PeerCollection::new("anchors", 3);
        let (mut capability, _probe) = MockRangingCapability::new();
        let a = anchor("a").peer_id();
        peers.connect(anchor("a"), &mut capability).unwrap();

        assert!(!peers.apply_sample(&a, RangingSample::new(Some(1.0), None)));
        assert!(peers.get(&a).unwrap().last_sample.is_none());
    }

    #[test]
    fn test_grace_period_reconnect_keeps_peer() {
        let mut peers = PeerCollection::new("anchors", 3);
        let (mut capability, _probe) = MockRangingCapability::new();
        let a = anchor("a").peer_id();

        peers.connect(anchor("a"), &mut capability).unwrap();
        assert!(peers.mark_disconnected(&a, &mut capability));
        assert_eq!(peers.connected_count(), 0);
        assert!(peers.sessions().is_empty());

        peers.connect(anchor("a"), &mut capability).unwrap();
        assert!(peers.purge(&a).is_none());
        assert_eq!(peers.connected_count(), 1);
        assert_eq!(peers.sessions().len(), 1);
    }

    #[test]
    fn test_purge_disconnected_peer() {
        let mut peers = PeerCollection::new("anchors", 3);
        let (mut capability, _probe) = MockRangingCapability::new();
        let a = anchor("a").peer_id();

        peers.connect(anchor("a"), &mut capability).unwrap();
        peers.mark_disconnected(&a, &mut capability);
        assert!(peers.purge(&a).is_some());
        assert!(!peers.contains(&a));
    }

    #[test]
    fn test_connection_order() {
        let mut peers = PeerCollection::new("anchors", 3);
        let (mut capability, _probe) = MockRangingCapability::new();
        peers.connect(anchor("z"), &mut capability).unwrap();
        peers.connect(anchor("b"), &mut capability).unwrap();

        assert_eq!(peers.first_connected().map(|p| p.id()), Some(anchor("z").peer_id()));
        peers.mark_disconnected(&anchor("z").peer_id(), &mut capability);
        assert_eq!(peers.first_connected().map(|p| p.id()), Some(anchor("b").peer_id()));
    }

    #[test]
    fn test_one_session_per_peer_across_lifecycle() {
        let mut peers = PeerCollection::new("anchors", 1);
        let (mut capability, probe) = MockRangingCapability::new();
        let a = anchor("a").peer_id();

        peers.connect(anchor("a"), &mut capability).unwrap();
        peers.token_received(&a, DiscoveryToken::new(vec![1]), &mut capability).unwrap();
        peers.suspended(&a).unwrap();
        peers.suspension_ended(&a, &mut capability).unwrap();
        peers.removed(&a, RemovalReason::Timeout, &mut capability);
        peers.removed(&a, RemovalReason::Timeout, &mut capability);
        assert_eq!(peers.sessions().len(), 1);
        peers.invalidated(&a, RangingError::SessionFailed { details: "x".into() }, &mut capability);
        assert_eq!(peers.sessions().len(), 1);
        assert_eq!(peers.get(&a).unwrap().connection_state, ConnectionState::Connected);

        peers.mark_disconnected(&a, &mut capability);
        assert_eq!(peers.sessions().len(), 0);
        assert!(probe.running().is_empty());
    }
}
