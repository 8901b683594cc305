//! Owner of one ranging session per connected peer

use crate::core::{PeerId, RangingSample};
use crate::processing::DiscoveryToken;
use crate::ranging::{
    RangingCapability, RangingConfiguration, RangingError, RangingResult, RangingSession,
    RemovalReason, SessionState,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// What the manager did in response to a lifecycle callback
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Nothing changed (unknown peer or no-op)
    Unchanged,
    /// Re-armed with the last configuration after a timeout
    Rearmed { attempt: u32 },
    /// Old session invalidated and a fresh one created; the token must be shared
    Restarted { token: DiscoveryToken },
    /// Session invalidated for good, the slot is empty
    Failed(RangingError),
}

/// What applying a peer's token did to its session
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    /// Session armed for the first time
    Armed,
    /// Token already in use by the active session
    Duplicate,
    /// The peer restarted its side while ours was active. Our token has to be
    /// shared again so the peer's fresh session can arm.
    Rekeyed { reply: DiscoveryToken },
}

/// Keeps exactly one [`RangingSession`] per connected peer
#[derive(Debug)]
pub struct RangingSessionManager {
    /// Label used in log output, e.g. "anchors"
    label: &'static str,
    sessions: HashMap<PeerId, RangingSession>,
    max_timeout_retries: u32,
}

impl RangingSessionManager {
    pub fn new(label: &'static str, max_timeout_retries: u32) -> Self {
        Self {
            label,
            sessions: HashMap::new(),
            max_timeout_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn session(&self, peer: &PeerId) -> Option<&RangingSession> {
        self.sessions.get(peer)
    }

    pub fn state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(|s| s.state())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Sessions currently producing or able to produce samples
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state() == SessionState::Active)
            .count()
    }

    fn no_session(peer: &PeerId) -> RangingError {
        RangingError::NoSession {
            peer: peer.to_string(),
        }
    }

    /// Create the session for a newly connected peer and return our token,
    /// which the caller shares over the transport. Any previous session for
    /// the same peer is invalidated first.
    pub fn peer_connected(
        &mut self,
        peer: &PeerId,
        capability: &mut dyn RangingCapability,
    ) -> RangingResult<DiscoveryToken> {
        if let Some(mut previous) = self.sessions.remove(peer) {
            debug!(group = self.label, peer = %peer, "replacing stale session");
            previous.invalidate();
            capability.invalidate(peer);
        }

        let mut session = RangingSession::new(peer.clone());
        let token = capability.prepare_session(peer).map_err(|error| {
            error!(group = self.label, peer = %peer, %error, "could not create ranging session");
            error
        })?;
        session.token_shared(token.clone())?;
        self.sessions.insert(peer.clone(), session);
        debug!(group = self.label, peer = %peer, "session created, token pending");
        Ok(token)
    }

    /// Arm the peer's session with the token it sent us
    pub fn token_received(
        &mut self,
        peer: &PeerId,
        token: DiscoveryToken,
        capability: &mut dyn RangingCapability,
    ) -> RangingResult<TokenOutcome> {
        if let Some((owner, _)) = self
            .sessions
            .iter()
            .find(|(owner, s)| *owner != peer && s.peer_token() == Some(&token))
        {
            let error = RangingError::TokenConflict {
                peer: peer.to_string(),
                owner: owner.to_string(),
            };
            warn!(group = self.label, %error, "token rejected");
            return Err(error);
        }

        let session = self.sessions.get_mut(peer).ok_or_else(|| Self::no_session(peer))?;
        if session.peer_token() == Some(&token) && session.state() == SessionState::Active {
            debug!(group = self.label, peer = %peer, "duplicate token ignored");
            return Ok(TokenOutcome::Duplicate);
        }

        let rekeyed = session.state() == SessionState::Active;
        let configuration = RangingConfiguration::new(token);
        capability.run(peer, &configuration)?;
        session.arm(configuration)?;
        match session.local_token() {
            Some(reply) if rekeyed => {
                info!(group = self.label, peer = %peer, "peer restarted, session re-keyed");
                Ok(TokenOutcome::Rekeyed {
                    reply: reply.clone(),
                })
            }
            _ => {
                info!(group = self.label, peer = %peer, "ranging session active");
                Ok(TokenOutcome::Armed)
            }
        }
    }

    /// Store a sample from the platform. Returns false when the peer has no
    /// active session and the sample was dropped.
    pub fn record_sample(&mut self, peer: &PeerId, sample: RangingSample) -> bool {
        match self.sessions.get_mut(peer) {
            Some(session) => session.record_sample(sample).is_ok(),
            None => false,
        }
    }

    /// Platform paused the session
    pub fn suspended(&mut self, peer: &PeerId) -> RangingResult<()> {
        let session = self.sessions.get_mut(peer).ok_or_else(|| Self::no_session(peer))?;
        session.suspend()?;
        debug!(group = self.label, peer = %peer, "session suspended");
        Ok(())
    }

    /// Platform lifted the suspension; re-arm with the last configuration
    pub fn suspension_ended(
        &mut self,
        peer: &PeerId,
        capability: &mut dyn RangingCapability,
    ) -> RangingResult<()> {
        let session = self.sessions.get_mut(peer).ok_or_else(|| Self::no_session(peer))?;
        let configuration = session.resume()?;
        capability.run(peer, &configuration)?;
        debug!(group = self.label, peer = %peer, "session resumed");
        Ok(())
    }

    /// Platform removed the peer from its session
    pub fn removed(
        &mut self,
        peer: &PeerId,
        reason: RemovalReason,
        capability: &mut dyn RangingCapability,
    ) -> SessionOutcome {
        let Some(session) = self.sessions.get_mut(peer) else {
            return SessionOutcome::Unchanged;
        };

        if reason == RemovalReason::Timeout {
            if let Some(configuration) = session.retry_after_timeout(self.max_timeout_retries) {
                let attempt = session.timeout_retries();
                match capability.run(peer, &configuration) {
                    Ok(()) => {
                        info!(group = self.label, peer = %peer, attempt, "re-armed after timeout");
                        return SessionOutcome::Rearmed { attempt };
                    }
                    Err(error) if error.is_fatal() => return self.fail(peer, error, capability),
                    Err(error) => {
                        warn!(group = self.label, peer = %peer, %error, "re-arm failed");
                    }
                }
            } else {
                warn!(group = self.label, peer = %peer, "timeout retries exhausted");
            }
        } else {
            info!(group = self.label, peer = %peer, %reason, "peer left ranging session");
        }

        self.restart(peer, capability)
    }

    /// Platform invalidated the session
    pub fn invalidated(
        &mut self,
        peer: &PeerId,
        error: RangingError,
        capability: &mut dyn RangingCapability,
    ) -> SessionOutcome {
        if !self.sessions.contains_key(peer) {
            return SessionOutcome::Unchanged;
        }
        if error.is_fatal() {
            return self.fail(peer, error, capability);
        }
        warn!(group = self.label, peer = %peer, %error, "session invalidated");
        self.restart(peer, capability)
    }

    /// Invalidate and drop the session of a peer whose link went away
    pub fn peer_disconnected(&mut self, peer: &PeerId, capability: &mut dyn RangingCapability) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.invalidate();
                capability.invalidate(peer);
                debug!(group = self.label, peer = %peer, "session removed");
                true
            }
            None => false,
        }
    }

    /// Invalidate every session, returning how many were dropped
    pub fn invalidate_all(&mut self, capability: &mut dyn RangingCapability) -> usize {
        let count = self.sessions.len();
        for (peer, mut session) in self.sessions.drain() {
            session.invalidate();
            capability.invalidate(&peer);
        }
        if count > 0 {
            info!(group = self.label, count, "all sessions invalidated");
        }
        count
    }

    fn fail(
        &mut self,
        peer: &PeerId,
        error: RangingError,
        capability: &mut dyn RangingCapability,
    ) -> SessionOutcome {
        error!(group = self.label, peer = %peer, %error, "ranging session failed");
        self.peer_disconnected(peer, capability);
        SessionOutcome::Failed(error)
    }

    fn restart(&mut self, peer: &PeerId, capability: &mut dyn RangingCapability) -> SessionOutcome {
        match self.peer_connected(peer, capability) {
            Ok(token) => SessionOutcome::Restarted { token },
            Err(error) => {
                self.sessions.remove(peer);
                SessionOutcome::Failed(error)
            }
        }
    }
}
