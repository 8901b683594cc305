//! Platform ranging capability and its event vocabulary

use crate::core::{now_ms, PeerId, RangingSample};
use crate::processing::DiscoveryToken;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Configuration a session is armed with: the peer's token
#[derive(Debug, Clone, PartialEq)]
pub struct RangingConfiguration {
    pub peer_token: DiscoveryToken,
    /// When the configuration was built, ms since epoch
    pub created_at_ms: u64,
}

impl RangingConfiguration {
    pub fn new(peer_token: DiscoveryToken) -> Self {
        Self {
            peer_token,
            created_at_ms: now_ms(),
        }
    }
}

/// Ranging errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RangingError {
    /// User denied ranging access; needs action in system settings
    #[error("ranging permission denied")]
    PermissionDenied,
    /// Device has no ranging hardware
    #[error("ranging is not supported on this device")]
    Unsupported,
    /// Platform session failure
    #[error("ranging session failed: {details}")]
    SessionFailed { details: String },
    /// No session exists for the peer
    #[error("no ranging session for {peer}")]
    NoSession { peer: String },
    /// Token already bound to a different peer's session
    #[error("token from {peer} is already bound to {owner}")]
    TokenConflict { peer: String, owner: String },
    /// Lifecycle transition not allowed from the current state
    #[error("session for {peer} cannot {action} while {state}")]
    InvalidState {
        peer: String,
        state: String,
        action: &'static str,
    },
}

impl RangingError {
    /// Fatal errors cannot be retried without user action
    pub fn is_fatal(&self) -> bool {
        matches!(self, RangingError::PermissionDenied | RangingError::Unsupported)
    }
}

/// Result type for ranging operations
pub type RangingResult<T> = Result<T, RangingError>;

/// Why the platform removed a peer from an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// No measurements for too long
    Timeout,
    /// The peer ended its side of the session
    PeerEnded,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Timeout => f.write_str("timeout"),
            RemovalReason::PeerEnded => f.write_str("peer ended"),
        }
    }
}

/// Asynchronous callbacks from the platform ranging capability
#[derive(Debug, Clone, PartialEq)]
pub enum RangingEvent {
    Sample { peer: PeerId, sample: RangingSample },
    Suspended { peer: PeerId },
    SuspensionEnded { peer: PeerId },
    Removed { peer: PeerId, reason: RemovalReason },
    Invalidated { peer: PeerId, error: RangingError },
}

impl RangingEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            RangingEvent::Sample { peer, .. }
            | RangingEvent::Suspended { peer }
            | RangingEvent::SuspensionEnded { peer }
            | RangingEvent::Removed { peer, .. }
            | RangingEvent::Invalidated { peer, .. } => peer,
        }
    }
}

/// Opaque physical-layer ranging capability.
///
/// One platform session is kept per peer. Samples and lifecycle callbacks are
/// reported back as [`RangingEvent`]s by the platform glue.
pub trait RangingCapability: Send {
    /// Create a platform session for `peer` and return our discovery token for it
    fn prepare_session(&mut self, peer: &PeerId) -> RangingResult<DiscoveryToken>;

    /// Arm (or re-arm) the session for `peer` with the given configuration
    fn run(&mut self, peer: &PeerId, config: &RangingConfiguration) -> RangingResult<()>;

    /// Permanently stop the session for `peer`
    fn invalidate(&mut self, peer: &PeerId);
}

/// Request recorded by [`MockRangingCapability`]
#[derive(Debug, Clone, PartialEq)]
pub enum RangingCall {
    Prepare(PeerId),
    Run { peer: PeerId, token: DiscoveryToken },
    Invalidate(PeerId),
}

#[derive(Debug, Default)]
struct MockRangingState {
    calls: Vec<RangingCall>,
    next_token: u32,
    running: HashMap<PeerId, DiscoveryToken>,
    deny_permission: bool,
    fail_runs: bool,
}

/// Ranging capability that hands out unique tokens and records every request
#[derive(Debug)]
pub struct MockRangingCapability {
    state: Arc<Mutex<MockRangingState>>,
}

/// Inspection handle sharing state with a [`MockRangingCapability`]
#[derive(Debug, Clone)]
pub struct MockRangingProbe {
    state: Arc<Mutex<MockRangingState>>,
}

fn lock(state: &Arc<Mutex<MockRangingState>>) -> MutexGuard<'_, MockRangingState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockRangingCapability {
    pub fn new() -> (Self, MockRangingProbe) {
        let state = Arc::new(Mutex::new(MockRangingState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockRangingProbe { state },
        )
    }
}

impl MockRangingProbe {
    pub fn calls(&self) -> Vec<RangingCall> {
        lock(&self.state).calls.clone()
    }

    /// Peers with a currently running platform session
    pub fn running(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.state).running.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn run_count(&self, peer: &PeerId) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, RangingCall::Run { peer: p, .. } if p == peer))
            .count()
    }

    pub fn deny_permission(&self, deny: bool) {
        lock(&self.state).deny_permission = deny;
    }

    pub fn fail_runs(&self, fail: bool) {
        lock(&self.state).fail_runs = fail;
    }
}

impl RangingCapability for MockRangingCapability {
    fn prepare_session(&mut self, peer: &PeerId) -> RangingResult<DiscoveryToken> {
        let mut state = lock(&self.state);
        state.calls.push(RangingCall::Prepare(peer.clone()));
        if state.deny_permission {
            return Err(RangingError::PermissionDenied);
        }
        state.next_token += 1;
        let mut bytes = b"tok-".to_vec();
        bytes.extend_from_slice(&state.next_token.to_le_bytes());
        Ok(DiscoveryToken::new(bytes))
    }

    fn run(&mut self, peer: &PeerId, config: &RangingConfiguration) -> RangingResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(RangingCall::Run {
            peer: peer.clone(),
            token: config.peer_token.clone(),
        });
        if state.deny_permission {
            return Err(RangingError::PermissionDenied);
        }
        if state.fail_runs {
            return Err(RangingError::SessionFailed {
                details: "simulated run failure".to_string(),
            });
        }
        state.running.insert(peer.clone(), config.peer_token.clone());
        Ok(())
    }

    fn invalidate(&mut self, peer: &PeerId) {
        let mut state = lock(&self.state);
        state.calls.push(RangingCall::Invalidate(peer.clone()));
        state.running.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    #[test]
    fn test_mock_tokens_are_unique() {
        let (mut capability, _probe) = MockRangingCapability::new();
        let peer = PeerId::new(Role::Anchor, "a1");
        let first = capability.prepare_session(&peer).unwrap();
        let second = capability.prepare_session(&peer).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_mock_tracks_running_sessions() {
        let (mut capability, probe) = MockRangingCapability::new();
        let peer = PeerId::new(Role::Anchor, "a1");
        let config = RangingConfiguration::new(DiscoveryToken::new(vec![1]));

        capability.run(&peer, &config).unwrap();
        assert_eq!(probe.running(), vec![peer.clone()]);
        assert_eq!(probe.run_count(&peer), 1);

        capability.invalidate(&peer);
        assert!(probe.running().is_empty());
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let (mut capability, probe) = MockRangingCapability::new();
        probe.deny_permission(true);
        let err = capability
            .prepare_session(&PeerId::new(Role::Navigator, "n1"))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!RangingError::SessionFailed { details: String::new() }.is_fatal());
    }
}
