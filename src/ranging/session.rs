//! Per-peer ranging session state machine

use crate::core::{now_ms, PeerId, RangingSample};
use crate::processing::DiscoveryToken;
use crate::ranging::{RangingConfiguration, RangingError, RangingResult};
use std::fmt;

/// Lifecycle states of a ranging session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session exists, our token is not shared yet
    Created,
    /// Our token is shared, waiting for the peer's token
    TokenPending,
    /// Armed with the peer's token and producing samples
    Active,
    /// Paused by the platform, resumes with the last configuration
    Suspended,
    /// Terminal
    Invalidated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::TokenPending => "token-pending",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Invalidated => "invalidated",
        };
        f.write_str(name)
    }
}

/// One ranging session, owned by exactly one peer
#[derive(Debug, Clone)]
pub struct RangingSession {
    owner: PeerId,
    state: SessionState,
    local_token: Option<DiscoveryToken>,
    configuration: Option<RangingConfiguration>,
    last_sample: Option<RangingSample>,
    /// Consecutive timeout re-arms since the last sample
    timeout_retries: u32,
    created_at_ms: u64,
}

impl RangingSession {
    pub fn new(owner: PeerId) -> Self {
        Self {
            owner,
            state: SessionState::Created,
            local_token: None,
            configuration: None,
            last_sample: None,
            timeout_retries: 0,
            created_at_ms: now_ms(),
        }
    }

    pub fn owner(&self) -> &PeerId {
        &self.owner
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_token(&self) -> Option<&DiscoveryToken> {
        self.local_token.as_ref()
    }

    pub fn peer_token(&self) -> Option<&DiscoveryToken> {
        self.configuration.as_ref().map(|c| &c.peer_token)
    }

    pub fn configuration(&self) -> Option<&RangingConfiguration> {
        self.configuration.as_ref()
    }

    pub fn last_sample(&self) -> Option<&RangingSample> {
        self.last_sample.as_ref()
    }

    pub fn timeout_retries(&self) -> u32 {
        self.timeout_retries
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    fn invalid(&self, action: &'static str) -> RangingError {
        RangingError::InvalidState {
            peer: self.owner.to_string(),
            state: self.state.to_string(),
            action,
        }
    }

    /// Created → TokenPending once our token went out
    pub fn token_shared(&mut self, token: DiscoveryToken) -> RangingResult<()> {
        if self.state != SessionState::Created {
            return Err(self.invalid("share a token"));
        }
        self.local_token = Some(token);
        self.state = SessionState::TokenPending;
        Ok(())
    }

    /// Arm with the peer's configuration. An active session may be re-keyed
    /// when the peer restarted its side.
    pub fn arm(&mut self, configuration: RangingConfiguration) -> RangingResult<()> {
        match self.state {
            SessionState::Created | SessionState::TokenPending | SessionState::Active => {
                self.configuration = Some(configuration);
                self.state = SessionState::Active;
                self.timeout_retries = 0;
                Ok(())
            }
            _ => Err(self.invalid("arm")),
        }
    }

    /// Active → Suspended
    pub fn suspend(&mut self) -> RangingResult<()> {
        if self.state != SessionState::Active {
            return Err(self.invalid("suspend"));
        }
        self.state = SessionState::Suspended;
        Ok(())
    }

    /// Suspended → Active, returning the configuration to re-arm with
    pub fn resume(&mut self) -> RangingResult<RangingConfiguration> {
        if self.state != SessionState::Suspended {
            return Err(self.invalid("resume"));
        }
        let configuration = self.configuration.clone().ok_or_else(|| self.invalid("resume"))?;
        self.state = SessionState::Active;
        Ok(configuration)
    }

    /// Count a timeout re-arm. Returns the configuration to re-arm with, or
    /// `None` once `max_retries` is exhausted.
    pub fn retry_after_timeout(&mut self, max_retries: u32) -> Option<RangingConfiguration> {
        if !matches!(self.state, SessionState::Active | SessionState::Suspended) {
            return None;
        }
        if self.timeout_retries >= max_retries {
            return None;
        }
        let configuration = self.configuration.clone()?;
        self.timeout_retries += 1;
        self.state = SessionState::Active;
        Some(configuration)
    }

    /// Store a sample; only active sessions produce samples
    pub fn record_sample(&mut self, sample: RangingSample) -> RangingResult<()> {
        if self.state != SessionState::Active {
            return Err(self.invalid("record a sample"));
        }
        self.timeout_retries = 0;
        self.last_sample = Some(sample);
        Ok(())
    }

    /// Any state → Invalidated
    pub fn invalidate(&mut self) {
        self.state = SessionState::Invalidated;
        self.local_token = None;
        self.configuration = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    fn session() -> RangingSession {
        RangingSession::new(PeerId::new(Role::Anchor, "a1"))
    }

    fn config(byte: u8) -> RangingConfiguration {
        RangingConfiguration::new(DiscoveryToken::new(vec![byte]))
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Created);

        session.token_shared(DiscoveryToken::new(vec![1])).unwrap();
        assert_eq!(session.state(), SessionState::TokenPending);

        session.arm(config(2)).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.peer_token(), Some(&DiscoveryToken::new(vec![2])));

        session.record_sample(RangingSample::new(Some(1.5), None)).unwrap();
        assert_eq!(session.last_sample().unwrap().distance, Some(1.5));
    }

    #[test]
    fn test_suspend_resume_keeps_configuration() {
        let mut session = session();
        session.arm(config(7)).unwrap();

        for _ in 0..3 {
            session.suspend().unwrap();
            assert!(session.record_sample(RangingSample::new(Some(1.0), None)).is_err());
            let resumed = session.resume().unwrap();
            assert_eq!(resumed.peer_token, DiscoveryToken::new(vec![7]));
            assert_eq!(session.state(), SessionState::Active);
        }
    }

    #[test]
    fn test_timeout_retries_are_bounded() {
        let mut session = session();
        session.arm(config(3)).unwrap();

        assert!(session.retry_after_timeout(2).is_some());
        assert!(session.retry_after_timeout(2).is_some());
        assert!(session.retry_after_timeout(2).is_none());

        // a sample resets the budget
        session.record_sample(RangingSample::new(Some(2.0), None)).unwrap();
        assert!(session.retry_after_timeout(2).is_some());
    }

    #[test]
    fn test_invalidated_is_terminal() {
        let mut session = session();
        session.arm(config(1)).unwrap();
        session.invalidate();

        assert_eq!(session.state(), SessionState::Invalidated);
        assert!(session.peer_token().is_none());
        assert!(session.arm(config(1)).is_err());
        assert!(session.suspend().is_err());
        assert!(session.retry_after_timeout(3).is_none());
    }

    #[test]
    fn test_token_shared_only_once() {
        let mut session = session();
        session.token_shared(DiscoveryToken::new(vec![1])).unwrap();
        assert!(matches!(
            session.token_shared(DiscoveryToken::new(vec![1])),
            Err(RangingError::InvalidState { .. })
        ));
    }
}
