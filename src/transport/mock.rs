//! In-memory link backend for testing and simulation

use crate::core::PeerDescriptor;
use crate::transport::{LinkBackend, LinkHandle, Reliability, TransportError, TransportResult};
use std::sync::{Arc, Mutex, MutexGuard};

/// Request recorded by [`MockLinkBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    StartAdvertising { advertised_name: String },
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    Invite(LinkHandle),
    Send {
        handles: Vec<LinkHandle>,
        data: Vec<u8>,
        reliability: Reliability,
    },
    Close(LinkHandle),
    Shutdown,
}

#[derive(Debug, Default)]
struct MockLinkState {
    calls: Vec<LinkCall>,
    advertising: bool,
    browsing: bool,
    fail_discovery: bool,
    fail_sends: bool,
}

/// Link backend that records every request instead of touching a radio
#[derive(Debug)]
pub struct MockLinkBackend {
    state: Arc<Mutex<MockLinkState>>,
}

/// Inspection handle sharing state with a [`MockLinkBackend`]
#[derive(Debug, Clone)]
pub struct MockLinkProbe {
    state: Arc<Mutex<MockLinkState>>,
}

fn lock(state: &Arc<Mutex<MockLinkState>>) -> MutexGuard<'_, MockLinkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockLinkBackend {
    /// Create a backend plus a probe that stays usable after the backend is
    /// moved into a transport
    pub fn new() -> (Self, MockLinkProbe) {
        let state = Arc::new(Mutex::new(MockLinkState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockLinkProbe { state },
        )
    }
}

impl MockLinkProbe {
    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.state).advertising
    }

    pub fn is_browsing(&self) -> bool {
        lock(&self.state).browsing
    }

    /// Handles that received an invitation, in order
    pub fn invited(&self) -> Vec<LinkHandle> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Invite(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    /// Payloads sent, with their destination handles
    pub fn sent(&self) -> Vec<(Vec<LinkHandle>, Vec<u8>)> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Send { handles, data, .. } => Some((handles.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Make advertising and browsing fail until cleared
    pub fn fail_discovery(&self, fail: bool) {
        lock(&self.state).fail_discovery = fail;
    }

    /// Make every send fail until cleared
    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }
}

impl LinkBackend for MockLinkBackend {
    fn start_advertising(
        &mut self,
        _service_name: &str,
        advertised_name: &str,
        _descriptor: &PeerDescriptor,
    ) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(LinkCall::StartAdvertising {
            advertised_name: advertised_name.to_string(),
        });
        if state.fail_discovery {
            return Err(TransportError::DiscoveryFailed {
                details: "simulated advertiser failure".to_string(),
            });
        }
        state.advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(LinkCall::StopAdvertising);
        state.advertising = false;
    }

    fn start_browsing(&mut self, _service_name: &str) -> TransportResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(LinkCall::StartBrowsing);
        if state.fail_discovery {
            return Err(TransportError::DiscoveryFailed {
                details: "simulated browser failure".to_string(),
            });
        }
        state.browsing = true;
        Ok(())
    }

    fn stop_browsing(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(LinkCall::StopBrowsing);
        state.browsing = false;
    }

    fn invite(&mut self, handle: LinkHandle, _descriptor: &PeerDescriptor) -> TransportResult<()> {
        lock(&self.state).calls.push(LinkCall::Invite(handle));
        Ok(())
    }

    fn send(&mut self, handles: &[LinkHandle], data: &[u8], reliability: Reliability) -> TransportResult<()> {
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(TransportError::SendFailed {
                details: "simulated send failure".to_string(),
            });
        }
        state.calls.push(LinkCall::Send {
            handles: handles.to_vec(),
            data: data.to_vec(),
            reliability,
        });
        Ok(())
    }

    fn close(&mut self, handle: LinkHandle) {
        lock(&self.state).calls.push(LinkCall::Close(handle));
    }

    fn shutdown(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(LinkCall::Shutdown);
        state.advertising = false;
        state.browsing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    #[test]
    fn test_probe_sees_backend_calls() {
        let (mut backend, probe) = MockLinkBackend::new();
        let descriptor = PeerDescriptor::new(Role::Anchor, "a1", "Anchor");

        backend.start_advertising("uwb-nav", "Anchor (anchor)", &descriptor).unwrap();
        backend.invite(LinkHandle(3), &descriptor).unwrap();
        assert!(probe.is_advertising());
        assert_eq!(probe.invited(), vec![LinkHandle(3)]);

        backend.shutdown();
        assert!(!probe.is_advertising());
        assert_eq!(probe.calls().last(), Some(&LinkCall::Shutdown));
    }

    #[test]
    fn test_simulated_failures() {
        let (mut backend, probe) = MockLinkBackend::new();
        probe.fail_discovery(true);
        assert!(backend.start_browsing("uwb-nav").is_err());
        assert!(!probe.is_browsing());

        probe.fail_sends(true);
        let result = backend.send(&[LinkHandle(1)], b"x", Reliability::Reliable);
        assert!(matches!(result, Err(TransportError::SendFailed { .. })));
        assert!(probe.sent().is_empty());
    }
}
