//! Policy-filtered, capacity-bounded peer transport

use crate::core::{PeerDescriptor, PeerId};
use crate::transport::policy::{self, LocalIdentity, PolicyDecision};
use crate::transport::{
    LinkBackend, LinkHandle, Reliability, TransportConfig, TransportError, TransportResult,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Events delivered to the transport subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A link finished its handshake
    PeerConnected(PeerDescriptor),
    /// A connected link went away
    PeerDisconnected(PeerId),
    /// Raw payload received from a connected peer
    Message { peer: PeerId, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Pending,
    Connected,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    descriptor: PeerDescriptor,
    handle: LinkHandle,
    state: LinkState,
}

/// Peer transport over a platform [`LinkBackend`].
///
/// Links are kept in an arena keyed by the stable [`PeerId`]; the transient
/// platform handle is only an attribute of the entry, so a device that comes
/// back under a new handle maps onto the same peer.
pub struct PeerTransport<B: LinkBackend> {
    backend: B,
    identity: LocalIdentity,
    config: TransportConfig,
    /// Pending and connected links
    links: HashMap<PeerId, LinkEntry>,
    /// Reverse index from platform handle to peer
    handles: HashMap<LinkHandle, PeerId>,
    /// Acceptable peers seen by the browser, kept to re-invite when capacity frees
    discovered: HashMap<LinkHandle, PeerDescriptor>,
    events: mpsc::UnboundedSender<TransportEvent>,
    discovering: bool,
    closed: bool,
}

impl<B: LinkBackend> PeerTransport<B> {
    /// Validate the configuration, start advertising and browsing, and hand
    /// back the event stream.
    pub fn connect(
        backend: B,
        config: TransportConfig,
        identity: LocalIdentity,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;
        let (events, receiver) = mpsc::unbounded_channel();

        let mut transport = Self {
            backend,
            identity,
            config,
            links: HashMap::new(),
            handles: HashMap::new(),
            discovered: HashMap::new(),
            events,
            discovering: false,
            closed: false,
        };

        info!(
            service = %transport.config.service_name,
            peer = %transport.identity.peer_id(),
            max_peers = transport.config.max_peers,
            "transport connecting"
        );
        transport.resume_discovery();
        Ok((transport, receiver))
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Peers with a fully established link
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, entry)| entry.state == LinkState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.links
            .values()
            .filter(|entry| entry.state == LinkState::Connected)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.links.len() - self.connected_count()
    }

    pub fn descriptor(&self, peer: &PeerId) -> Option<&PeerDescriptor> {
        self.links.get(peer).map(|entry| &entry.descriptor)
    }

    fn at_capacity(&self) -> bool {
        self.links.len() >= self.config.max_peers
    }

    /// Restart advertising and browsing if they are not running and there is
    /// room for another peer. Safe to call repeatedly.
    pub fn ensure_discovery(&mut self) {
        self.resume_discovery();
    }

    fn resume_discovery(&mut self) {
        if self.closed || self.discovering || self.at_capacity() {
            return;
        }

        let advertised_name = self.identity.descriptor.advertised_name();
        let advertise = self.backend.start_advertising(
            &self.config.service_name,
            &advertised_name,
            &self.identity.descriptor,
        );
        let browse = self.backend.start_browsing(&self.config.service_name);

        match (advertise, browse) {
            (Ok(()), Ok(())) => {
                self.discovering = true;
                debug!(name = %advertised_name, "advertising and browsing");
            }
            (advertise, browse) => {
                for error in [advertise.err(), browse.err()].into_iter().flatten() {
                    warn!(%error, "discovery did not start, will retry");
                }
                self.backend.stop_advertising();
                self.backend.stop_browsing();
            }
        }
    }

    fn pause_discovery(&mut self) {
        if !self.discovering {
            return;
        }
        self.backend.stop_advertising();
        self.backend.stop_browsing();
        self.discovering = false;
        debug!(links = self.links.len(), "peer capacity reached, discovery paused");
    }

    fn insert_link(&mut self, descriptor: PeerDescriptor, handle: LinkHandle) {
        let peer_id = descriptor.peer_id();
        self.handles.insert(handle, peer_id.clone());
        self.links.insert(
            peer_id,
            LinkEntry {
                descriptor,
                handle,
                state: LinkState::Pending,
            },
        );
        if self.at_capacity() {
            self.pause_discovery();
        }
    }

    fn try_invite(&mut self, handle: LinkHandle, descriptor: PeerDescriptor) {
        let peer_id = descriptor.peer_id();
        if self.links.contains_key(&peer_id) {
            trace!(peer = %peer_id, "already linked, not inviting");
            return;
        }
        if self.at_capacity() {
            debug!(peer = %peer_id, "at capacity, invitation deferred");
            return;
        }

        match self.backend.invite(handle, &self.identity.descriptor) {
            Ok(()) => {
                debug!(peer = %peer_id, %handle, "invitation sent");
                self.insert_link(descriptor, handle);
            }
            Err(error) => warn!(peer = %peer_id, %error, "invitation failed"),
        }
    }

    fn retry_discovered(&mut self) {
        let candidates: Vec<(LinkHandle, PeerDescriptor)> = self
            .discovered
            .iter()
            .filter(|(_, descriptor)| {
                !self.links.contains_key(&descriptor.peer_id())
                    && policy::should_invite(&self.identity, descriptor)
            })
            .map(|(handle, descriptor)| (*handle, descriptor.clone()))
            .collect();

        for (handle, descriptor) in candidates {
            if self.at_capacity() {
                break;
            }
            self.try_invite(handle, descriptor);
        }
    }

    /// Platform callback: the browser found a device
    pub fn peer_found(&mut self, handle: LinkHandle, descriptor: PeerDescriptor) {
        if self.closed {
            return;
        }
        let peer_id = descriptor.peer_id();
        if let PolicyDecision::Reject(reason) = policy::evaluate(&self.identity, &descriptor) {
            debug!(peer = %peer_id, %reason, "ignoring discovered peer");
            return;
        }

        self.discovered.insert(handle, descriptor.clone());
        if policy::should_invite(&self.identity, &descriptor) {
            self.try_invite(handle, descriptor);
        }
    }

    /// Platform callback: the browser lost a device
    pub fn peer_lost(&mut self, handle: LinkHandle) {
        self.discovered.remove(&handle);

        let pending_peer = self.handles.get(&handle).and_then(|peer_id| {
            self.links
                .get(peer_id)
                .filter(|entry| entry.state == LinkState::Pending && entry.handle == handle)
                .map(|_| peer_id.clone())
        });
        if let Some(peer_id) = pending_peer {
            debug!(peer = %peer_id, "pending peer lost");
            self.links.remove(&peer_id);
            self.handles.remove(&handle);
            self.resume_discovery();
        }
    }

    /// Platform callback: a remote device wants to link. Returns whether the
    /// invitation is accepted.
    pub fn invitation_received(&mut self, handle: LinkHandle, descriptor: PeerDescriptor) -> bool {
        if self.closed {
            return false;
        }
        let peer_id = descriptor.peer_id();

        if let PolicyDecision::Reject(reason) = policy::evaluate(&self.identity, &descriptor) {
            info!(peer = %peer_id, %reason, "invitation refused");
            return false;
        }

        match self.links.get(&peer_id) {
            Some(existing) if existing.state == LinkState::Connected => {
                debug!(peer = %peer_id, "invitation refused, peer already connected");
                return false;
            }
            Some(_) => {}
            None if self.at_capacity() => {
                let error = TransportError::CapacityExceeded {
                    connected: self.links.len(),
                    max: self.config.max_peers,
                };
                warn!(peer = %peer_id, %error, "invitation refused");
                return false;
            }
            None => {}
        }

        if let Some(previous) = self.links.remove(&peer_id) {
            self.handles.remove(&previous.handle);
        }
        self.insert_link(descriptor, handle);
        debug!(peer = %peer_id, %handle, "invitation accepted");
        true
    }

    /// Platform callback: a pending link finished connecting
    pub fn link_connected(&mut self, handle: LinkHandle) {
        let Some(peer_id) = self.handles.get(&handle).cloned() else {
            warn!(%handle, "unknown link connected, closing");
            self.backend.close(handle);
            return;
        };
        let Some(entry) = self.links.get_mut(&peer_id) else {
            return;
        };
        if entry.state == LinkState::Connected {
            return;
        }

        entry.state = LinkState::Connected;
        let descriptor = entry.descriptor.clone();
        self.discovered.remove(&handle);
        info!(peer = %peer_id, %handle, "peer connected");
        self.emit(TransportEvent::PeerConnected(descriptor));
    }

    /// Platform callback: a link dropped or failed to connect
    pub fn link_disconnected(&mut self, handle: LinkHandle) {
        let Some(peer_id) = self.handles.remove(&handle) else {
            trace!(%handle, "disconnect for unknown link");
            return;
        };

        let owns_entry = self
            .links
            .get(&peer_id)
            .map_or(false, |entry| entry.handle == handle);
        if owns_entry {
            if let Some(entry) = self.links.remove(&peer_id) {
                if entry.state == LinkState::Connected {
                    let error = TransportError::LinkDropped {
                        peer: peer_id.to_string(),
                    };
                    info!(peer = %peer_id, %error, "peer disconnected");
                    self.emit(TransportEvent::PeerDisconnected(peer_id));
                } else {
                    debug!(peer = %peer_id, "pending link failed");
                }
            }
        }

        self.resume_discovery();
        self.retry_discovered();
    }

    /// Platform callback: payload from a remote device
    pub fn data_received(&mut self, handle: LinkHandle, data: Vec<u8>) {
        let connected = self.handles.get(&handle).and_then(|peer_id| {
            self.links
                .get(peer_id)
                .filter(|entry| entry.state == LinkState::Connected)
                .map(|_| peer_id.clone())
        });
        match connected {
            Some(peer) => self.emit(TransportEvent::Message { peer, data }),
            None => trace!(%handle, bytes = data.len(), "data from unlinked handle dropped"),
        }
    }

    /// Platform callback: advertising or browsing stopped with an error
    pub fn discovery_failed(&mut self, error: TransportError) {
        warn!(%error, "discovery failed, restarting");
        if self.discovering {
            self.backend.stop_advertising();
            self.backend.stop_browsing();
            self.discovering = false;
        }
        self.resume_discovery();
    }

    /// Send `data` to every peer in `peers`.
    ///
    /// Connected peers still receive the payload when some others are gone; the
    /// first missing peer is reported as [`TransportError::PeerNotConnected`].
    pub fn send(&mut self, peers: &[PeerId], data: &[u8], reliability: Reliability) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut handles = Vec::with_capacity(peers.len());
        let mut missing: Option<String> = None;
        for peer in peers {
            match self.links.get(peer) {
                Some(entry) if entry.state == LinkState::Connected => handles.push(entry.handle),
                _ => {
                    warn!(peer = %peer, "send to disconnected peer dropped");
                    missing.get_or_insert_with(|| peer.to_string());
                }
            }
        }

        if !handles.is_empty() {
            self.backend
                .send(&handles, data, reliability)
                .map_err(|error| {
                    warn!(%error, "send failed");
                    error
                })?;
        }

        match missing {
            Some(peer) => Err(TransportError::PeerNotConnected { peer }),
            None => Ok(()),
        }
    }

    /// Change the navigator's anchor selection, dropping links it no longer allows
    pub fn select_anchor(&mut self, anchor: Option<PeerId>) {
        self.identity.selected_anchor = anchor;

        let rejected: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, entry)| !policy::evaluate(&self.identity, &entry.descriptor).is_accept())
            .map(|(id, _)| id.clone())
            .collect();
        for peer in rejected {
            if let Err(error) = self.disconnect_peer(&peer) {
                debug!(peer = %peer, %error, "drop after reselection failed");
            }
        }
        self.retry_discovered();
    }

    /// Close one link
    pub fn disconnect_peer(&mut self, peer: &PeerId) -> TransportResult<()> {
        let entry = self.links.remove(peer).ok_or_else(|| TransportError::PeerNotConnected {
            peer: peer.to_string(),
        })?;
        self.handles.remove(&entry.handle);
        self.backend.close(entry.handle);
        if entry.state == LinkState::Connected {
            info!(peer = %peer, "peer disconnected locally");
            self.emit(TransportEvent::PeerDisconnected(peer.clone()));
        }
        self.resume_discovery();
        Ok(())
    }

    /// Tear down every link and stop discovery for good
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.discovering = false;
        self.backend.shutdown();
        self.links.clear();
        self.handles.clear();
        self.discovered.clear();
        info!("transport disconnected");
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("transport event dropped, no subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use crate::transport::mock::{LinkCall, MockLinkBackend};

    fn anchor(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(Role::Anchor, id, format!("Anchor {}", id))
    }

    fn navigator(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(Role::Navigator, id, format!("Navigator {}", id))
    }

    fn connect(
        identity: LocalIdentity,
        max_peers: usize,
    ) -> (
        PeerTransport<MockLinkBackend>,
        mpsc::UnboundedReceiver<TransportEvent>,
        crate::transport::mock::MockLinkProbe,
    ) {
        let (backend, probe) = MockLinkBackend::new();
        let config = TransportConfig::default().with_max_peers(max_peers);
        let (transport, events) = PeerTransport::connect(backend, config, identity).unwrap();
        (transport, events, probe)
    }

    #[test]
    fn test_connect_starts_discovery() {
        let (transport, _events, probe) = connect(LocalIdentity::new(anchor("a1")), 4);
        assert!(transport.is_discovering());
        assert!(probe.is_advertising());
        assert!(probe.is_browsing());
    }

    #[test]
    fn test_navigator_invites_only_selected_anchor() {
        let identity = LocalIdentity::new(navigator("n1")).with_selected_anchor(anchor("a2").peer_id());
        let (mut transport, _events, probe) = connect(identity, 4);

        transport.peer_found(LinkHandle(1), anchor("a1"));
        transport.peer_found(LinkHandle(2), anchor("a2"));

        assert_eq!(probe.invited(), vec![LinkHandle(2)]);
        assert!(!transport.invitation_received(LinkHandle(3), anchor("a3")));
    }

    #[test]
    fn test_connected_event_and_message_delivery() {
        let (mut transport, mut events, _probe) = connect(LocalIdentity::new(anchor("a1")), 4);

        assert!(transport.invitation_received(LinkHandle(7), navigator("n1")));
        transport.link_connected(LinkHandle(7));
        transport.data_received(LinkHandle(7), vec![1, 2, 3]);

        assert_eq!(events.try_recv().unwrap(), TransportEvent::PeerConnected(navigator("n1")));
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::Message {
                peer: navigator("n1").peer_id(),
                data: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn test_capacity_refuses_and_resumes() {
        let (mut transport, mut events, probe) = connect(LocalIdentity::new(anchor("a1")), 1);

        assert!(transport.invitation_received(LinkHandle(1), navigator("n1")));
        transport.link_connected(LinkHandle(1));
        assert!(!transport.is_discovering());
        assert!(!probe.is_advertising());

        assert!(!transport.invitation_received(LinkHandle(2), navigator("n2")));

        transport.link_disconnected(LinkHandle(1));
        assert!(transport.is_discovering());
        assert!(probe.is_advertising());

        assert!(matches!(events.try_recv(), Ok(TransportEvent::PeerConnected(_))));
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::PeerDisconnected(navigator("n1").peer_id())
        );
    }

    #[test]
    fn test_deferred_invitation_retried_when_capacity_frees() {
        let identity = LocalIdentity::new(navigator("n1"));
        let (mut transport, _events, probe) = connect(identity, 1);

        transport.peer_found(LinkHandle(1), anchor("a1"));
        transport.link_connected(LinkHandle(1));
        transport.peer_found(LinkHandle(2), anchor("a2"));
        assert_eq!(probe.invited(), vec![LinkHandle(1)]);

        transport.link_disconnected(LinkHandle(1));
        assert_eq!(probe.invited(), vec![LinkHandle(1), LinkHandle(2)]);
    }

    #[test]
    fn test_send_to_disconnected_peer_fails_locally() {
        let (mut transport, _events, probe) = connect(LocalIdentity::new(anchor("a1")), 4);
        assert!(transport.invitation_received(LinkHandle(1), navigator("n1")));
        transport.link_connected(LinkHandle(1));

        let peers = [navigator("n1").peer_id(), navigator("n2").peer_id()];
        let result = transport.send(&peers, b"hello", Reliability::Reliable);
        assert!(matches!(result, Err(TransportError::PeerNotConnected { .. })));

        // the connected peer still got the payload
        assert!(probe.calls().iter().any(|call| matches!(
            call,
            LinkCall::Send { handles, .. } if handles == &vec![LinkHandle(1)]
        )));
    }

    #[test]
    fn test_reconnect_under_new_handle() {
        let (mut transport, mut events, _probe) = connect(LocalIdentity::new(anchor("a1")), 4);
        assert!(transport.invitation_received(LinkHandle(1), navigator("n1")));
        transport.link_connected(LinkHandle(1));
        transport.link_disconnected(LinkHandle(1));

        assert!(transport.invitation_received(LinkHandle(9), navigator("n1")));
        transport.link_connected(LinkHandle(9));

        // stale disconnect for the old handle must not drop the new link
        transport.link_disconnected(LinkHandle(1));
        assert_eq!(transport.connected_peers(), vec![navigator("n1").peer_id()]);

        let received: Vec<TransportEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 3);
    }

    #[test]
    fn test_discovery_failure_restarts() {
        let (mut transport, _events, probe) = connect(LocalIdentity::new(anchor("a1")), 4);
        transport.discovery_failed(TransportError::DiscoveryFailed {
            details: "network reset".into(),
        });
        assert!(transport.is_discovering());
        let starts = probe
            .calls()
            .iter()
            .filter(|call| matches!(call, LinkCall::StartBrowsing))
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn test_reselecting_anchor_drops_other_links() {
        let (mut transport, mut events, probe) = connect(LocalIdentity::new(navigator("n1")), 4);
        transport.peer_found(LinkHandle(1), anchor("a1"));
        transport.link_connected(LinkHandle(1));

        transport.select_anchor(Some(anchor("a2").peer_id()));
        assert!(transport.connected_peers().is_empty());
        assert!(probe.calls().contains(&LinkCall::Close(LinkHandle(1))));

        let _ = events.try_recv();
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::PeerDisconnected(anchor("a1").peer_id())
        );
    }

    #[test]
    fn test_disconnect_closes_transport() {
        let (mut transport, _events, probe) = connect(LocalIdentity::new(anchor("a1")), 4);
        transport.disconnect();
        assert!(transport.is_closed());
        assert!(probe.calls().contains(&LinkCall::Shutdown));
        assert_eq!(
            transport.send(&[navigator("n1").peer_id()], b"x", Reliability::Reliable),
            Err(TransportError::Closed)
        );
    }
}
