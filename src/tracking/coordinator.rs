//! Tracking coordinator task
//!
//! One task owns the transport, the ranging capability and the role tracker.
//! Platform callbacks arrive as [`CoordinatorCommand`]s; transport events
//! raised while handling a command are drained before the next command so
//! every peer is registered before its first message or sample is seen.

use crate::api::{PeerStatus, PersistenceSink, StatusExporter, StatusSnapshot};
use crate::context::AppContext;
use crate::core::{now_ms, Destination, PeerDescriptor, PeerId, RangingSample, Role};
use crate::measurement::{self, DistanceErrorTracker, ErrorTrackerHandle};
use crate::processing::{self, DiscoveryToken, WireMessage};
use crate::ranging::{RangingCapability, RangingError, RangingEvent, SessionOutcome, TokenOutcome};
use crate::tracking::{
    AnchorTracker, CampaignChange, NavigatorTracker, PeerCollection, TrackingEvent,
};
use crate::transport::{
    LinkBackend, LinkHandle, LocalIdentity, PeerTransport, Reliability, TransportError,
    TransportEvent,
};
use crate::utils::ConfigError;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// How often advertising and browsing are re-checked
const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Buffered events per UI subscriber
const EVENT_CAPACITY: usize = 256;

const PERMISSION_MESSAGE: &str = "Ranging access was denied. Allow it in system settings to resume tracking.";
const UNSUPPORTED_MESSAGE: &str = "This device cannot range with nearby peers.";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("profile has no {field}")]
    Profile { field: &'static str },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("coordinator has stopped")]
    Stopped,
}

/// Platform transport callbacks
#[derive(Debug)]
pub enum LinkEvent {
    PeerFound {
        handle: LinkHandle,
        descriptor: PeerDescriptor,
    },
    PeerLost(LinkHandle),
    Invitation {
        handle: LinkHandle,
        descriptor: PeerDescriptor,
        reply: Option<oneshot::Sender<bool>>,
    },
    Connected(LinkHandle),
    Disconnected(LinkHandle),
    Data { handle: LinkHandle, data: Vec<u8> },
    DiscoveryFailed(TransportError),
}

#[derive(Debug)]
pub enum CoordinatorCommand {
    Link(LinkEvent),
    Ranging(RangingEvent),
    /// Navigator only
    SelectAnchor(Option<PeerId>),
    /// Anchor only: announce a destination chosen after connecting
    SetDestination(Destination),
    Status(oneshot::Sender<StatusSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    events: broadcast::Sender<TrackingEvent>,
}

impl CoordinatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: CoordinatorCommand) -> Result<(), CoordinatorError> {
        self.commands.send(command).map_err(|_| CoordinatorError::Stopped)
    }

    pub fn link_event(&self, event: LinkEvent) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::Link(event))
    }

    /// Browser found a device; `payload` is its advertised descriptor.
    /// Payloads that do not parse are ignored.
    pub fn advertisement(&self, handle: LinkHandle, payload: &[u8]) -> Result<(), CoordinatorError> {
        match processing::token::decode_descriptor(payload) {
            Ok(descriptor) => self.link_event(LinkEvent::PeerFound { handle, descriptor }),
            Err(error) => {
                trace!(%handle, %error, "unreadable advertisement dropped");
                Ok(())
            }
        }
    }

    /// Forward an invitation and wait for the policy decision
    pub async fn invitation(&self, handle: LinkHandle, descriptor: PeerDescriptor) -> Result<bool, CoordinatorError> {
        let (reply, decision) = oneshot::channel();
        self.link_event(LinkEvent::Invitation {
            handle,
            descriptor,
            reply: Some(reply),
        })?;
        decision.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub fn ranging_event(&self, event: RangingEvent) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::Ranging(event))
    }

    pub fn select_anchor(&self, anchor: Option<PeerId>) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::SelectAnchor(anchor))
    }

    pub fn set_destination(&self, destination: Destination) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::SetDestination(destination))
    }

    /// Current status; also waits for every earlier command to be handled
    pub async fn status(&self) -> Result<StatusSnapshot, CoordinatorError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(CoordinatorCommand::Status(reply))?;
        snapshot.await.map_err(|_| CoordinatorError::Stopped)
    }

    /// Stop the record tick, invalidate every session, then disconnect
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (reply, done) = oneshot::channel();
        self.send(CoordinatorCommand::Shutdown(reply))?;
        done.await.map_err(|_| CoordinatorError::Stopped)
    }
}

#[derive(Debug)]
enum RoleTracker {
    Anchor(AnchorTracker),
    Navigator(NavigatorTracker),
}

impl RoleTracker {
    /// Collection for a newly connected peer of `role`
    fn collection_for(&mut self, role: Role) -> Option<&mut PeerCollection> {
        match (self, role) {
            (RoleTracker::Anchor(tracker), role) => Some(tracker.collection_mut(role)),
            (RoleTracker::Navigator(tracker), Role::Anchor) => Some(tracker.anchors_mut()),
            (RoleTracker::Navigator(_), Role::Navigator) => None,
        }
    }

    fn collection_of(&mut self, peer: &PeerId) -> Option<&mut PeerCollection> {
        match self {
            RoleTracker::Anchor(tracker) => tracker.collection_of(peer),
            RoleTracker::Navigator(tracker) => Some(tracker.anchors_mut()).filter(|c| c.contains(peer)),
        }
    }

    fn collections(&self) -> Vec<&PeerCollection> {
        match self {
            RoleTracker::Anchor(tracker) => vec![tracker.anchors(), tracker.navigators()],
            RoleTracker::Navigator(tracker) => vec![tracker.anchors()],
        }
    }

    fn evaluate_campaign(&mut self) -> Option<CampaignChange> {
        match self {
            RoleTracker::Anchor(tracker) => tracker.evaluate_campaign(),
            RoleTracker::Navigator(tracker) => tracker.evaluate_campaign(),
        }
    }

    fn is_campaign_active(&self) -> bool {
        match self {
            RoleTracker::Anchor(tracker) => tracker.is_campaign_active(),
            RoleTracker::Navigator(tracker) => tracker.is_campaign_active(),
        }
    }

    fn reset_campaign(&mut self) {
        match self {
            RoleTracker::Anchor(tracker) => tracker.reset_campaign(),
            RoleTracker::Navigator(tracker) => tracker.reset_campaign(),
        }
    }

    /// Campaign position of `descriptor` if it takes part in campaigns.
    /// Anchors count positioned anchors; navigators count every anchor.
    fn participant_position(&self, descriptor: &PeerDescriptor) -> Option<Option<Destination>> {
        match (self, descriptor.role) {
            (RoleTracker::Anchor(_), Role::Anchor) => descriptor.destination.map(Some),
            (RoleTracker::Navigator(_), Role::Anchor) => Some(descriptor.destination),
            (_, Role::Navigator) => None,
        }
    }

    fn disconnect_all(&mut self, capability: &mut dyn RangingCapability) -> usize {
        match self {
            RoleTracker::Anchor(tracker) => {
                tracker.collection_mut(Role::Anchor).disconnect_all(capability)
                    + tracker.collection_mut(Role::Navigator).disconnect_all(capability)
            }
            RoleTracker::Navigator(tracker) => tracker.anchors_mut().disconnect_all(capability),
        }
    }
}

/// Owns all tracking state for one signed-in device
pub struct Coordinator<B: LinkBackend, R: RangingCapability> {
    context: AppContext,
    local: PeerDescriptor,
    transport: PeerTransport<B>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    capability: R,
    role: RoleTracker,
    errors: ErrorTrackerHandle,
    error_task: Option<JoinHandle<DistanceErrorTracker>>,
    exporter: Arc<dyn StatusExporter>,
    events: broadcast::Sender<TrackingEvent>,
    inbox: mpsc::UnboundedReceiver<CoordinatorCommand>,
    purge_tx: mpsc::UnboundedSender<PeerId>,
    purge_rx: mpsc::UnboundedReceiver<PeerId>,
    campaign_id: Option<Uuid>,
}

impl<B, R> Coordinator<B, R>
where
    B: LinkBackend + 'static,
    R: RangingCapability + 'static,
{
    /// Validate the context, connect the transport and start the
    /// coordinator and error tracker tasks. Must run inside a tokio runtime.
    pub fn spawn(
        context: AppContext,
        backend: B,
        capability: R,
        sink: Box<dyn PersistenceSink>,
        exporter: Arc<dyn StatusExporter>,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>), CoordinatorError> {
        context.config.validate()?;
        let local = context.local_descriptor()?;
        let config = &context.config;

        let (transport, transport_events) =
            PeerTransport::connect(backend, config.transport.clone(), LocalIdentity::new(local.clone()))?;

        let tracker = DistanceErrorTracker::new(
            config.ground_truth.clone(),
            config.campaign.sample_max_age_ms,
            sink,
        );
        let (errors, error_task) =
            measurement::spawn(tracker, Duration::from_millis(config.campaign.record_interval_ms));

        let role = match local.role {
            Role::Anchor => RoleTracker::Anchor(AnchorTracker::new(
                local.peer_id(),
                local.destination,
                &config.campaign.required_destinations,
                config.ground_truth.clone(),
                config.ranging.max_timeout_retries,
            )),
            Role::Navigator => RoleTracker::Navigator(NavigatorTracker::new(
                local.peer_id(),
                config.ranging.max_timeout_retries,
                config.ranging.near_threshold_m,
                config.campaign.min_navigator_anchors,
            )),
        };

        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (purge_tx, purge_rx) = mpsc::unbounded_channel();

        info!(peer = %local.peer_id(), role = %local.role, "coordinator starting");
        let coordinator = Self {
            context,
            local,
            transport,
            transport_events,
            capability,
            role,
            errors,
            error_task: Some(error_task),
            exporter,
            events: events.clone(),
            inbox,
            purge_tx,
            purge_rx,
            campaign_id: None,
        };

        let task = tokio::spawn(coordinator.run());
        Ok((CoordinatorHandle { commands, events }, task))
    }

    async fn run(mut self) {
        let mut rediscovery = time::interval(REDISCOVERY_INTERVAL);
        rediscovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.publish_status();

        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                    self.drain_transport_events().await;
                }
                Some(peer) = self.purge_rx.recv() => self.purge(&peer),
                _ = rediscovery.tick() => self.transport.ensure_discovery(),
            }
        }
        debug!("coordinator stopped");
    }

    /// Breaks once the coordinator has been torn down
    async fn handle_command(&mut self, command: CoordinatorCommand) -> ControlFlow<()> {
        match command {
            CoordinatorCommand::Link(event) => self.handle_link_event(event),
            CoordinatorCommand::Ranging(event) => self.handle_ranging_event(event),
            CoordinatorCommand::SelectAnchor(anchor) => self.select_anchor(anchor),
            CoordinatorCommand::SetDestination(destination) => self.set_destination(destination).await,
            CoordinatorCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            CoordinatorCommand::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerFound { handle, descriptor } => self.transport.peer_found(handle, descriptor),
            LinkEvent::PeerLost(handle) => self.transport.peer_lost(handle),
            LinkEvent::Invitation {
                handle,
                descriptor,
                reply,
            } => {
                let accepted = self.transport.invitation_received(handle, descriptor);
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
            }
            LinkEvent::Connected(handle) => self.transport.link_connected(handle),
            LinkEvent::Disconnected(handle) => self.transport.link_disconnected(handle),
            LinkEvent::Data { handle, data } => self.transport.data_received(handle, data),
            LinkEvent::DiscoveryFailed(error) => self.transport.discovery_failed(error),
        }
    }

    async fn drain_transport_events(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            match event {
                TransportEvent::PeerConnected(descriptor) => self.on_peer_connected(descriptor).await,
                TransportEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer).await,
                TransportEvent::Message { peer, data } => self.on_message(peer, data).await,
            }
        }
    }

    async fn on_peer_connected(&mut self, descriptor: PeerDescriptor) {
        let peer = descriptor.peer_id();
        let role = descriptor.role;
        let display_name = descriptor.display_name.clone();
        let position = self.role.participant_position(&descriptor);

        let Some(collection) = self.role.collection_for(role) else {
            warn!(peer = %peer, "no collection for peer role, ignoring");
            return;
        };
        match collection.connect(descriptor, &mut self.capability) {
            Ok(token) => self.share_token(&peer, &token),
            Err(error) => self.ranging_failed(&peer, error),
        }

        self.emit(TrackingEvent::PeerConnected {
            peer: peer.clone(),
            role,
            display_name,
        });

        let change = self.role.evaluate_campaign();
        let started = matches!(change, Some(CampaignChange::Start(_)));
        if let Some(change) = change {
            self.apply_campaign_change(change).await;
        }
        if !started && self.role.is_campaign_active() {
            if let Some(position) = position {
                self.errors.register_participant(peer, position);
            }
        }
        self.refresh_visualization();
        self.publish_status();
    }

    async fn on_peer_disconnected(&mut self, peer: PeerId) {
        let Some(collection) = self.role.collection_of(&peer) else {
            return;
        };
        collection.mark_disconnected(&peer, &mut self.capability);
        self.errors.unregister_participant(peer.clone());
        self.emit(TrackingEvent::PeerDisconnected { peer: peer.clone() });

        if let Some(change) = self.role.evaluate_campaign() {
            self.apply_campaign_change(change).await;
        }
        self.schedule_purge(peer);
        self.refresh_visualization();
        self.publish_status();
    }

    fn schedule_purge(&mut self, peer: PeerId) {
        let grace = self.context.config.ranging.removal_grace_ms;
        if grace == 0 {
            self.purge(&peer);
            return;
        }
        let purge_tx = self.purge_tx.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(grace)).await;
            let _ = purge_tx.send(peer);
        });
    }

    fn purge(&mut self, peer: &PeerId) {
        let removed = self
            .role
            .collection_of(peer)
            .and_then(|collection| collection.purge(peer));
        if removed.is_some() {
            self.emit(TrackingEvent::PeerRemoved { peer: peer.clone() });
            self.publish_status();
        }
    }

    async fn on_message(&mut self, peer: PeerId, data: Vec<u8>) {
        let message = match processing::token::decode_message(&data) {
            Ok(message) => message,
            Err(error) => {
                trace!(peer = %peer, %error, "foreign payload dropped");
                return;
            }
        };

        match message {
            WireMessage::DiscoveryToken(token) => {
                let Some(collection) = self.role.collection_of(&peer) else {
                    return;
                };
                match collection.token_received(&peer, token, &mut self.capability) {
                    Ok(TokenOutcome::Rekeyed { reply }) => self.share_token(&peer, &reply),
                    Ok(_) => debug!(peer = %peer, "peer token applied"),
                    Err(error) => self.ranging_failed(&peer, error),
                }
                self.publish_status();
            }
            WireMessage::DestinationUpdate(destination) => {
                let Some(collection) = self.role.collection_of(&peer) else {
                    return;
                };
                collection.set_destination(&peer, destination);
                let descriptor = collection.get(&peer).map(|p| p.descriptor.clone());
                info!(peer = %peer, %destination, "peer destination updated");
                self.emit(TrackingEvent::DestinationChanged {
                    peer: peer.clone(),
                    destination,
                });

                let change = self.role.evaluate_campaign();
                let started = matches!(change, Some(CampaignChange::Start(_)));
                if let Some(change) = change {
                    self.apply_campaign_change(change).await;
                }
                let position = descriptor.and_then(|d| self.role.participant_position(&d));
                if !started && self.role.is_campaign_active() {
                    if let Some(position) = position {
                        self.errors.register_participant(peer, position);
                    }
                }
                self.publish_status();
            }
        }
    }

    fn share_token(&mut self, peer: &PeerId, token: &DiscoveryToken) {
        match processing::share(&mut self.transport, token, peer) {
            Ok(()) => {
                if let Some(collection) = self.role.collection_of(peer) {
                    collection.mark_token_shared(peer);
                }
                debug!(peer = %peer, "discovery token shared");
            }
            Err(error) => warn!(
                peer = %peer,
                %error,
                recovery = ?error.recovery_strategy(),
                "discovery token not shared"
            ),
        }
    }

    fn ranging_failed(&mut self, peer: &PeerId, error: RangingError) {
        if error.is_fatal() {
            error!(peer = %peer, %error, "ranging unavailable");
            let message = match error {
                RangingError::PermissionDenied => PERMISSION_MESSAGE,
                _ => UNSUPPORTED_MESSAGE,
            };
            self.emit(TrackingEvent::StatusMessage {
                message: message.to_string(),
                persistent: true,
            });
        } else {
            warn!(peer = %peer, %error, "ranging request rejected");
        }
    }

    fn handle_ranging_event(&mut self, event: RangingEvent) {
        match event {
            RangingEvent::Sample { peer, sample } => self.on_sample(peer, sample),
            event => self.on_session_event(event),
        }
    }

    fn on_session_event(&mut self, event: RangingEvent) {
        let peer = event.peer().clone();
        let Some(collection) = self.role.collection_of(&peer) else {
            trace!(peer = %peer, "ranging event for unknown peer dropped");
            return;
        };
        let outcome = match event {
            RangingEvent::Suspended { .. } => {
                if let Err(error) = collection.suspended(&peer) {
                    debug!(peer = %peer, %error, "suspension ignored");
                }
                SessionOutcome::Unchanged
            }
            RangingEvent::SuspensionEnded { .. } => match collection.suspension_ended(&peer, &mut self.capability) {
                Ok(()) => SessionOutcome::Unchanged,
                Err(error) => SessionOutcome::Failed(error),
            },
            RangingEvent::Removed { reason, .. } => collection.removed(&peer, reason, &mut self.capability),
            RangingEvent::Invalidated { error, .. } => collection.invalidated(&peer, error, &mut self.capability),
            RangingEvent::Sample { .. } => SessionOutcome::Unchanged,
        };

        match outcome {
            SessionOutcome::Restarted { token } => self.share_token(&peer, &token),
            SessionOutcome::Failed(error) => self.ranging_failed(&peer, error),
            SessionOutcome::Rearmed { attempt } => debug!(peer = %peer, attempt, "session re-armed"),
            SessionOutcome::Unchanged => {}
        }
        self.refresh_visualization();
        self.publish_status();
    }

    fn on_sample(&mut self, peer: PeerId, sample: RangingSample) {
        let Some(collection) = self.role.collection_of(&peer) else {
            trace!(peer = %peer, "sample for unknown peer dropped");
            return;
        };
        if !collection.apply_sample(&peer, sample.clone()) {
            return;
        }

        if let Some(distance) = sample.distance {
            self.errors
                .update_distance(self.local.peer_id(), peer.clone(), f64::from(distance));
        }

        let statistics = match &mut self.role {
            RoleTracker::Anchor(tracker) if tracker.anchors().contains(&peer) => {
                Some(*tracker.recompute_statistics())
            }
            _ => None,
        };
        if let Some(statistics) = statistics {
            self.emit(TrackingEvent::Statistics(statistics));
        }
        self.refresh_visualization();

        self.emit(TrackingEvent::Sample { peer, sample });
        self.publish_status();
    }

    fn refresh_visualization(&mut self) {
        let RoleTracker::Navigator(tracker) = &mut self.role else {
            return;
        };
        let Some(update) = tracker.update_visualization() else {
            return;
        };
        debug!(state = ?update.state, "visualization changed");
        self.emit(TrackingEvent::Visualization {
            target: update.target.clone(),
            state: update.state,
        });
        if let (true, Some(target)) = (update.haptic, update.target) {
            self.emit(TrackingEvent::Haptic { target });
        }
    }

    fn select_anchor(&mut self, anchor: Option<PeerId>) {
        let RoleTracker::Navigator(tracker) = &mut self.role else {
            warn!("anchor selection ignored outside the navigator role");
            return;
        };
        tracker.select(anchor.clone());
        self.transport.select_anchor(anchor);
        self.refresh_visualization();
        self.publish_status();
    }

    async fn set_destination(&mut self, destination: Destination) {
        let RoleTracker::Anchor(tracker) = &mut self.role else {
            warn!("destination ignored outside the anchor role");
            return;
        };
        tracker.set_destination(Some(destination));
        self.local.destination = Some(destination);
        info!(%destination, "local destination changed");

        let peers = self.transport.connected_peers();
        if !peers.is_empty() {
            match processing::token::encode_message(&WireMessage::DestinationUpdate(destination)) {
                Ok(data) => {
                    if let Err(error) = self.transport.send(&peers, &data, Reliability::Reliable) {
                        warn!(%error, "destination update not delivered to every peer");
                    }
                }
                Err(error) => warn!(%error, "destination update not encoded"),
            }
        }

        let change = self.role.evaluate_campaign();
        let started = matches!(change, Some(CampaignChange::Start(_)));
        if let Some(change) = change {
            self.apply_campaign_change(change).await;
        }
        if !started && self.role.is_campaign_active() {
            self.errors.register_participant(self.local.peer_id(), Some(destination));
        }
        self.publish_status();
    }

    async fn apply_campaign_change(&mut self, change: CampaignChange) {
        match change {
            CampaignChange::Start(participants) => {
                let ids: Vec<PeerId> = participants.iter().map(|(id, _)| id.clone()).collect();
                self.campaign_id = self.errors.start_campaign_confirmed(participants).await;
                info!(campaign = ?self.campaign_id, participants = ids.len(), "campaign started");
                self.emit(TrackingEvent::CampaignStarted {
                    campaign_id: self.campaign_id,
                    participants: ids,
                });
            }
            CampaignChange::End => {
                self.errors.end_campaign_confirmed().await;
                info!(campaign = ?self.campaign_id, "campaign ended");
                self.campaign_id = None;
                self.emit(TrackingEvent::CampaignEnded);
            }
        }
    }

    async fn teardown(&mut self) {
        info!("coordinator shutting down");
        if self.campaign_id.take().is_some() || self.role.is_campaign_active() {
            self.emit(TrackingEvent::CampaignEnded);
        }
        self.role.reset_campaign();
        self.errors.shutdown().await;
        if let Some(task) = self.error_task.take() {
            if let Err(error) = task.await {
                warn!(%error, "error tracker task failed");
            }
        }

        let invalidated = self.role.disconnect_all(&mut self.capability);
        self.transport.disconnect();
        debug!(invalidated, "sessions invalidated, transport closed");

        self.publish_status();
        self.emit(TrackingEvent::Stopped);
    }

    fn snapshot(&self) -> StatusSnapshot {
        let peers: Vec<PeerStatus> = self
            .role
            .collections()
            .into_iter()
            .flat_map(|collection| collection.peers())
            .map(|peer| PeerStatus {
                id: peer.id(),
                role: peer.role(),
                display_name: peer.descriptor.display_name.clone(),
                destination: peer.destination(),
                state: peer.connection_state,
                distance: peer.last_distance(),
                azimuth_deg: peer.last_sample.as_ref().and_then(|s| s.azimuth_deg()),
            })
            .collect();

        let (connected_anchors, connected_navigators, selected_target, visualization, statistics) = match &self.role {
            RoleTracker::Anchor(tracker) => (
                tracker.anchors().connected_count(),
                tracker.navigators().connected_count(),
                None,
                None,
                Some(*tracker.statistics()),
            ),
            RoleTracker::Navigator(tracker) => (
                tracker.anchors().connected_count(),
                0,
                tracker.primary().map(|p| p.id()),
                Some(tracker.visualization()),
                None,
            ),
        };

        StatusSnapshot {
            device_id: self.local.peer_id(),
            role: self.local.role,
            display_name: self.local.display_name.clone(),
            destination: self.local.destination,
            selected_target,
            battery_level: self.context.profile.battery_level(),
            connected_anchors,
            connected_navigators,
            peers,
            visualization,
            statistics,
            campaign_id: self.campaign_id,
            timestamp_ms: now_ms(),
        }
    }

    fn publish_status(&self) {
        self.exporter.push(self.snapshot());
    }

    fn emit(&self, event: TrackingEvent) {
        if self.events.send(event).is_err() {
            trace!("tracking event dropped, no subscriber");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemorySink, SharedStatus};
    use crate::context::StaticProfile;
    use crate::core::ConnectionState;
    use crate::ranging::{MockRangingCapability, MockRangingProbe, RemovalReason};
    use crate::tracking::VisualizationState;
    use crate::transport::{LinkCall, MockLinkBackend, MockLinkProbe};
    use crate::utils::TrackingConfig;
    use nalgebra::Vector3;

    struct Harness {
        handle: CoordinatorHandle,
        task: JoinHandle<()>,
        link: MockLinkProbe,
        ranging: MockRangingProbe,
        sink: MemorySink,
        status: SharedStatus,
        events: broadcast::Receiver<TrackingEvent>,
    }

    fn start(profile: StaticProfile, configure: impl FnOnce(&mut TrackingConfig)) -> Harness {
        let mut config = TrackingConfig::default();
        config.ranging.removal_grace_ms = 0;
        configure(&mut config);

        let (backend, link) = MockLinkBackend::new();
        let (capability, ranging) = MockRangingCapability::new();
        let sink = MemorySink::new();
        let status = SharedStatus::new();
        let context = AppContext::new(Arc::new(profile), config);

        let (handle, task) = Coordinator::spawn(
            context,
            backend,
            capability,
            Box::new(sink.clone()),
            Arc::new(status.clone()),
        )
        .unwrap();
        let events = handle.subscribe();
        Harness {
            handle,
            task,
            link,
            ranging,
            sink,
            status,
            events,
        }
    }

    impl Harness {
        fn connect(&self, handle: u64, descriptor: PeerDescriptor) {
            self.handle
                .link_event(LinkEvent::Invitation {
                    handle: LinkHandle(handle),
                    descriptor,
                    reply: None,
                })
                .unwrap();
            self.handle.link_event(LinkEvent::Connected(LinkHandle(handle))).unwrap();
        }

        fn send_token(&self, handle: u64, bytes: &[u8]) {
            let data = processing::encode(&DiscoveryToken::new(bytes)).unwrap();
            self.handle
                .link_event(LinkEvent::Data {
                    handle: LinkHandle(handle),
                    data,
                })
                .unwrap();
        }

        fn sample(&self, peer: &PeerId, distance: Option<f32>, direction: Option<Vector3<f32>>) {
            self.handle
                .ranging_event(RangingEvent::Sample {
                    peer: peer.clone(),
                    sample: RangingSample::new(distance, direction),
                })
                .unwrap();
        }

        async fn sync(&self) -> StatusSnapshot {
            self.handle.status().await.unwrap()
        }

        fn drain_events(&mut self) -> Vec<TrackingEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }
    }

    fn anchor(id: &str, destination: Destination) -> PeerDescriptor {
        PeerDescriptor::new(Role::Anchor, id, id.to_uppercase()).with_destination(destination)
    }

    #[tokio::test]
    async fn test_connect_shares_token() {
        let harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        harness.connect(1, anchor("k", Destination::Kitchen));
        let status = harness.sync().await;

        assert_eq!(status.connected_anchors, 1);
        assert_eq!(status.peers[0].state, ConnectionState::TokenExchanged);
        let sent = harness.link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec![LinkHandle(1)]);
        assert!(processing::decode(&sent[0].1).is_ok());
    }

    #[tokio::test]
    async fn test_campaign_starts_with_required_set() {
        let mut harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.sync().await;
        assert!(harness.sink.campaigns().is_empty());

        harness.connect(2, anchor("m", Destination::MeetingRoom));
        let status = harness.sync().await;

        let campaigns = harness.sink.campaigns();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].participants.len(), 3);
        assert_eq!(status.campaign_id, Some(campaigns[0].campaign_id));
        assert!(harness
            .drain_events()
            .iter()
            .any(|e| matches!(e, TrackingEvent::CampaignStarted { participants, .. } if participants.len() == 3)));
    }

    #[tokio::test]
    async fn test_required_anchor_leaving_ends_campaign() {
        let mut harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.connect(2, anchor("m", Destination::MeetingRoom));
        harness.handle.link_event(LinkEvent::Disconnected(LinkHandle(1))).unwrap();
        let status = harness.sync().await;

        assert_eq!(status.campaign_id, None);
        assert_eq!(status.connected_anchors, 1);
        assert!(harness.sink.campaigns()[0].ended_at_ms.is_some());
        let events = harness.drain_events();
        assert!(events.contains(&TrackingEvent::CampaignEnded));
        assert!(events.contains(&TrackingEvent::PeerRemoved {
            peer: PeerId::new(Role::Anchor, "k")
        }));
    }

    #[tokio::test]
    async fn test_timeout_rearms_and_peer_stays() {
        let harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        let k = PeerId::new(Role::Anchor, "k");
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.send_token(1, b"remote-k");
        harness.sample(&k, Some(10.1), None);
        harness
            .handle
            .ranging_event(RangingEvent::Removed {
                peer: k.clone(),
                reason: RemovalReason::Timeout,
            })
            .unwrap();
        let status = harness.sync().await;

        assert_eq!(harness.ranging.run_count(&k), 2);
        assert_eq!(harness.ranging.running(), vec![k.clone()]);
        assert_eq!(status.peers[0].state, ConnectionState::Tracking);
        assert_eq!(harness.link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_restarted_peer_gets_token_again() {
        let harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        let k = PeerId::new(Role::Anchor, "k");
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.send_token(1, b"remote-k");
        harness.send_token(1, b"remote-k");
        harness.sync().await;
        assert_eq!(harness.link.sent().len(), 1);

        harness.send_token(1, b"remote-k-restarted");
        harness.sync().await;

        let sent = harness.link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
        assert_eq!(harness.ranging.run_count(&k), 2);
        assert_eq!(harness.ranging.running(), vec![k]);
    }

    #[tokio::test]
    async fn test_permission_denied_raises_persistent_message() {
        let mut harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        let k = PeerId::new(Role::Anchor, "k");
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.send_token(1, b"remote-k");
        harness
            .handle
            .ranging_event(RangingEvent::Invalidated {
                peer: k.clone(),
                error: RangingError::PermissionDenied,
            })
            .unwrap();
        harness.sync().await;

        assert!(harness.ranging.running().is_empty());
        assert!(harness
            .drain_events()
            .iter()
            .any(|e| matches!(e, TrackingEvent::StatusMessage { persistent: true, .. })));
    }

    #[tokio::test]
    async fn test_foreign_payload_ignored() {
        let harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        let k = PeerId::new(Role::Anchor, "k");
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness
            .handle
            .link_event(LinkEvent::Data {
                handle: LinkHandle(1),
                data: b"{\"hello\":1}".to_vec(),
            })
            .unwrap();
        harness.sync().await;
        assert_eq!(harness.ranging.run_count(&k), 0);
    }

    #[tokio::test]
    async fn test_navigator_haptic_and_visualization() {
        let mut harness = start(StaticProfile::navigator("n"), |_| {});
        let a = PeerId::new(Role::Anchor, "a");
        harness.connect(1, anchor("a", Destination::Kitchen));
        harness.send_token(1, b"remote-a");

        let ahead = Some(Vector3::new(0.0, 0.0, -1.0));
        for distance in [2.0, 0.2, 0.1, 1.0, 0.25] {
            harness.sample(&a, Some(distance), ahead);
        }
        let status = harness.sync().await;

        let events = harness.drain_events();
        let haptics = events
            .iter()
            .filter(|e| matches!(e, TrackingEvent::Haptic { .. }))
            .count();
        assert_eq!(haptics, 2);
        assert_eq!(status.visualization, Some(VisualizationState::CloseAndVisible));
        assert_eq!(status.selected_target, Some(a));
    }

    #[tokio::test]
    async fn test_navigator_rejects_unselected_anchor() {
        let harness = start(StaticProfile::navigator("n"), |_| {});
        harness
            .handle
            .select_anchor(Some(PeerId::new(Role::Anchor, "a")))
            .unwrap();

        let accepted = harness
            .handle
            .invitation(LinkHandle(2), anchor("b", Destination::Window))
            .await
            .unwrap();
        assert!(!accepted);
        let accepted = harness
            .handle
            .invitation(LinkHandle(1), anchor("a", Destination::Kitchen))
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_destination_update_completes_required_set() {
        let harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.connect(2, PeerDescriptor::new(Role::Anchor, "m", "M"));
        harness.sync().await;
        assert!(harness.sink.campaigns().is_empty());

        let data = processing::token::encode_message(&WireMessage::DestinationUpdate(Destination::MeetingRoom)).unwrap();
        harness
            .handle
            .link_event(LinkEvent::Data {
                handle: LinkHandle(2),
                data,
            })
            .unwrap();
        let status = harness.sync().await;
        assert!(status.campaign_id.is_some());
        assert_eq!(harness.sink.campaigns()[0].participants.len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_order() {
        let mut harness = start(StaticProfile::anchor("w", Destination::Window), |_| {});
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.connect(2, anchor("m", Destination::MeetingRoom));
        harness.send_token(1, b"remote-k");
        harness.sync().await;

        harness.handle.shutdown().await.unwrap();
        (&mut harness.task).await.unwrap();

        assert!(harness.sink.campaigns()[0].ended_at_ms.is_some());
        assert!(harness.ranging.running().is_empty());
        assert_eq!(harness.link.calls().last(), Some(&LinkCall::Shutdown));

        let events = harness.drain_events();
        let ended = events.iter().position(|e| *e == TrackingEvent::CampaignEnded);
        let stopped = events.iter().position(|e| *e == TrackingEvent::Stopped);
        assert!(ended.is_some() && ended < stopped);
        assert!(matches!(harness.handle.status().await, Err(CoordinatorError::Stopped)));
        assert_eq!(harness.status.latest().map(|s| s.connected_anchors), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_delays_removal() {
        let mut harness = start(StaticProfile::anchor("w", Destination::Window), |config| {
            config.ranging.removal_grace_ms = 1500;
        });
        let k = PeerId::new(Role::Anchor, "k");
        harness.connect(1, anchor("k", Destination::Kitchen));
        harness.handle.link_event(LinkEvent::Disconnected(LinkHandle(1))).unwrap();
        let status = harness.sync().await;
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].state, ConnectionState::Disconnected);

        time::sleep(Duration::from_millis(1600)).await;
        let status = harness.sync().await;
        assert!(status.peers.is_empty());
        assert!(harness.drain_events().contains(&TrackingEvent::PeerRemoved { peer: k }));
    }
}
