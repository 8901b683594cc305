//! Simulated walk-through
//!
//! Runs the window anchor against in-memory link and ranging backends, brings
//! the kitchen and meeting-room anchors online, feeds slightly noisy samples
//! and prints the status and every record written during the campaign. A
//! navigator walking towards the kitchen anchor runs alongside.
//!
//! Usage: `ranging-coordinator [config.json]`

use ranging_coordinator::core::constants::{WINDOW_KITCHEN_M, WINDOW_MEETING_ROOM_M};
use ranging_coordinator::processing;
use ranging_coordinator::ranging::MockRangingCapability;
use ranging_coordinator::transport::MockLinkBackend;
use ranging_coordinator::{
    init_logging, AppContext, ConfigurationManager, Coordinator, CoordinatorHandle, Destination,
    DiscoveryToken, JsonLinesSink, LinkEvent, LinkHandle, MemorySink, PeerDescriptor, PeerId,
    PersistenceSink, RangingEvent, RangingSample, Role, SharedStatus, StaticProfile, TrackingConfig,
    TrackingEvent,
};
use nalgebra::Vector3;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ROUNDS: u64 = 3;

/// Deterministic measurement noise in meters, within ±0.1
fn noise(round: u64, link: u64) -> f64 {
    ((round * 7 + link * 3) % 5) as f64 * 0.05 - 0.1
}

/// Link `descriptor` to `coordinator` and hand over the remote token
async fn link(coordinator: &CoordinatorHandle, link: u64, descriptor: PeerDescriptor) -> Result<bool, Box<dyn Error>> {
    let user = descriptor.user_id.clone();
    let handle = LinkHandle(link);
    if !coordinator.invitation(handle, descriptor).await? {
        info!(user = %user, "invitation refused");
        return Ok(false);
    }
    coordinator.link_event(LinkEvent::Connected(handle))?;
    let token = processing::encode(&DiscoveryToken::new(format!("{}-token", user)))?;
    coordinator.link_event(LinkEvent::Data { handle, data: token })?;
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ConfigurationManager::from_file(path)?.get_config().clone(),
        None => TrackingConfig::default(),
    };
    init_logging(&config.logging);

    let memory = MemorySink::new();
    let sink: Box<dyn PersistenceSink> = match &config.campaign.output_path {
        Some(path) => Box::new(JsonLinesSink::open(path)?),
        None => Box::new(memory.clone()),
    };
    let status = SharedStatus::new();
    let context = AppContext::new(
        Arc::new(StaticProfile::anchor("window", Destination::Window)),
        config.clone(),
    );

    let (backend, _link) = MockLinkBackend::new();
    let (capability, _ranging) = MockRangingCapability::new();
    let (coordinator, task) = Coordinator::spawn(context, backend, capability, sink, Arc::new(status.clone()))?;

    let remotes = [
        (1, "kitchen", Destination::Kitchen, WINDOW_KITCHEN_M),
        (2, "meeting", Destination::MeetingRoom, WINDOW_MEETING_ROOM_M),
    ];

    for (handle, user, destination, _) in remotes {
        let descriptor = PeerDescriptor::new(Role::Anchor, user, destination.as_str()).with_destination(destination);
        link(&coordinator, handle, descriptor).await?;
    }

    let navigator_context = AppContext::new(Arc::new(StaticProfile::navigator("visitor")), config.clone());
    let (backend, _link) = MockLinkBackend::new();
    let (capability, _ranging) = MockRangingCapability::new();
    let (navigator, navigator_task) = Coordinator::spawn(
        navigator_context,
        backend,
        capability,
        Box::new(MemorySink::new()),
        Arc::new(SharedStatus::new()),
    )?;
    let mut guidance = navigator.subscribe();
    let kitchen = PeerId::new(Role::Anchor, "kitchen");
    navigator.select_anchor(Some(kitchen.clone()))?;
    link(
        &navigator,
        1,
        PeerDescriptor::new(Role::Anchor, "kitchen", "kitchen").with_destination(Destination::Kitchen),
    )
    .await?;

    let interval = Duration::from_millis(config.campaign.record_interval_ms);
    for round in 0..ROUNDS {
        for (handle, user, _, truth) in remotes {
            let measured = truth + noise(round, handle);
            coordinator.ranging_event(RangingEvent::Sample {
                peer: PeerId::new(Role::Anchor, user),
                sample: RangingSample::new(Some(measured as f32), None),
            })?;
        }
        let remaining = 2.0 - round as f32 * 0.9;
        navigator.ranging_event(RangingEvent::Sample {
            peer: kitchen.clone(),
            sample: RangingSample::new(Some(remaining.max(0.1)), Some(Vector3::new(0.0, 0.0, -1.0))),
        })?;
        tokio::time::sleep(interval).await;
    }

    navigator.status().await?;
    while let Ok(event) = guidance.try_recv() {
        match event {
            TrackingEvent::Visualization { state, .. } => info!(?state, "navigator guidance"),
            TrackingEvent::Haptic { target } => info!(target = %target, "navigator haptic"),
            _ => {}
        }
    }
    navigator.shutdown().await?;
    navigator_task.await?;

    let snapshot = coordinator.status().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    coordinator.shutdown().await?;
    task.await?;

    for record in memory.records() {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
