//! Distance error tracking against surveyed ground truth
//!
//! [`DistanceErrorTracker`] holds the active campaign and the latest sample of
//! every unordered device pair. [`spawn`] runs it in its own task, handling
//! the snapshot tick and update commands in one loop so a snapshot never sees
//! a half-applied update.

use crate::api::persistence::PersistenceSink;
use crate::core::{now_ms, Destination, PeerId};
use crate::measurement::{GroundTruthTable, MeasurementCampaign, MeasurementRecord};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PairSample {
    distance: f64,
    timestamp_ms: u64,
}

fn pair_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Owns the measurement campaign and turns pair samples into records
pub struct DistanceErrorTracker {
    ground_truth: GroundTruthTable,
    sample_max_age_ms: u64,
    campaign: Option<MeasurementCampaign>,
    samples: HashMap<(PeerId, PeerId), PairSample>,
    sink: Box<dyn PersistenceSink>,
    records_emitted: usize,
    failed_batches: usize,
}

impl DistanceErrorTracker {
    pub fn new(ground_truth: GroundTruthTable, sample_max_age_ms: u64, sink: Box<dyn PersistenceSink>) -> Self {
        Self {
            ground_truth,
            sample_max_age_ms,
            campaign: None,
            samples: HashMap::new(),
            sink,
            records_emitted: 0,
            failed_batches: 0,
        }
    }

    pub fn campaign(&self) -> Option<&MeasurementCampaign> {
        self.campaign.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.campaign.is_some()
    }

    pub fn pair_count(&self) -> usize {
        self.samples.len()
    }

    pub fn records_emitted(&self) -> usize {
        self.records_emitted
    }

    pub fn failed_batches(&self) -> usize {
        self.failed_batches
    }

    /// Start a campaign. Returns `None` and changes nothing when one is
    /// already running.
    pub fn start_campaign<I>(&mut self, participants: I) -> Option<Uuid>
    where
        I: IntoIterator<Item = (PeerId, Option<Destination>)>,
    {
        if let Some(active) = &self.campaign {
            warn!(campaign = %active.campaign_id, "campaign already running, start ignored");
            return None;
        }

        let campaign = MeasurementCampaign::new(participants);
        let campaign_id = campaign.campaign_id;
        if let Err(error) = self.sink.begin_campaign(&campaign) {
            warn!(campaign = %campaign_id, %error, "could not persist campaign start");
        }
        info!(
            campaign = %campaign_id,
            participants = campaign.participants.len(),
            "measurement campaign started"
        );
        self.campaign = Some(campaign);
        Some(campaign_id)
    }

    /// End the running campaign, discarding sample state. Calling it without
    /// a campaign does nothing.
    pub fn end_campaign(&mut self) -> Option<MeasurementCampaign> {
        let mut campaign = self.campaign.take()?;
        campaign.ended_at_ms = Some(now_ms());
        self.samples.clear();
        if let Err(error) = self.sink.end_campaign(&campaign) {
            warn!(campaign = %campaign.campaign_id, %error, "could not persist campaign end");
        }
        info!(campaign = %campaign.campaign_id, "measurement campaign ended");
        Some(campaign)
    }

    /// Store the latest distance between two devices; the newest value wins
    /// regardless of direction.
    pub fn update_distance(&mut self, from: &PeerId, to: &PeerId, distance: f64) {
        self.update_distance_at(from, to, distance, now_ms());
    }

    pub fn update_distance_at(&mut self, from: &PeerId, to: &PeerId, distance: f64, timestamp_ms: u64) {
        if from == to || !distance.is_finite() || distance < 0.0 {
            trace!(from = %from, to = %to, distance, "distance update ignored");
            return;
        }
        self.samples.insert(
            pair_key(from, to),
            PairSample {
                distance,
                timestamp_ms,
            },
        );
    }

    /// Add or update a participant of the running campaign
    pub fn register_participant(&mut self, id: PeerId, position: Option<Destination>) -> bool {
        match self.campaign.as_mut() {
            Some(campaign) => {
                debug!(peer = %id, ?position, "participant registered");
                campaign.upsert(id, position);
                true
            }
            None => {
                debug!(peer = %id, "no running campaign, participant not registered");
                false
            }
        }
    }

    /// Drop a participant and every pending pair it belongs to
    pub fn unregister_participant(&mut self, id: &PeerId) {
        if let Some(campaign) = self.campaign.as_mut() {
            campaign.remove(id);
        }
        let before = self.samples.len();
        self.samples.retain(|(a, b), _| a != id && b != id);
        debug!(peer = %id, purged = before - self.samples.len(), "participant unregistered");
    }

    fn ground_truth_for(&self, campaign: &MeasurementCampaign, a: &PeerId, b: &PeerId) -> Option<f64> {
        let position_a = campaign.position_of(a)?;
        let position_b = campaign.position_of(b)?;
        self.ground_truth.lookup(position_a, position_b)
    }

    /// One record per pair whose sample is at most `sample_max_age_ms` old
    pub fn snapshot(&self, now_ms: u64) -> Vec<MeasurementRecord> {
        let Some(campaign) = &self.campaign else {
            return Vec::new();
        };

        let mut records: Vec<MeasurementRecord> = self
            .samples
            .iter()
            .filter(|(_, sample)| now_ms.saturating_sub(sample.timestamp_ms) <= self.sample_max_age_ms)
            .map(|((a, b), sample)| {
                MeasurementRecord::new(
                    a.clone(),
                    b.clone(),
                    sample.distance,
                    self.ground_truth_for(campaign, a, b),
                    now_ms,
                )
            })
            .collect();
        records.sort_by(|x, y| (&x.device_i, &x.device_j).cmp(&(&y.device_i, &y.device_j)));
        records
    }

    /// Snapshot and hand the batch to persistence. Returns how many records
    /// were persisted; a failed batch is logged and counts as zero.
    pub fn tick(&mut self, now_ms: u64) -> usize {
        let Some(campaign_id) = self.campaign.as_ref().map(|c| c.campaign_id) else {
            return 0;
        };
        let records = self.snapshot(now_ms);
        if records.is_empty() {
            trace!(campaign = %campaign_id, "no fresh samples to record");
            return 0;
        }

        match self.sink.persist_batch(campaign_id, &records) {
            Ok(()) => {
                self.records_emitted += records.len();
                debug!(campaign = %campaign_id, records = records.len(), "batch persisted");
                records.len()
            }
            Err(error) => {
                self.failed_batches += 1;
                warn!(campaign = %campaign_id, records = records.len(), %error, "batch not persisted");
                0
            }
        }
    }
}

/// Commands accepted by the tracker task
#[derive(Debug)]
pub enum TrackerCommand {
    StartCampaign {
        participants: Vec<(PeerId, Option<Destination>)>,
        reply: Option<oneshot::Sender<Option<Uuid>>>,
    },
    EndCampaign {
        reply: Option<oneshot::Sender<Option<MeasurementCampaign>>>,
    },
    UpdateDistance {
        from: PeerId,
        to: PeerId,
        distance: f64,
    },
    RegisterParticipant {
        id: PeerId,
        position: Option<Destination>,
    },
    UnregisterParticipant {
        id: PeerId,
    },
    /// End any campaign and stop the task
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cheap cloneable handle to a running tracker task. Sends never block.
#[derive(Debug, Clone)]
pub struct ErrorTrackerHandle {
    commands: mpsc::UnboundedSender<TrackerCommand>,
}

impl ErrorTrackerHandle {
    fn send(&self, command: TrackerCommand) {
        if self.commands.send(command).is_err() {
            trace!("error tracker stopped, command dropped");
        }
    }

    pub fn start_campaign(&self, participants: Vec<(PeerId, Option<Destination>)>) {
        self.send(TrackerCommand::StartCampaign {
            participants,
            reply: None,
        });
    }

    /// Start a campaign and wait for its id (`None` if one was running)
    pub async fn start_campaign_confirmed(&self, participants: Vec<(PeerId, Option<Destination>)>) -> Option<Uuid> {
        let (reply, response) = oneshot::channel();
        self.send(TrackerCommand::StartCampaign {
            participants,
            reply: Some(reply),
        });
        response.await.ok().flatten()
    }

    pub fn end_campaign(&self) {
        self.send(TrackerCommand::EndCampaign { reply: None });
    }

    /// End the campaign and wait for the closed campaign, if there was one
    pub async fn end_campaign_confirmed(&self) -> Option<MeasurementCampaign> {
        let (reply, response) = oneshot::channel();
        self.send(TrackerCommand::EndCampaign { reply: Some(reply) });
        response.await.ok().flatten()
    }

    pub fn update_distance(&self, from: PeerId, to: PeerId, distance: f64) {
        self.send(TrackerCommand::UpdateDistance { from, to, distance });
    }

    pub fn register_participant(&self, id: PeerId, position: Option<Destination>) {
        self.send(TrackerCommand::RegisterParticipant { id, position });
    }

    pub fn unregister_participant(&self, id: PeerId) {
        self.send(TrackerCommand::UnregisterParticipant { id });
    }

    /// End the campaign, stop the tick and wait for the task to finish
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        self.send(TrackerCommand::Shutdown { reply });
        let _ = done.await;
    }
}

/// Run `tracker` in its own task, snapshotting every `record_interval`
pub fn spawn(tracker: DistanceErrorTracker, record_interval: Duration) -> (ErrorTrackerHandle, JoinHandle<DistanceErrorTracker>) {
    let (commands, inbox) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(tracker, record_interval, inbox));
    (ErrorTrackerHandle { commands }, task)
}

async fn run(
    mut tracker: DistanceErrorTracker,
    record_interval: Duration,
    mut inbox: mpsc::UnboundedReceiver<TrackerCommand>,
) -> DistanceErrorTracker {
    let mut ticker = time::interval_at(Instant::now() + record_interval, record_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick(), if tracker.is_active() => {
                tracker.tick(now_ms());
            }
            command = inbox.recv() => {
                let Some(command) = command else {
                    tracker.end_campaign();
                    break;
                };
                match command {
                    TrackerCommand::StartCampaign { participants, reply } => {
                        let started = tracker.start_campaign(participants);
                        if started.is_some() {
                            ticker.reset();
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(started);
                        }
                    }
                    TrackerCommand::EndCampaign { reply } => {
                        let ended = tracker.end_campaign();
                        if let Some(reply) = reply {
                            let _ = reply.send(ended);
                        }
                    }
                    TrackerCommand::UpdateDistance { from, to, distance } => {
                        tracker.update_distance(&from, &to, distance);
                    }
                    TrackerCommand::RegisterParticipant { id, position } => {
                        tracker.register_participant(id, position);
                    }
                    TrackerCommand::UnregisterParticipant { id } => {
                        tracker.unregister_participant(&id);
                    }
                    TrackerCommand::Shutdown { reply } => {
                        tracker.end_campaign();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
    }

    debug!("error tracker stopped");
    tracker
}
