//! Destinations for campaigns and measurement records

use crate::measurement::{MeasurementCampaign, MeasurementRecord};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error("serialization error: {message}")]
    Serialization { message: String },
    #[error("campaign {campaign_id} is not open")]
    UnknownCampaign { campaign_id: Uuid },
    #[error("sink unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Receives campaigns and batches of records from the error tracker.
///
/// A batch is written entirely or not at all.
pub trait PersistenceSink: Send {
    fn begin_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()>;

    fn persist_batch(&mut self, campaign_id: Uuid, records: &[MeasurementRecord]) -> PersistenceResult<()>;

    fn end_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    campaigns: Vec<MeasurementCampaign>,
    batches: Vec<(Uuid, Vec<MeasurementRecord>)>,
    fail_next: usize,
}

/// In-memory sink; clones share the same storage
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Campaigns as last reported (ended campaigns carry `ended_at_ms`)
    pub fn campaigns(&self) -> Vec<MeasurementCampaign> {
        self.lock().campaigns.clone()
    }

    pub fn batches(&self) -> Vec<(Uuid, Vec<MeasurementRecord>)> {
        self.lock().batches.clone()
    }

    /// Every record persisted so far, in order
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.lock()
            .batches
            .iter()
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    /// Reject the next `count` batches
    pub fn fail_next_batches(&self, count: usize) {
        self.lock().fail_next = count;
    }
}

impl PersistenceSink for MemorySink {
    fn begin_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()> {
        self.lock().campaigns.push(campaign.clone());
        Ok(())
    }

    fn persist_batch(&mut self, campaign_id: Uuid, records: &[MeasurementRecord]) -> PersistenceResult<()> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PersistenceError::Unavailable {
                reason: "simulated write failure".to_string(),
            });
        }
        if !state.campaigns.iter().any(|c| c.campaign_id == campaign_id) {
            return Err(PersistenceError::UnknownCampaign { campaign_id });
        }
        state.batches.push((campaign_id, records.to_vec()));
        Ok(())
    }

    fn end_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()> {
        let mut state = self.lock();
        match state
            .campaigns
            .iter_mut()
            .find(|c| c.campaign_id == campaign.campaign_id)
        {
            Some(existing) => {
                *existing = campaign.clone();
                Ok(())
            }
            None => Err(PersistenceError::UnknownCampaign {
                campaign_id: campaign.campaign_id,
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    CampaignStarted { campaign: &'a MeasurementCampaign },
    Record { campaign_id: Uuid, record: &'a MeasurementRecord },
    CampaignEnded { campaign: &'a MeasurementCampaign },
}

/// Appends newline-delimited JSON to a file
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PersistenceError::Io {
                message: format!("Failed to open '{}': {}", path.display(), e),
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_lines(&mut self, lines: &[Line<'_>]) -> PersistenceResult<()> {
        let mut buffer = Vec::new();
        for line in lines {
            serde_json::to_writer(&mut buffer, line).map_err(|e| PersistenceError::Serialization {
                message: e.to_string(),
            })?;
            buffer.push(b'\n');
        }
        append_all(&mut self.file, &buffer).map_err(|e| PersistenceError::Io {
            message: format!("Failed to write '{}': {}", self.path.display(), e),
        })
    }
}

/// Append `buffer` to `file`. On failure the file is cut back to its previous
/// length so a partial batch never stays behind.
fn append_all(file: &mut File, buffer: &[u8]) -> io::Result<()> {
    let start = file.metadata()?.len();
    if let Err(error) = file.write_all(buffer).and_then(|_| file.flush()) {
        if let Err(rollback) = file.set_len(start) {
            warn!(%rollback, "could not roll back partial write");
        }
        return Err(error);
    }
    Ok(())
}

impl PersistenceSink for JsonLinesSink {
    fn begin_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()> {
        self.write_lines(&[Line::CampaignStarted { campaign }])
    }

    fn persist_batch(&mut self, campaign_id: Uuid, records: &[MeasurementRecord]) -> PersistenceResult<()> {
        let lines: Vec<Line<'_>> = records
            .iter()
            .map(|record| Line::Record { campaign_id, record })
            .collect();
        self.write_lines(&lines)
    }

    fn end_campaign(&mut self, campaign: &MeasurementCampaign) -> PersistenceResult<()> {
        self.write_lines(&[Line::CampaignEnded { campaign }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Destination, PeerId, Role};

    fn campaign() -> MeasurementCampaign {
        MeasurementCampaign::new(vec![
            (PeerId::new(Role::Anchor, "a"), Some(Destination::Window)),
            (PeerId::new(Role::Anchor, "b"), Some(Destination::Kitchen)),
        ])
    }

    fn record() -> MeasurementRecord {
        MeasurementRecord::new(
            PeerId::new(Role::Anchor, "a"),
            PeerId::new(Role::Anchor, "b"),
            10.4,
            Some(10.287),
            1,
        )
    }

    #[test]
    fn test_memory_sink_shares_storage() {
        let probe = MemorySink::new();
        let mut sink = probe.clone();
        let campaign = campaign();

        sink.begin_campaign(&campaign).unwrap();
        sink.persist_batch(campaign.campaign_id, &[record(), record()]).unwrap();

        assert_eq!(probe.campaigns().len(), 1);
        assert_eq!(probe.records().len(), 2);
    }

    #[test]
    fn test_memory_sink_rejects_unknown_campaign() {
        let mut sink = MemorySink::new();
        let result = sink.persist_batch(Uuid::new_v4(), &[record()]);
        assert!(matches!(result, Err(PersistenceError::UnknownCampaign { .. })));
    }

    #[test]
    fn test_memory_sink_failed_batch_is_not_stored() {
        let mut sink = MemorySink::new();
        let campaign = campaign();
        sink.begin_campaign(&campaign).unwrap();
        sink.fail_next_batches(1);

        assert!(sink.persist_batch(campaign.campaign_id, &[record()]).is_err());
        assert!(sink.records().is_empty());
        assert!(sink.persist_batch(campaign.campaign_id, &[record()]).is_ok());
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_json_lines_sink() {
        let path = std::env::temp_dir().join(format!("records-{}.jsonl", Uuid::new_v4()));
        let campaign = campaign();
        {
            let mut sink = JsonLinesSink::open(&path).unwrap();
            sink.begin_campaign(&campaign).unwrap();
            sink.persist_batch(campaign.campaign_id, &[record()]).unwrap();
            sink.end_campaign(&campaign).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "campaign_started");
        assert_eq!(lines[1]["type"], "record");
        assert_eq!(lines[1]["record"]["d_true"], 10.287);
        assert_eq!(lines[2]["type"], "campaign_ended");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_failed_append_leaves_file_unchanged() {
        let path = std::env::temp_dir().join(format!("records-{}.jsonl", Uuid::new_v4()));
        std::fs::write(&path, b"{\"type\":\"campaign_started\"}\n").unwrap();

        let mut read_only = File::open(&path).unwrap();
        assert!(append_all(&mut read_only, b"{\"type\":\"record\"}\n").is_err());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        let mut writable = OpenOptions::new().append(true).open(&path).unwrap();
        append_all(&mut writable, b"{\"type\":\"record\"}\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
