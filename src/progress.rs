use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    #[serde(rename = "Summary Scan")]
    SummaryScan,
    #[serde(rename = "Deep Scan")]
    DeepScan,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::SummaryScan => "Summary Scan",
            Phase::DeepScan => "Deep Scan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Running,
    Suspended,
    Finished,
}

/// Latest published state of a run. Always replaced whole.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSnapshot {
    pub site: String,
    pub phase: Phase,
    pub keyword: String,
    pub keyword_index: u32,
    pub total_keywords: u32,
    pub processed_count: u32,
    pub total_listings: u32,
    pub not_suitable: u32,
    pub suitable: u32,
    pub highly_suitable: u32,
    pub skipped_existing: u32,
    pub deep_scanned: u32,
    pub total_deep: u32,
    pub state: RunState,
    pub updated_at: String,
}

/// Suitability band a score falls in for progress counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    NotSuitable,
    Suitable,
    HighlySuitable,
}

impl Bucket {
    pub fn of(score: u8, threshold: u8) -> Self {
        if score >= threshold {
            Bucket::HighlySuitable
        } else if score <= 2 {
            Bucket::NotSuitable
        } else {
            Bucket::Suitable
        }
    }
}

impl ProgressSnapshot {
    pub fn add_to_bucket(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::NotSuitable => self.not_suitable += 1,
            Bucket::Suitable => self.suitable += 1,
            Bucket::HighlySuitable => self.highly_suitable += 1,
        }
    }

    pub fn remove_from_bucket(&mut self, bucket: Bucket) {
        let counter = match bucket {
            Bucket::NotSuitable => &mut self.not_suitable,
            Bucket::Suitable => &mut self.suitable,
            Bucket::HighlySuitable => &mut self.highly_suitable,
        };
        *counter = counter.saturating_sub(1);
    }
}

/// Where snapshots get published.
pub trait ProgressSink {
    fn publish(&mut self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// Writes the snapshot to a temp sibling and renames it over the target, so a
/// reader sees either the previous file or the new one.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProgressSink for JsonFileSink {
    fn publish(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(snapshot)?)
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// `None` when no run has published yet or the file can't be parsed.
pub fn read_snapshot(path: &Path) -> Option<ProgressSnapshot> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Owns the current snapshot. Every change builds a new snapshot, publishes
/// it, and only then makes it current.
pub struct ProgressTracker {
    sink: Box<dyn ProgressSink>,
    current: ProgressSnapshot,
}

impl ProgressTracker {
    pub fn new(sink: Box<dyn ProgressSink>, site: &str) -> Self {
        Self {
            sink,
            current: ProgressSnapshot {
                site: site.to_string(),
                ..Default::default()
            },
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> &ProgressSnapshot {
        &self.current
    }

    /// Fresh counters for the next keyword.
    pub fn begin_keyword(&mut self, keyword: &str, index: u32, total: u32) {
        let site = self.current.site.clone();
        self.replace(ProgressSnapshot {
            site,
            phase: Phase::SummaryScan,
            keyword: keyword.to_string(),
            keyword_index: index,
            total_keywords: total,
            ..Default::default()
        });
    }

    pub fn update(&mut self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let mut next = self.current.clone();
        change(&mut next);
        self.replace(next);
    }

    pub fn set_state(&mut self, state: RunState) {
        self.update(|s| s.state = state);
    }

    fn replace(&mut self, mut next: ProgressSnapshot) {
        next.updated_at = Utc::now().to_rfc3339();
        if let Err(e) = self.sink.publish(&next) {
            warn!("Failed to publish progress: {:#}", e);
        }
        self.current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn test_bucket_bands() {
        assert_eq!(Bucket::of(1, 4), Bucket::NotSuitable);
        assert_eq!(Bucket::of(2, 4), Bucket::NotSuitable);
        assert_eq!(Bucket::of(3, 4), Bucket::Suitable);
        assert_eq!(Bucket::of(4, 4), Bucket::HighlySuitable);
        assert_eq!(Bucket::of(5, 4), Bucket::HighlySuitable);
        assert_eq!(Bucket::of(3, 3), Bucket::HighlySuitable);
    }

    #[test]
    fn test_phase_serializes_with_display_names() {
        let snapshot = ProgressSnapshot {
            phase: Phase::DeepScan,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""phase":"Deep Scan""#));
        assert!(json.contains(r#""state":"running""#));
    }

    #[test]
    fn test_tracker_publishes_every_change() {
        let sink = RecordingSink::default();
        let published = sink.published();
        let mut tracker = ProgressTracker::new(Box::new(sink), "seek");

        tracker.begin_keyword("warehouse", 1, 2);
        tracker.update(|s| {
            s.processed_count = 20;
            s.add_to_bucket(Bucket::HighlySuitable);
        });
        tracker.set_state(RunState::Suspended);

        let published = published.borrow();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].keyword, "warehouse");
        assert_eq!(published[0].site, "seek");
        assert_eq!(published[1].processed_count, 20);
        assert_eq!(published[2].state, RunState::Suspended);
        assert_eq!(published[2].highly_suitable, 1);
        assert_eq!(tracker.current(), &published[2]);
    }

    #[test]
    fn test_begin_keyword_resets_counters() {
        let mut tracker = ProgressTracker::new(Box::new(RecordingSink::default()), "seek");
        tracker.begin_keyword("a", 1, 2);
        tracker.update(|s| s.processed_count = 7);
        tracker.begin_keyword("b", 2, 2);
        assert_eq!(tracker.current().processed_count, 0);
        assert_eq!(tracker.current().keyword_index, 2);
        assert_eq!(tracker.current().phase, Phase::SummaryScan);
    }

    #[test]
    fn test_file_sink_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrape_progress.json");
        assert!(read_snapshot(&path).is_none());

        let mut tracker = ProgressTracker::new(Box::new(JsonFileSink::new(&path)), "seek");
        tracker.begin_keyword("forklift", 3, 5);
        tracker.update(|s| s.total_listings = 88);

        let read = read_snapshot(&path).unwrap();
        assert_eq!(read.keyword, "forklift");
        assert_eq!(read.total_listings, 88);
        assert!(!dir.path().join("scrape_progress.json.tmp").exists());
    }

    #[test]
    fn test_partial_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrape_progress.json");
        std::fs::write(&path, r#"{"site":"seek","phase":"Summ"#).unwrap();
        assert!(read_snapshot(&path).is_none());
    }

    #[test]
    fn test_remove_from_bucket_saturates() {
        let mut s = ProgressSnapshot::default();
        s.remove_from_bucket(Bucket::Suitable);
        assert_eq!(s.suitable, 0);
    }
}
