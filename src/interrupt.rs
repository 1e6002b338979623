use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::ScrapeResult;
use crate::progress::{write_atomic, ProgressTracker, RunState};

const STOP_FILE: &str = "STOP";
const RESUME_FILE: &str = "RESUME";
const SUSPENDED_FILE: &str = "suspended.json";

/// The page that demanded human verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub url: String,
    pub detected_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Running,
    Suspended(Challenge),
}

impl PipelineState {
    fn run_state(&self) -> RunState {
        match self {
            PipelineState::Running => RunState::Running,
            PipelineState::Suspended(_) => RunState::Suspended,
        }
    }
}

/// How a suspension ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resumed,
    Stopped,
    TimedOut,
}

/// External signals that drive a run: stop, resume, and a place to announce
/// the current challenge.
pub trait Control {
    fn stop_requested(&mut self) -> bool;

    /// True once per resume signal.
    fn take_resume(&mut self) -> bool;

    /// `None` clears the announcement.
    fn mark_suspended(&mut self, challenge: Option<&Challenge>) -> Result<()>;

    /// Drops stale signals from a previous run.
    fn reset(&mut self) -> Result<()>;
}

/// Signals as files in a control directory, written by `jobscout stop` and
/// `jobscout resume` (or anything else that can touch a file).
pub struct FileControl {
    dir: PathBuf,
}

impl FileControl {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn request_stop(&self) -> Result<()> {
        self.touch(STOP_FILE)
    }

    pub fn request_resume(&self) -> Result<()> {
        self.touch(RESUME_FILE)
    }

    /// The challenge a running scrape is currently waiting on, if any.
    pub fn suspended(&self) -> Option<Challenge> {
        let raw = std::fs::read_to_string(self.dir.join(SUSPENDED_FILE)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn touch(&self, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        std::fs::write(self.dir.join(name), Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {} signal", name))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        remove_if_exists(&self.dir.join(name))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

impl Control for FileControl {
    fn stop_requested(&mut self) -> bool {
        self.dir.join(STOP_FILE).exists()
    }

    fn take_resume(&mut self) -> bool {
        let path = self.dir.join(RESUME_FILE);
        if !path.exists() {
            return false;
        }
        if let Err(e) = remove_if_exists(&path) {
            warn!("{:#}", e);
        }
        true
    }

    fn mark_suspended(&mut self, challenge: Option<&Challenge>) -> Result<()> {
        match challenge {
            Some(c) => write_atomic(&self.dir.join(SUSPENDED_FILE), &serde_json::to_vec_pretty(c)?),
            None => self.remove(SUSPENDED_FILE),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.remove(STOP_FILE)?;
        self.remove(RESUME_FILE)?;
        self.remove(SUSPENDED_FILE)
    }
}

pub struct InterruptHandler {
    control: Box<dyn Control>,
    state: PipelineState,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl InterruptHandler {
    pub fn new(control: Box<dyn Control>, poll_interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            control,
            state: PipelineState::Running,
            poll_interval,
            timeout,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn stop_requested(&mut self) -> bool {
        self.control.stop_requested()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.state = PipelineState::Running;
        self.control.reset()
    }

    /// Enters the suspended state for `url` and waits for an outside signal.
    ///
    /// The published progress keeps its counters and only flips to
    /// `suspended`; it flips back to `running` when the wait ends.
    pub fn suspend(&mut self, url: &str, tracker: &mut ProgressTracker) -> ScrapeResult<Resolution> {
        let challenge = Challenge {
            url: url.to_string(),
            detected_at: Utc::now().to_rfc3339(),
        };
        warn!(
            "Verification challenge at {}. Solve it in the browser, then run 'jobscout resume'",
            url
        );
        if let Err(e) = self.control.mark_suspended(Some(&challenge)) {
            warn!("Failed to record suspension: {:#}", e);
        }
        self.state = PipelineState::Suspended(challenge);
        tracker.set_state(self.state.run_state());

        let started = Instant::now();
        let resolution = loop {
            if self.control.stop_requested() {
                break Resolution::Stopped;
            }
            if self.control.take_resume() {
                break Resolution::Resumed;
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    break Resolution::TimedOut;
                }
            }
            std::thread::sleep(self.poll_interval);
        };

        info!("Suspension at {} ended: {:?}", url, resolution);
        if let Err(e) = self.control.mark_suspended(None) {
            warn!("Failed to clear suspension: {:#}", e);
        }
        self.state = PipelineState::Running;
        tracker.set_state(self.state.run_state());
        Ok(resolution)
    }
}
