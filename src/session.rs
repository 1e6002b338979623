use rand::Rng;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::adapter::{SiteAdapter, SummaryPage};
use crate::error::{ScrapeError, ScrapeResult};
use crate::interrupt::{InterruptHandler, Resolution};
use crate::models::FieldMap;
use crate::progress::ProgressTracker;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries per fetch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubling from the base,
    /// capped, plus random jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        backoff + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(15_000),
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pacing {
    pub page_delay: Duration,
    pub detail_delay: Duration,
}

/// The one crawl session of a run. Owns the adapter (and with it the
/// browser), so every fetch is serialized through here.
pub struct CrawlSession {
    adapter: Box<dyn SiteAdapter>,
    interrupt: InterruptHandler,
    retry: RetryPolicy,
    pacing: Pacing,
    last_fetch: Option<Instant>,
}

impl CrawlSession {
    pub fn new(
        adapter: Box<dyn SiteAdapter>,
        interrupt: InterruptHandler,
        retry: RetryPolicy,
        pacing: Pacing,
    ) -> Self {
        Self {
            adapter,
            interrupt,
            retry,
            pacing,
            last_fetch: None,
        }
    }

    pub fn site_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn interrupt(&mut self) -> &mut InterruptHandler {
        &mut self.interrupt
    }

    pub fn stop_requested(&mut self) -> bool {
        self.interrupt.stop_requested()
    }

    pub fn summary_page(
        &mut self,
        keyword: &str,
        page_index: u32,
        tracker: &mut ProgressTracker,
    ) -> ScrapeResult<SummaryPage> {
        let delay = self.pacing.page_delay;
        self.guarded(delay, tracker, |adapter| adapter.fetch_summary_page(keyword, page_index))
    }

    pub fn detail(&mut self, url: &str, tracker: &mut ProgressTracker) -> ScrapeResult<FieldMap> {
        let delay = self.pacing.detail_delay;
        self.guarded(delay, tracker, |adapter| adapter.fetch_detail(url))
    }

    fn pace(&mut self, delay: Duration) {
        if let Some(last) = self.last_fetch {
            let elapsed = last.elapsed();
            if elapsed < delay {
                std::thread::sleep(delay - elapsed);
            }
        }
        self.last_fetch = Some(Instant::now());
    }

    /// Runs one fetch with retry for transient failures and suspension on
    /// challenges. After a resume the same fetch is issued again.
    fn guarded<T>(
        &mut self,
        delay: Duration,
        tracker: &mut ProgressTracker,
        mut fetch: impl FnMut(&mut dyn SiteAdapter) -> ScrapeResult<T>,
    ) -> ScrapeResult<T> {
        let mut attempt = 1;
        loop {
            if self.interrupt.stop_requested() {
                return Err(ScrapeError::Cancelled);
            }
            self.pace(delay);
            match fetch(&mut *self.adapter) {
                Ok(value) => return Ok(value),
                Err(ScrapeError::VerificationChallenge { url }) => {
                    match self.interrupt.suspend(&url, tracker)? {
                        Resolution::Resumed => attempt = 1,
                        Resolution::Stopped => return Err(ScrapeError::Cancelled),
                        Resolution::TimedOut => {
                            return Err(ScrapeError::VerificationChallenge { url });
                        }
                    }
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let wait = self.retry.delay_for(attempt);
                    warn!(
                        "{} (attempt {}/{}), retrying in {:?}",
                        e, attempt, self.retry.max_attempts, wait
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
