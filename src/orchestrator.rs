use anyhow::Result;
use tracing::{error, info, warn};

use crate::adapter::FieldTag;
use crate::db::Database;
use crate::dedup::DedupIndex;
use crate::deep_scan::{DeepScan, DeepScanStats};
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{KeywordTask, NewRunSummary, Site};
use crate::progress::{ProgressTracker, RunState};
use crate::scoring::RuleSet;
use crate::session::CrawlSession;
use crate::summary::{PassStats, SummaryPass};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub user_id: i64,
    pub deep_scan: bool,
    pub threshold: u8,
    pub deep_scan_limit: Option<usize>,
    pub max_pages: Option<u32>,
    pub keyword_limit: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            user_id: crate::db::DEFAULT_USER_ID,
            deep_scan: true,
            threshold: 4,
            deep_scan_limit: Some(50),
            max_pages: None,
            keyword_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeywordOutcome {
    Completed,
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct KeywordReport {
    pub keyword: String,
    pub outcome: KeywordOutcome,
    pub summary: PassStats,
    pub deep_scan: Option<DeepScanStats>,
    pub highly_suitable: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub site: String,
    pub keywords: Vec<KeywordReport>,
    pub stopped: bool,
    /// Why the run ended before its last keyword, if it did.
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn inserted(&self) -> u32 {
        self.keywords.iter().map(|k| k.summary.inserted).sum()
    }

    pub fn skipped(&self) -> u32 {
        self.keywords.iter().map(|k| k.summary.skipped_duplicates).sum()
    }

    pub fn failed(&self) -> usize {
        self.keywords
            .iter()
            .filter(|k| matches!(k.outcome, KeywordOutcome::Failed(_)))
            .count()
    }
}

/// Runs every enabled keyword of one site through the summary pass and the
/// deep scan, recording a run summary per keyword.
pub struct Orchestrator<'a> {
    db: &'a Database,
    tracker: ProgressTracker,
    options: RunOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(db: &'a Database, tracker: ProgressTracker, options: RunOptions) -> Self {
        Self { db, tracker, options }
    }

    /// `connect` opens the crawl session once the extraction tags the
    /// criteria need are known. Failures end up on the report, never as an
    /// error.
    pub fn run(
        &mut self,
        site: &Site,
        connect: impl FnOnce(&[FieldTag]) -> ScrapeResult<CrawlSession>,
    ) -> RunReport {
        let mut report = RunReport {
            site: site.name.clone(),
            ..Default::default()
        };

        let (tasks, rules, mut dedup) = match self.load(site) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Could not load run configuration: {:#}", e);
                report.aborted = Some(format!("{:#}", e));
                self.tracker.set_state(RunState::Finished);
                return report;
            }
        };
        info!(
            "Run on {}: {} keywords, {} criteria, {} known listings",
            site.name,
            tasks.len(),
            rules.len(),
            dedup.len()
        );
        if rules.is_empty() {
            warn!("No criteria for {}; every listing keeps the base score", site.name);
        }

        let mut session = match connect(&rules.field_tags()) {
            Ok(session) => session,
            Err(e) => {
                error!("Could not start crawl session: {}", e);
                report.aborted = Some(e.to_string());
                self.tracker.set_state(RunState::Finished);
                return report;
            }
        };
        info!("Crawl session open on {}", session.site_name());
        if let Err(e) = session.interrupt().reset() {
            warn!("Could not clear stale control signals: {:#}", e);
        }

        let total = tasks.len() as u32;
        for (i, task) in tasks.iter().enumerate() {
            if session.stop_requested() {
                info!("Stop requested, ending run before '{}'", task.keyword);
                report.stopped = true;
                break;
            }
            self.tracker.begin_keyword(&task.keyword, i as u32 + 1, total);

            match self.run_keyword(&mut session, site, task, &rules, &mut dedup) {
                Ok(keyword_report) => {
                    let stopped = keyword_report.outcome == KeywordOutcome::Stopped;
                    report.keywords.push(keyword_report);
                    if stopped {
                        report.stopped = true;
                        break;
                    }
                }
                Err(ScrapeError::Storage(e)) => {
                    error!("Storage failure on '{}', aborting run: {:#}", task.keyword, e);
                    report.keywords.push(failed(task, format!("{:#}", e)));
                    report.aborted = Some(format!("storage error: {:#}", e));
                    break;
                }
                Err(e) => {
                    warn!("Keyword '{}' failed: {}", task.keyword, e);
                    report.keywords.push(failed(task, e.to_string()));
                }
            }
        }

        self.tracker.set_state(RunState::Finished);
        info!(
            "Run finished: {} new, {} duplicates, {} keywords failed",
            report.inserted(),
            report.skipped(),
            report.failed()
        );
        report
    }

    fn load(&self, site: &Site) -> Result<(Vec<KeywordTask>, RuleSet, DedupIndex)> {
        let mut tasks = self.db.enabled_keywords(self.options.user_id, site.id)?;
        if let Some(limit) = self.options.keyword_limit {
            tasks.truncate(limit);
        }
        let rules = RuleSet::compile(self.db.load_rules(self.options.user_id, Some(site.id))?);
        let dedup = DedupIndex::load(self.db, site.id)?;
        Ok((tasks, rules, dedup))
    }

    fn run_keyword(
        &mut self,
        session: &mut CrawlSession,
        site: &Site,
        task: &KeywordTask,
        rules: &RuleSet,
        dedup: &mut DedupIndex,
    ) -> ScrapeResult<KeywordReport> {
        info!("Keyword '{}' ({})", task.keyword, task.role_name);
        let threshold = self.options.threshold;

        let summary = SummaryPass {
            db: self.db,
            rules,
            site_id: site.id,
            threshold,
            max_pages: self.options.max_pages,
        }
        .run(session, dedup, &mut self.tracker, task)?;
        let mut discovered = summary.discovered;

        let deep_scan = if self.options.deep_scan && !summary.stats.stopped {
            let stats = DeepScan {
                db: self.db,
                rules,
                threshold,
                limit: self.options.deep_scan_limit,
            }
            .run(session, &mut self.tracker, &mut discovered)?;
            Some(stats)
        } else {
            None
        };

        let stopped = summary.stats.stopped || deep_scan.as_ref().is_some_and(|d| d.stopped);
        let highly_suitable = discovered.iter().filter(|d| d.score >= threshold).count() as u32;

        self.db
            .insert_run_summary(&NewRunSummary {
                keyword_id: task.keyword_id,
                site_id: site.id,
                total_reported: summary.stats.total_reported,
                listings_found: summary.stats.inserted,
                skipped_duplicates: summary.stats.skipped_duplicates,
                highly_suitable,
            })
            .map_err(ScrapeError::Storage)?;
        if !stopped {
            self.db
                .touch_keyword_last_run(task.keyword_id)
                .map_err(ScrapeError::Storage)?;
        }

        info!(
            "'{}': {} new, {} duplicates, {} highly suitable",
            task.keyword, summary.stats.inserted, summary.stats.skipped_duplicates, highly_suitable
        );
        Ok(KeywordReport {
            keyword: task.keyword.clone(),
            outcome: if stopped {
                KeywordOutcome::Stopped
            } else {
                KeywordOutcome::Completed
            },
            summary: summary.stats,
            deep_scan,
            highly_suitable,
        })
    }
}

fn failed(task: &KeywordTask, reason: String) -> KeywordReport {
    KeywordReport {
        keyword: task.keyword.clone(),
        outcome: KeywordOutcome::Failed(reason),
        summary: PassStats::default(),
        deep_scan: None,
        highly_suitable: 0,
    }
}
