use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::dedup::DedupIndex;
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{FieldMap, KeywordTask, NewListing};
use crate::progress::{Bucket, Phase, ProgressTracker};
use crate::scoring::{RuleScope, RuleSet};
use crate::session::CrawlSession;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStats {
    pub pages: u32,
    pub total_reported: u32,
    pub inserted: u32,
    pub skipped_duplicates: u32,
    pub parse_failures: u32,
    pub not_suitable: u32,
    pub suitable: u32,
    pub highly_suitable: u32,
    /// A stop request ended the pass.
    pub stopped: bool,
    /// A later page could not be fetched; earlier pages are kept.
    pub ended_early: bool,
}

impl PassStats {
    fn count(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::NotSuitable => self.not_suitable += 1,
            Bucket::Suitable => self.suitable += 1,
            Bucket::HighlySuitable => self.highly_suitable += 1,
        }
    }

    pub fn processed(&self) -> u32 {
        self.inserted + self.skipped_duplicates
    }
}

/// A listing inserted by this pass, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    pub row_id: i64,
    pub external_id: String,
    pub url: Option<String>,
    pub score: u8,
    /// Everything the card yielded, including criterion-tag fields that
    /// have no column of their own.
    pub card: FieldMap,
}

#[derive(Debug, Default)]
pub struct SummaryOutcome {
    pub stats: PassStats,
    pub discovered: Vec<Discovered>,
}

/// Walks the search result pages of one keyword, inserting unseen listings
/// with their card-view score.
pub struct SummaryPass<'a> {
    pub db: &'a Database,
    pub rules: &'a RuleSet,
    pub site_id: i64,
    pub threshold: u8,
    pub max_pages: Option<u32>,
}

impl SummaryPass<'_> {
    pub fn run(
        &self,
        session: &mut CrawlSession,
        dedup: &mut DedupIndex,
        tracker: &mut ProgressTracker,
        task: &KeywordTask,
    ) -> ScrapeResult<SummaryOutcome> {
        let mut outcome = SummaryOutcome::default();
        let mut seen_this_pass = HashSet::new();
        let mut page_index = 1;

        loop {
            if self.max_pages.is_some_and(|max| page_index > max) {
                debug!("'{}': page limit reached", task.keyword);
                break;
            }

            let page = match session.summary_page(&task.keyword, page_index, tracker) {
                Ok(page) => page,
                Err(ScrapeError::Cancelled) => {
                    info!("'{}': stop requested before page {}", task.keyword, page_index);
                    outcome.stats.stopped = true;
                    break;
                }
                Err(e) if page_index > 1 => {
                    warn!("'{}': giving up at page {}: {}", task.keyword, page_index, e);
                    outcome.stats.ended_early = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            let stats = &mut outcome.stats;
            stats.pages += 1;
            if let Some(total) = page.total_count {
                stats.total_reported = stats.total_reported.max(total);
            }
            if page.cards.is_empty() {
                debug!("'{}': page {} has no cards", task.keyword, page_index);
                publish_counts(tracker, stats);
                break;
            }

            let mut unseen = 0;
            for card in page.cards {
                let fields = match card {
                    Ok(fields) => fields,
                    Err(e) => {
                        warn!("'{}' page {}: skipping card: {}", task.keyword, page_index, e);
                        outcome.stats.parse_failures += 1;
                        continue;
                    }
                };
                let Some(external_id) = fields.get("listing_id").cloned() else {
                    warn!("'{}' page {}: card without listing id", task.keyword, page_index);
                    outcome.stats.parse_failures += 1;
                    continue;
                };
                if !seen_this_pass.insert(external_id.clone()) {
                    continue;
                }
                unseen += 1;

                if dedup.contains(&external_id) {
                    outcome.stats.skipped_duplicates += 1;
                    debug!("{} already captured, skipping", external_id);
                    continue;
                }

                if let Some(found) = self.insert_card(task, &external_id, &fields, dedup, &mut outcome.stats)? {
                    outcome.discovered.push(found);
                }
            }

            let stats = &outcome.stats;
            publish_counts(tracker, stats);
            info!(
                "'{}' page {}: {} new, {} duplicates so far ({} reported)",
                task.keyword, page_index, stats.inserted, stats.skipped_duplicates, stats.total_reported
            );

            if unseen == 0 {
                debug!("'{}': page {} repeated earlier cards", task.keyword, page_index);
                break;
            }
            if !page.has_next {
                break;
            }
            page_index += 1;
        }

        Ok(outcome)
    }

    fn insert_card(
        &self,
        task: &KeywordTask,
        external_id: &str,
        fields: &FieldMap,
        dedup: &mut DedupIndex,
        stats: &mut PassStats,
    ) -> ScrapeResult<Option<Discovered>> {
        let Some(title) = fields.get("title").cloned() else {
            warn!("Card {} has no title, skipping", external_id);
            stats.parse_failures += 1;
            return Ok(None);
        };

        let scored = self.rules.score(fields, RuleScope::CardView);
        debug!("{} '{}' scored {} {:?}", external_id, title, scored.score, scored.reasons);

        let listing = NewListing {
            external_id: external_id.to_string(),
            site_id: self.site_id,
            keyword_id: task.keyword_id,
            title,
            company: fields.get("company").cloned(),
            location: fields.get("location").cloned(),
            url: fields.get("url").cloned(),
            listing_date: fields.get("listing_date").cloned(),
            suitability_score: scored.score,
        };
        let inserted = self.db.insert_listing(&listing).map_err(ScrapeError::Storage)?;
        dedup.record(external_id);

        match inserted {
            Some(row_id) => {
                stats.inserted += 1;
                stats.count(Bucket::of(scored.score, self.threshold));
                Ok(Some(Discovered {
                    row_id,
                    external_id: listing.external_id,
                    url: listing.url,
                    score: scored.score,
                    card: fields.clone(),
                }))
            }
            None => {
                stats.skipped_duplicates += 1;
                Ok(None)
            }
        }
    }
}

fn publish_counts(tracker: &mut ProgressTracker, stats: &PassStats) {
    tracker.update(|s| {
        s.phase = Phase::SummaryScan;
        s.total_listings = stats.total_reported;
        s.processed_count = stats.processed();
        s.skipped_existing = stats.skipped_duplicates;
        s.not_suitable = stats.not_suitable;
        s.suitable = stats.suitable;
        s.highly_suitable = stats.highly_suitable;
    });
}
