use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::enrich;
use crate::error::{ScrapeError, ScrapeResult};
use crate::progress::{Bucket, Phase, ProgressTracker};
use crate::scoring::{RuleScope, RuleSet};
use crate::session::CrawlSession;
use crate::summary::Discovered;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeepScanStats {
    pub targets: u32,
    pub enriched: u32,
    pub failed: u32,
    pub stopped: bool,
}

/// Indices of the listings worth a detail fetch: summary score at or above
/// the threshold, with a URL, in discovery order, at most `limit` of them.
pub fn select_targets(discovered: &[Discovered], threshold: u8, limit: Option<usize>) -> Vec<usize> {
    discovered
        .iter()
        .enumerate()
        .filter(|(_, d)| d.score >= threshold && d.url.is_some())
        .map(|(i, _)| i)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

pub struct DeepScan<'a> {
    pub db: &'a Database,
    pub rules: &'a RuleSet,
    pub threshold: u8,
    pub limit: Option<usize>,
}

impl DeepScan<'_> {
    /// Fetches detail pages for the high scorers among `discovered`, stores
    /// the enriched fields and the full-rule score, and updates each entry's
    /// score in place. A failed detail fetch costs only that listing.
    pub fn run(
        &self,
        session: &mut CrawlSession,
        tracker: &mut ProgressTracker,
        discovered: &mut [Discovered],
    ) -> ScrapeResult<DeepScanStats> {
        let targets = select_targets(discovered, self.threshold, self.limit);
        let mut stats = DeepScanStats {
            targets: targets.len() as u32,
            ..Default::default()
        };
        let total = stats.targets;
        tracker.update(|s| {
            s.phase = Phase::DeepScan;
            s.total_deep = total;
            s.deep_scanned = 0;
        });
        if targets.is_empty() {
            return Ok(stats);
        }
        info!("Deep scanning {} listings", targets.len());

        for index in targets {
            let target = &mut discovered[index];
            let Some(url) = target.url.clone() else {
                continue;
            };

            let detail = match session.detail(&url, tracker) {
                Ok(detail) => detail,
                Err(ScrapeError::Cancelled) => {
                    info!("Stop requested during deep scan");
                    stats.stopped = true;
                    break;
                }
                Err(e) => {
                    warn!("Deep scan of {} failed: {}", target.external_id, e);
                    stats.failed += 1;
                    tracker.update(|s| s.deep_scanned += 1);
                    continue;
                }
            };

            let listing = self
                .db
                .get_listing(target.row_id)
                .map_err(ScrapeError::Storage)?
                .ok_or_else(|| {
                    ScrapeError::Storage(anyhow!("listing row {} disappeared", target.row_id))
                })?;

            let mut fields = listing.field_map();
            fields.extend(target.card.clone());
            fields.extend(detail);
            let enrichment = enrich::derive(&listing.title, &fields);
            enrichment.extend_fields(&mut fields);

            let scored = self.rules.score(&fields, RuleScope::Full);
            debug!(
                "{} rescored {} -> {} {:?}",
                target.external_id, target.score, scored.score, scored.reasons
            );
            self.db
                .update_listing_enrichment(target.row_id, &enrichment, scored.score)
                .map_err(ScrapeError::Storage)?;

            let before = Bucket::of(target.score, self.threshold);
            let after = Bucket::of(scored.score, self.threshold);
            target.score = scored.score;
            stats.enriched += 1;
            tracker.update(|s| {
                s.deep_scanned += 1;
                if before != after {
                    s.remove_from_bucket(before);
                    s.add_to_bucket(after);
                }
            });
        }

        Ok(stats)
    }
}
