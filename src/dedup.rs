use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

use crate::db::Database;

/// Known external listing ids for one site, loaded once per run.
#[derive(Debug, Default)]
pub struct DedupIndex {
    known: HashSet<String>,
}

impl DedupIndex {
    pub fn load(db: &Database, site_id: i64) -> Result<Self> {
        let known = db.known_listing_ids(site_id)?;
        debug!("Dedup index for site {}: {} known listings", site_id, known.len());
        Ok(Self::from_ids(known))
    }

    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.known.contains(external_id)
    }

    /// Call after a successful insert.
    pub fn record(&mut self, external_id: &str) {
        self.known.insert(external_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewListing;
    use crate::testing::seeded_db;

    #[test]
    fn test_load_reads_only_this_sites_ids() {
        let (db, site, kws) = seeded_db(&["warehouse"]);
        for id in ["100001", "100002"] {
            db.insert_listing(&NewListing {
                external_id: id.to_string(),
                site_id: site.id,
                keyword_id: kws[0],
                title: "Picker".to_string(),
                company: None,
                location: None,
                url: None,
                listing_date: None,
                suitability_score: 3,
            })
            .unwrap();
        }

        let index = DedupIndex::load(&db, site.id).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains("100001"));
        assert!(!index.contains("100003"));

        let other = DedupIndex::load(&db, site.id + 1).unwrap();
        assert_eq!(other.len(), 0);
    }

    #[test]
    fn test_record_adds_to_known_ids() {
        let mut index = DedupIndex::from_ids(vec!["a".to_string()]);
        assert!(!index.contains("b"));
        index.record("b");
        assert!(index.contains("b"));
        index.record("b");
        assert_eq!(index.len(), 2);
    }
}
