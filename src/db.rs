use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::adapter::SiteConfig;
use crate::models::{
    Criterion, CriterionItem, Keyword, KeywordTask, Listing, ListingEnrichment, ListingStatus,
    NewCriterion, NewListing, NewRunSummary, Role, RunSummary, Site,
};

pub const DEFAULT_USER_ID: i64 = 1;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// Filters for `jobscout list`.
#[derive(Debug, Default, Clone)]
pub struct ListingFilter {
    pub status: Option<ListingStatus>,
    pub keyword: Option<String>,
    pub min_score: Option<u8>,
    pub limit: Option<usize>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    #[cfg(test)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS Users (
                user_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS Sites (
                site_id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_name TEXT NOT NULL UNIQUE,
                url_prefix TEXT NOT NULL,
                url_suffix TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                config_json TEXT
            );

            CREATE TABLE IF NOT EXISTS Roles (
                role_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES Users(user_id) ON DELETE CASCADE,
                site_id INTEGER NOT NULL REFERENCES Sites(site_id) ON DELETE CASCADE,
                role_name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                rank INTEGER NOT NULL DEFAULT 0,
                UNIQUE (user_id, site_id, role_name)
            );

            CREATE TABLE IF NOT EXISTS Keywords (
                keyword_id INTEGER PRIMARY KEY AUTOINCREMENT,
                role_id INTEGER NOT NULL REFERENCES Roles(role_id) ON DELETE CASCADE,
                keyword TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run TEXT,
                UNIQUE (role_id, keyword)
            );

            CREATE TABLE IF NOT EXISTS Criteria (
                criteria_id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES Users(user_id) ON DELETE CASCADE,
                site_id INTEGER REFERENCES Sites(site_id) ON DELETE CASCADE,
                criteria_field_name TEXT NOT NULL,
                tag TEXT,
                method TEXT NOT NULL DEFAULT 'contains',
                use_on_card_view INTEGER NOT NULL DEFAULT 1,
                maximum_score INTEGER NOT NULL DEFAULT 5 CHECK (maximum_score BETWEEN 1 AND 5),
                increase_score INTEGER NOT NULL DEFAULT 1 CHECK (increase_score BETWEEN 0 AND 4),
                decrease_score INTEGER NOT NULL DEFAULT 1 CHECK (decrease_score BETWEEN 0 AND 4)
            );

            CREATE TABLE IF NOT EXISTS CriteriaListItems (
                item_id INTEGER PRIMARY KEY AUTOINCREMENT,
                criteria_id INTEGER NOT NULL REFERENCES Criteria(criteria_id) ON DELETE CASCADE,
                list_item TEXT NOT NULL,
                impact_on_score TEXT NOT NULL CHECK (impact_on_score IN ('minimum', 'decrease', 'increase', 'maximum'))
            );

            CREATE TABLE IF NOT EXISTS Job_Listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id TEXT NOT NULL,
                site_id INTEGER NOT NULL REFERENCES Sites(site_id) ON DELETE CASCADE,
                keyword_id INTEGER NOT NULL REFERENCES Keywords(keyword_id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                url TEXT,
                description TEXT,
                pay_rate TEXT,
                listing_date TEXT,
                closing_date TEXT,
                schedule TEXT,
                experience_level TEXT,
                requires_license INTEGER,
                no_experience INTEGER,
                suitability_score INTEGER NOT NULL DEFAULT 3 CHECK (suitability_score BETWEEN 1 AND 5),
                status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'applied', 'pending', 'ignored')),
                captured_at TEXT NOT NULL DEFAULT (datetime('now')),
                deep_scanned_at TEXT,
                UNIQUE (site_id, listing_id)
            );

            CREATE TABLE IF NOT EXISTS Search_Run_Summary (
                summary_id INTEGER PRIMARY KEY AUTOINCREMENT,
                keyword_id INTEGER NOT NULL REFERENCES Keywords(keyword_id) ON DELETE CASCADE,
                site_id INTEGER NOT NULL REFERENCES Sites(site_id) ON DELETE CASCADE,
                run_at TEXT NOT NULL DEFAULT (datetime('now')),
                total_reported INTEGER NOT NULL DEFAULT 0,
                listings_found INTEGER NOT NULL DEFAULT 0,
                skipped_duplicates INTEGER NOT NULL DEFAULT 0,
                highly_suitable INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS Applications (
                application_id INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_row_id INTEGER NOT NULL REFERENCES Job_Listings(id) ON DELETE CASCADE,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                notes TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_roles_user_site ON Roles(user_id, site_id);
            CREATE INDEX IF NOT EXISTS idx_keywords_role ON Keywords(role_id);
            CREATE INDEX IF NOT EXISTS idx_criteria_user ON Criteria(user_id);
            CREATE INDEX IF NOT EXISTS idx_items_criteria ON CriteriaListItems(criteria_id);
            CREATE INDEX IF NOT EXISTS idx_listings_keyword ON Job_Listings(keyword_id);
            CREATE INDEX IF NOT EXISTS idx_listings_status ON Job_Listings(status);
            CREATE INDEX IF NOT EXISTS idx_summary_keyword ON Search_Run_Summary(keyword_id);

            INSERT OR IGNORE INTO Users (user_id, name) VALUES (1, 'default');
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='Job_Listings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobscout init' first."
            ));
        }
        Ok(())
    }

    // --- Site operations ---

    pub fn add_site(
        &self,
        name: &str,
        url_prefix: &str,
        url_suffix: &str,
        config: &SiteConfig,
    ) -> Result<i64> {
        let config_json = serde_json::to_string(config)?;
        self.conn
            .execute(
                "INSERT INTO Sites (site_name, url_prefix, url_suffix, config_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, url_prefix, url_suffix, config_json],
            )
            .with_context(|| format!("Failed to add site '{}'", name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_sites(&self) -> Result<Vec<Site>> {
        let mut stmt = self.conn.prepare(
            "SELECT site_id, site_name, url_prefix, url_suffix, enabled, config_json
             FROM Sites ORDER BY site_id",
        )?;
        let rows = stmt.query_map([], Self::row_to_site)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list sites")
    }

    /// Site by name, or the first enabled site when no name is given.
    pub fn find_site(&self, name: Option<&str>) -> Result<Option<Site>> {
        let result = match name {
            Some(n) => self.conn.query_row(
                "SELECT site_id, site_name, url_prefix, url_suffix, enabled, config_json
                 FROM Sites WHERE LOWER(site_name) = LOWER(?1)",
                [n],
                Self::row_to_site,
            ),
            None => self.conn.query_row(
                "SELECT site_id, site_name, url_prefix, url_suffix, enabled, config_json
                 FROM Sites WHERE enabled = 1 ORDER BY site_id LIMIT 1",
                [],
                Self::row_to_site,
            ),
        };
        match result {
            Ok(site) => Ok(Some(site)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_site(row: &rusqlite::Row) -> rusqlite::Result<Site> {
        let config_json: Option<String> = row.get(5)?;
        let config = match config_json {
            Some(json) => conversion(5, serde_json::from_str::<SiteConfig>(&json))?,
            None => SiteConfig::default(),
        };
        Ok(Site {
            id: row.get(0)?,
            name: row.get(1)?,
            url_prefix: row.get(2)?,
            url_suffix: row.get(3)?,
            enabled: row.get(4)?,
            config,
        })
    }

    // --- Role and keyword operations ---

    pub fn add_role(&self, user_id: i64, site_id: i64, name: &str, rank: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO Roles (user_id, site_id, role_name, rank) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, site_id, name, rank],
            )
            .with_context(|| format!("Failed to add role '{}'", name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_roles(&self, user_id: i64) -> Result<Vec<Role>> {
        let mut stmt = self.conn.prepare(
            "SELECT role_id, user_id, site_id, role_name, enabled, rank
             FROM Roles WHERE user_id = ?1 ORDER BY rank, role_name",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(Role {
                id: row.get(0)?,
                user_id: row.get(1)?,
                site_id: row.get(2)?,
                name: row.get(3)?,
                enabled: row.get(4)?,
                rank: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list roles")
    }

    /// Returns false when no role has that id.
    pub fn set_role_enabled(&self, role_id: i64, enabled: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE Roles SET enabled = ?1 WHERE role_id = ?2",
            params![enabled, role_id],
        )?;
        Ok(changed > 0)
    }

    pub fn add_keyword(&self, role_id: i64, keyword: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO Keywords (role_id, keyword) VALUES (?1, ?2)",
                params![role_id, keyword],
            )
            .with_context(|| format!("Failed to add keyword '{}'", keyword))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_keywords(&self, role_id: i64) -> Result<Vec<Keyword>> {
        let mut stmt = self.conn.prepare(
            "SELECT keyword_id, role_id, keyword, enabled, last_run
             FROM Keywords WHERE role_id = ?1 ORDER BY keyword",
        )?;
        let rows = stmt.query_map([role_id], |row| {
            Ok(Keyword {
                id: row.get(0)?,
                role_id: row.get(1)?,
                keyword: row.get(2)?,
                enabled: row.get(3)?,
                last_run: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list keywords")
    }

    pub fn set_keyword_enabled(&self, keyword_id: i64, enabled: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE Keywords SET enabled = ?1 WHERE keyword_id = ?2",
            params![enabled, keyword_id],
        )?;
        Ok(changed > 0)
    }

    /// Enabled keywords under enabled roles for one user and site, ordered by keyword text.
    pub fn enabled_keywords(&self, user_id: i64, site_id: i64) -> Result<Vec<KeywordTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT k.keyword_id, k.keyword, r.role_id, r.role_name
             FROM Keywords k
             JOIN Roles r ON k.role_id = r.role_id
             WHERE r.user_id = ?1 AND r.site_id = ?2 AND r.enabled = 1 AND k.enabled = 1
             ORDER BY k.keyword COLLATE NOCASE, k.keyword_id",
        )?;
        let rows = stmt.query_map([user_id, site_id], |row| {
            Ok(KeywordTask {
                keyword_id: row.get(0)?,
                keyword: row.get(1)?,
                role_id: row.get(2)?,
                role_name: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to load enabled keywords")
    }

    pub fn touch_keyword_last_run(&self, keyword_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE Keywords SET last_run = datetime('now') WHERE keyword_id = ?1",
            [keyword_id],
        )?;
        Ok(())
    }

    // --- Criteria operations ---

    pub fn add_criterion(&self, c: &NewCriterion) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO Criteria (user_id, site_id, criteria_field_name, tag, method,
                    use_on_card_view, maximum_score, increase_score, decrease_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    c.user_id,
                    c.site_id,
                    c.field_name,
                    c.tag,
                    c.method.as_str(),
                    c.card_view,
                    c.maximum_score,
                    c.increase_score,
                    c.decrease_score
                ],
            )
            .with_context(|| format!("Failed to add criterion '{}'", c.field_name))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_criterion_item(
        &self,
        criterion_id: i64,
        term: &str,
        impact: crate::models::Impact,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO CriteriaListItems (criteria_id, list_item, impact_on_score)
                 VALUES (?1, ?2, ?3)",
                params![criterion_id, term, impact.as_str()],
            )
            .with_context(|| format!("Failed to add item '{}' to criterion {}", term, criterion_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Criteria that apply to a site (site-scoped or global) with their items,
    /// in insertion order.
    pub fn load_rules(
        &self,
        user_id: i64,
        site_id: Option<i64>,
    ) -> Result<Vec<(Criterion, Vec<CriterionItem>)>> {
        let criteria = {
            let mut stmt = self.conn.prepare(
                "SELECT criteria_id, user_id, site_id, criteria_field_name, tag, method,
                        use_on_card_view, maximum_score, increase_score, decrease_score
                 FROM Criteria
                 WHERE user_id = ?1 AND (?2 IS NULL OR site_id IS NULL OR site_id = ?2)
                 ORDER BY criteria_id",
            )?;
            let rows = stmt.query_map(params![user_id, site_id], Self::row_to_criterion)?;
            rows.collect::<Result<Vec<_>, _>>()
                .context("Failed to load criteria")?
        };

        let mut stmt = self.conn.prepare(
            "SELECT item_id, criteria_id, list_item, impact_on_score
             FROM CriteriaListItems WHERE criteria_id = ?1 ORDER BY item_id",
        )?;
        let mut rules = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            let items = stmt
                .query_map([criterion.id], |row| {
                    let impact: String = row.get(3)?;
                    Ok(CriterionItem {
                        id: row.get(0)?,
                        criterion_id: row.get(1)?,
                        term: row.get(2)?,
                        impact: conversion(3, impact.parse())?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Failed to load items for criterion {}", criterion.id))?;
            rules.push((criterion, items));
        }
        Ok(rules)
    }

    fn row_to_criterion(row: &rusqlite::Row) -> rusqlite::Result<Criterion> {
        let method: String = row.get(5)?;
        Ok(Criterion {
            id: row.get(0)?,
            user_id: row.get(1)?,
            site_id: row.get(2)?,
            field_name: row.get(3)?,
            tag: row.get(4)?,
            method: conversion(5, method.parse())?,
            card_view: row.get(6)?,
            maximum_score: row.get(7)?,
            increase_score: row.get(8)?,
            decrease_score: row.get(9)?,
        })
    }

    // --- Listing operations ---

    pub fn known_listing_ids(&self, site_id: i64) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT listing_id FROM Job_Listings WHERE site_id = ?1")?;
        let rows = stmt.query_map([site_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>()
            .context("Failed to load known listing ids")
    }

    /// Inserts a new listing. Returns `None` if (site, listing_id) already exists.
    pub fn insert_listing(&self, listing: &NewListing) -> Result<Option<i64>> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO Job_Listings
                    (listing_id, site_id, keyword_id, title, company, location, url,
                     listing_date, suitability_score, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new')",
                params![
                    listing.external_id,
                    listing.site_id,
                    listing.keyword_id,
                    listing.title,
                    listing.company,
                    listing.location,
                    listing.url,
                    listing.listing_date,
                    listing.suitability_score
                ],
            )
            .with_context(|| format!("Failed to insert listing {}", listing.external_id))?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn get_listing(&self, id: i64) -> Result<Option<Listing>> {
        let sql = format!("SELECT {} FROM Job_Listings WHERE id = ?1", LISTING_COLUMNS);
        let result = self.conn.query_row(&sql, [id], Self::row_to_listing);
        match result {
            Ok(listing) => Ok(Some(listing)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_listing_enrichment(
        &self,
        id: i64,
        enrichment: &ListingEnrichment,
        score: u8,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE Job_Listings SET
                    description = ?1, pay_rate = ?2, closing_date = ?3, schedule = ?4,
                    experience_level = ?5, requires_license = ?6, no_experience = ?7,
                    suitability_score = ?8, deep_scanned_at = datetime('now')
                 WHERE id = ?9",
                params![
                    enrichment.description,
                    enrichment.pay_rate,
                    enrichment.closing_date,
                    enrichment.schedule,
                    enrichment.experience_level,
                    enrichment.requires_license,
                    enrichment.no_experience,
                    score,
                    id
                ],
            )
            .with_context(|| format!("Failed to update listing {}", id))?;
        if changed == 0 {
            return Err(anyhow!("Listing {} not found", id));
        }
        Ok(())
    }

    pub fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>> {
        let mut sql = format!(
            "SELECT {} FROM Job_Listings j JOIN Keywords k ON j.keyword_id = k.keyword_id WHERE 1=1",
            LISTING_COLUMNS_QUALIFIED
        );
        let mut values: Vec<rusqlite::types::Value> = vec![];

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string().into());
            sql.push_str(&format!(" AND j.status = ?{}", values.len()));
        }
        if let Some(keyword) = &filter.keyword {
            values.push(keyword.clone().into());
            sql.push_str(&format!(" AND LOWER(k.keyword) = LOWER(?{})", values.len()));
        }
        if let Some(min) = filter.min_score {
            values.push(i64::from(min).into());
            sql.push_str(&format!(" AND j.suitability_score >= ?{}", values.len()));
        }
        sql.push_str(" ORDER BY j.suitability_score DESC, j.captured_at DESC, j.id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), Self::row_to_listing)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list listings")
    }

    /// Sets a listing's status; marking it applied also records an application.
    /// Returns false when no listing has that id.
    pub fn set_listing_status(
        &self,
        id: i64,
        status: ListingStatus,
        notes: Option<&str>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE Job_Listings SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if status == ListingStatus::Applied {
            self.conn.execute(
                "INSERT INTO Applications (listing_row_id, notes) VALUES (?1, ?2)",
                params![id, notes],
            )?;
        }
        Ok(true)
    }

    pub fn count_applications(&self, listing_row_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM Applications WHERE listing_row_id = ?1",
            [listing_row_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_listing(row: &rusqlite::Row) -> rusqlite::Result<Listing> {
        let status: String = row.get(17)?;
        Ok(Listing {
            id: row.get(0)?,
            listing_id: row.get(1)?,
            site_id: row.get(2)?,
            keyword_id: row.get(3)?,
            title: row.get(4)?,
            company: row.get(5)?,
            location: row.get(6)?,
            url: row.get(7)?,
            description: row.get(8)?,
            pay_rate: row.get(9)?,
            listing_date: row.get(10)?,
            closing_date: row.get(11)?,
            schedule: row.get(12)?,
            experience_level: row.get(13)?,
            requires_license: row.get(14)?,
            no_experience: row.get(15)?,
            suitability_score: row.get(16)?,
            status: conversion(17, status.parse())?,
            captured_at: row.get(18)?,
            deep_scanned_at: row.get(19)?,
        })
    }

    // --- Run summaries ---

    pub fn insert_run_summary(&self, summary: &NewRunSummary) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO Search_Run_Summary
                    (keyword_id, site_id, total_reported, listings_found, skipped_duplicates, highly_suitable)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    summary.keyword_id,
                    summary.site_id,
                    summary.total_reported,
                    summary.listings_found,
                    summary.skipped_duplicates,
                    summary.highly_suitable
                ],
            )
            .context("Failed to record run summary")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.summary_id, s.keyword_id, k.keyword, s.site_id, s.run_at, s.total_reported,
                    s.listings_found, s.skipped_duplicates, s.highly_suitable
             FROM Search_Run_Summary s
             LEFT JOIN Keywords k ON s.keyword_id = k.keyword_id
             ORDER BY s.run_at DESC, s.summary_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RunSummary {
                id: row.get(0)?,
                keyword_id: row.get(1)?,
                keyword: row.get(2)?,
                site_id: row.get(3)?,
                run_at: row.get(4)?,
                total_reported: row.get(5)?,
                listings_found: row.get(6)?,
                skipped_duplicates: row.get(7)?,
                highly_suitable: row.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list run summaries")
    }
}

const LISTING_COLUMNS: &str = "id, listing_id, site_id, keyword_id, title, company, location, url,
    description, pay_rate, listing_date, closing_date, schedule, experience_level,
    requires_license, no_experience, suitability_score, status, captured_at, deep_scanned_at";

const LISTING_COLUMNS_QUALIFIED: &str = "j.id, j.listing_id, j.site_id, j.keyword_id, j.title,
    j.company, j.location, j.url, j.description, j.pay_rate, j.listing_date, j.closing_date,
    j.schedule, j.experience_level, j.requires_license, j.no_experience, j.suitability_score,
    j.status, j.captured_at, j.deep_scanned_at";

fn conversion<T, E>(idx: usize, result: std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    result.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Impact, MatchMethod};

    fn seeded() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let site = db
            .add_site("seek", "https://www.example.com/", "-jobs", &SiteConfig::default())
            .unwrap();
        let role = db.add_role(DEFAULT_USER_ID, site, "Warehouse", 1).unwrap();
        let kw = db.add_keyword(role, "warehouse").unwrap();
        (db, site, kw)
    }

    fn new_listing(site_id: i64, keyword_id: i64, id: &str, score: u8) -> NewListing {
        NewListing {
            external_id: id.to_string(),
            site_id,
            keyword_id,
            title: format!("Job {}", id),
            company: Some("Acme".to_string()),
            location: None,
            url: Some(format!("https://www.example.com/job/{}", id)),
            listing_date: None,
            suitability_score: score,
        }
    }

    #[test]
    fn test_init_is_idempotent_and_creates_default_user() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
        let users: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM Users WHERE user_id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(users, 1);
    }

    #[test]
    fn test_ensure_initialized_fails_on_empty_db() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_initialized().is_err());
    }

    #[test]
    fn test_insert_listing_ignores_duplicates() {
        let (db, site, kw) = seeded();
        let first = db.insert_listing(&new_listing(site, kw, "81000001", 3)).unwrap();
        assert!(first.is_some());
        let again = db.insert_listing(&new_listing(site, kw, "81000001", 5)).unwrap();
        assert!(again.is_none());

        let stored = db.get_listing(first.unwrap()).unwrap().unwrap();
        assert_eq!(stored.suitability_score, 3);
        assert_eq!(stored.status, ListingStatus::New);
        assert_eq!(db.known_listing_ids(site).unwrap().len(), 1);
    }

    #[test]
    fn test_enrichment_updates_fields_and_score() {
        let (db, site, kw) = seeded();
        let id = db
            .insert_listing(&new_listing(site, kw, "81000002", 3))
            .unwrap()
            .unwrap();
        let enrichment = ListingEnrichment {
            description: "Pick and pack".to_string(),
            pay_rate: Some("$30 per hour".to_string()),
            requires_license: true,
            ..Default::default()
        };
        db.update_listing_enrichment(id, &enrichment, 5).unwrap();

        let stored = db.get_listing(id).unwrap().unwrap();
        assert_eq!(stored.suitability_score, 5);
        assert_eq!(stored.description.as_deref(), Some("Pick and pack"));
        assert_eq!(stored.pay_rate.as_deref(), Some("$30 per hour"));
        assert_eq!(stored.requires_license, Some(true));
        assert_eq!(stored.no_experience, Some(false));
        assert!(stored.deep_scanned_at.is_some());

        assert!(db.update_listing_enrichment(9999, &enrichment, 3).is_err());
    }

    #[test]
    fn test_enabled_keywords_skip_disabled_roles_and_keywords() {
        let (db, site, _) = seeded();
        let role = db.add_role(DEFAULT_USER_ID, site, "Driving", 2).unwrap();
        let truck = db.add_keyword(role, "truck driver").unwrap();
        db.add_keyword(role, "courier").unwrap();
        let off_role = db.add_role(DEFAULT_USER_ID, site, "Office", 3).unwrap();
        db.add_keyword(off_role, "admin").unwrap();
        db.set_role_enabled(off_role, false).unwrap();
        db.set_keyword_enabled(truck, false).unwrap();

        let tasks = db.enabled_keywords(DEFAULT_USER_ID, site).unwrap();
        let words: Vec<&str> = tasks.iter().map(|t| t.keyword.as_str()).collect();
        assert_eq!(words, vec!["courier", "warehouse"]);
    }

    #[test]
    fn test_load_rules_includes_global_criteria_in_order() {
        let (db, site, _) = seeded();
        let other = db
            .add_site("other", "https://other.example/", "", &SiteConfig::default())
            .unwrap();
        let mk = |site_id: Option<i64>, field: &str| NewCriterion {
            user_id: DEFAULT_USER_ID,
            site_id,
            field_name: field.to_string(),
            tag: None,
            method: MatchMethod::Contains,
            card_view: true,
            maximum_score: 5,
            increase_score: 1,
            decrease_score: 1,
        };
        let title = db.add_criterion(&mk(Some(site), "title")).unwrap();
        db.add_criterion(&mk(Some(other), "company")).unwrap();
        let global = db.add_criterion(&mk(None, "description")).unwrap();
        db.add_criterion_item(title, "warehouse", Impact::Increase).unwrap();
        db.add_criterion_item(title, "senior", Impact::Decrease).unwrap();
        db.add_criterion_item(global, "forklift licence", Impact::Minimum)
            .unwrap();

        let rules = db.load_rules(DEFAULT_USER_ID, Some(site)).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].0.field_name, "title");
        assert_eq!(rules[0].1.len(), 2);
        assert_eq!(rules[0].1[0].term, "warehouse");
        assert_eq!(rules[0].1[1].impact, Impact::Decrease);
        assert_eq!(rules[1].0.site_id, None);

        assert_eq!(db.load_rules(DEFAULT_USER_ID, None).unwrap().len(), 3);
    }

    #[test]
    fn test_deleting_role_cascades_to_keywords_and_listings() {
        let (db, site, kw) = seeded();
        db.insert_listing(&new_listing(site, kw, "81000003", 3)).unwrap();
        db.insert_run_summary(&NewRunSummary {
            keyword_id: kw,
            site_id: site,
            listings_found: 1,
            ..Default::default()
        })
        .unwrap();

        db.conn.execute("DELETE FROM Roles", []).unwrap();

        let listings: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM Job_Listings", [], |r| r.get(0))
            .unwrap();
        let summaries: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM Search_Run_Summary", [], |r| r.get(0))
            .unwrap();
        assert_eq!(listings, 0);
        assert_eq!(summaries, 0);
    }

    #[test]
    fn test_mark_applied_records_application() {
        let (db, site, kw) = seeded();
        let id = db
            .insert_listing(&new_listing(site, kw, "81000004", 4))
            .unwrap()
            .unwrap();
        assert!(db
            .set_listing_status(id, ListingStatus::Applied, Some("sent cv"))
            .unwrap());
        assert!(db.set_listing_status(id, ListingStatus::Pending, None).unwrap());
        assert!(!db.set_listing_status(4242, ListingStatus::Ignored, None).unwrap());

        assert_eq!(db.count_applications(id).unwrap(), 1);
        let stored = db.get_listing(id).unwrap().unwrap();
        assert_eq!(stored.status, ListingStatus::Pending);
    }

    #[test]
    fn test_list_listings_filters_and_orders_by_score() {
        let (db, site, kw) = seeded();
        db.insert_listing(&new_listing(site, kw, "1", 2)).unwrap();
        db.insert_listing(&new_listing(site, kw, "2", 5)).unwrap();
        db.insert_listing(&new_listing(site, kw, "3", 4)).unwrap();

        let all = db.list_listings(&ListingFilter::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|l| l.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);

        let good = db
            .list_listings(&ListingFilter {
                min_score: Some(4),
                keyword: Some("WAREHOUSE".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(good.len(), 2);
    }

    #[test]
    fn test_run_summaries_and_last_run() {
        let (db, site, kw) = seeded();
        db.insert_run_summary(&NewRunSummary {
            keyword_id: kw,
            site_id: site,
            total_reported: 120,
            listings_found: 7,
            skipped_duplicates: 3,
            highly_suitable: 2,
        })
        .unwrap();
        db.touch_keyword_last_run(kw).unwrap();

        let history = db.list_run_summaries(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].keyword.as_deref(), Some("warehouse"));
        assert_eq!(history[0].total_reported, 120);
        assert_eq!(history[0].highly_suitable, 2);

        let role_id: i64 = db
            .conn
            .query_row("SELECT role_id FROM Keywords WHERE keyword_id = ?1", [kw], |r| r.get(0))
            .unwrap();
        let keywords = db.list_keywords(role_id).unwrap();
        assert!(keywords[0].last_run.is_some());
    }

    #[test]
    fn test_find_site_defaults_to_first_enabled() {
        let (db, _, _) = seeded();
        let mut config = SiteConfig::default();
        config.card_tag = "div.card".to_string();
        db.add_site("indeed", "https://indeed.example/q-", "", &config)
            .unwrap();

        let first = db.find_site(None).unwrap().unwrap();
        assert_eq!(first.name, "seek");
        let named = db.find_site(Some("INDEED")).unwrap().unwrap();
        assert_eq!(named.config.card_tag, "div.card");
        assert!(db.find_site(Some("nope")).unwrap().is_none());
    }
}
