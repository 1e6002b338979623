//! Fakes shared by the unit tests.

use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::adapter::{FetchedPage, PageSource, SiteAdapter, SiteConfig, SummaryPage};
use crate::db::{Database, DEFAULT_USER_ID};
use crate::error::{ScrapeError, ScrapeResult};
use crate::interrupt::{Challenge, Control, InterruptHandler};
use crate::models::{FieldMap, Site};
use crate::progress::{ProgressSink, ProgressSnapshot};
use crate::session::{CrawlSession, Pacing, RetryPolicy};

pub fn test_site() -> Site {
    Site {
        id: 1,
        name: "example".to_string(),
        url_prefix: "https://www.example.com/".to_string(),
        url_suffix: "-jobs".to_string(),
        enabled: true,
        config: SiteConfig::default(),
    }
}

/// Fixed HTML and status per URL.
#[derive(Default)]
pub struct StaticSource {
    pages: HashMap<String, FetchedPage>,
}

impl StaticSource {
    pub fn insert(&mut self, url: &str, html: &str) {
        self.insert_with_status(url, 200, html);
    }

    pub fn insert_with_status(&mut self, url: &str, status: u16, html: &str) {
        self.pages.insert(
            url.to_string(),
            FetchedPage {
                html: html.to_string(),
                status: Some(status),
            },
        );
    }
}

impl PageSource for StaticSource {
    fn fetch_html(&mut self, url: &str) -> ScrapeResult<FetchedPage> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| ScrapeError::fetch(url, "404 Not Found"))
    }
}

pub fn card(id: &str, title: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("listing_id".to_string(), id.to_string());
    fields.insert("title".to_string(), title.to_string());
    fields.insert("url".to_string(), format!("https://www.example.com/job/{}", id));
    fields
}

/// Canned search results and detail pages, with failures and challenges
/// that can be armed per page.
#[derive(Default)]
pub struct SiteScript {
    /// keyword -> pages -> cards (`None` is a card that fails to parse)
    pub pages: HashMap<String, Vec<Vec<Option<FieldMap>>>>,
    pub totals: HashMap<String, u32>,
    pub details: HashMap<String, FieldMap>,
    pub summary_failures: HashMap<(String, u32), u32>,
    pub summary_challenges: HashMap<(String, u32), u32>,
    pub detail_failures: HashMap<String, u32>,
    pub detail_challenges: HashMap<String, u32>,
    pub summary_calls: Vec<(String, u32)>,
    pub detail_calls: Vec<String>,
}

fn take_one<K: std::hash::Hash + Eq>(armed: &mut HashMap<K, u32>, key: &K) -> bool {
    match armed.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

pub struct ScriptedAdapter {
    script: Rc<RefCell<SiteScript>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            script: Rc::new(RefCell::new(SiteScript::default())),
        }
    }

    pub fn script(&self) -> Rc<RefCell<SiteScript>> {
        Rc::clone(&self.script)
    }

    pub fn add_pages(&self, keyword: &str, pages: Vec<Vec<Option<FieldMap>>>) {
        self.script.borrow_mut().pages.insert(keyword.to_string(), pages);
    }

    pub fn set_total(&self, keyword: &str, total: u32) {
        self.script.borrow_mut().totals.insert(keyword.to_string(), total);
    }

    pub fn add_details(&self, details: &[(&str, &str)]) {
        let mut script = self.script.borrow_mut();
        for (url, description) in details {
            let mut fields = FieldMap::new();
            fields.insert("description".to_string(), description.to_string());
            script.details.insert(url.to_string(), fields);
        }
    }

    pub fn fail_summary(&self, keyword: &str, page: u32, times: u32) {
        self.script
            .borrow_mut()
            .summary_failures
            .insert((keyword.to_string(), page), times);
    }

    pub fn challenge_summary(&self, keyword: &str, page: u32, times: u32) {
        self.script
            .borrow_mut()
            .summary_challenges
            .insert((keyword.to_string(), page), times);
    }

    pub fn fail_detail(&self, url: &str, times: u32) {
        self.script.borrow_mut().detail_failures.insert(url.to_string(), times);
    }

    pub fn challenge_detail(&self, url: &str, times: u32) {
        self.script
            .borrow_mut()
            .detail_challenges
            .insert(url.to_string(), times);
    }
}

impl SiteAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "example"
    }

    fn fetch_summary_page(&mut self, keyword: &str, page_index: u32) -> ScrapeResult<SummaryPage> {
        let mut script = self.script.borrow_mut();
        script.summary_calls.push((keyword.to_string(), page_index));
        let url = format!("https://www.example.com/{}-jobs?page={}", keyword, page_index);
        let key = (keyword.to_string(), page_index);
        if take_one(&mut script.summary_challenges, &key) {
            return Err(ScrapeError::VerificationChallenge { url });
        }
        if take_one(&mut script.summary_failures, &key) {
            return Err(ScrapeError::fetch(&url, "connection reset"));
        }

        let pages = script.pages.get(keyword).cloned().unwrap_or_default();
        let total = script
            .totals
            .get(keyword)
            .copied()
            .unwrap_or_else(|| pages.iter().map(|p| p.len() as u32).sum());
        let cards = pages
            .get(page_index as usize - 1)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.ok_or_else(|| ScrapeError::parse("card", "no title element")))
            .collect();
        Ok(SummaryPage {
            total_count: Some(total),
            cards,
            has_next: (page_index as usize) < pages.len(),
        })
    }

    fn fetch_detail(&mut self, listing_url: &str) -> ScrapeResult<FieldMap> {
        let mut script = self.script.borrow_mut();
        script.detail_calls.push(listing_url.to_string());
        let key = listing_url.to_string();
        if take_one(&mut script.detail_challenges, &key) {
            return Err(ScrapeError::VerificationChallenge { url: key });
        }
        if take_one(&mut script.detail_failures, &key) {
            return Err(ScrapeError::fetch(listing_url, "timed out"));
        }
        script
            .details
            .get(listing_url)
            .cloned()
            .ok_or_else(|| ScrapeError::parse(format!("detail page {}", listing_url), "no description"))
    }
}

pub type Published = Rc<RefCell<Vec<ProgressSnapshot>>>;

/// Keeps every published snapshot.
#[derive(Default)]
pub struct RecordingSink {
    published: Published,
}

impl RecordingSink {
    pub fn published(&self) -> Published {
        Rc::clone(&self.published)
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&mut self, snapshot: &ProgressSnapshot) -> Result<()> {
        self.published.borrow_mut().push(snapshot.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct ControlScript {
    pub stop: bool,
    pub stop_on_suspend: bool,
    /// Stop after this many `stop_requested` checks have answered false.
    pub stop_after_checks: Option<u32>,
    pub stop_checks: u32,
    pub resume_after: Option<u32>,
    pub resume_polls: u32,
    pub announced: Vec<Option<String>>,
    pub resets: u32,
}

#[derive(Default)]
pub struct ScriptedControl {
    script: Rc<RefCell<ControlScript>>,
}

impl ScriptedControl {
    pub fn resume_after(polls: u32) -> Self {
        let control = Self::default();
        control.script.borrow_mut().resume_after = Some(polls);
        control
    }

    pub fn stop_on_suspend() -> Self {
        let control = Self::default();
        control.script.borrow_mut().stop_on_suspend = true;
        control
    }

    pub fn stop_after_checks(checks: u32) -> Self {
        let control = Self::default();
        control.script.borrow_mut().stop_after_checks = Some(checks);
        control
    }

    pub fn script(&self) -> Rc<RefCell<ControlScript>> {
        Rc::clone(&self.script)
    }
}

impl Control for ScriptedControl {
    fn stop_requested(&mut self) -> bool {
        let mut s = self.script.borrow_mut();
        if !s.stop {
            if let Some(limit) = s.stop_after_checks {
                if s.stop_checks >= limit {
                    s.stop = true;
                }
            }
            s.stop_checks += 1;
        }
        s.stop
    }

    fn take_resume(&mut self) -> bool {
        let mut s = self.script.borrow_mut();
        s.resume_polls += 1;
        s.resume_after.is_some_and(|n| s.resume_polls >= n)
    }

    fn mark_suspended(&mut self, challenge: Option<&Challenge>) -> Result<()> {
        let mut s = self.script.borrow_mut();
        s.announced.push(challenge.map(|c| c.url.clone()));
        if challenge.is_some() && s.stop_on_suspend {
            s.stop = true;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut s = self.script.borrow_mut();
        s.resets += 1;
        s.resume_polls = 0;
        Ok(())
    }
}

/// A session with no pacing or backoff delays.
pub fn quiet_session(adapter: ScriptedAdapter, control: ScriptedControl, attempts: u32) -> CrawlSession {
    CrawlSession::new(
        Box::new(adapter),
        InterruptHandler::new(Box::new(control), Duration::ZERO, None),
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ms: 0,
        },
        Pacing::default(),
    )
}

/// Initialised in-memory database with the example site, one role, and the
/// given keywords. Returns the site and keyword ids in argument order.
pub fn seeded_db(keywords: &[&str]) -> (Database, Site, Vec<i64>) {
    let db = Database::open_in_memory().unwrap();
    db.init().unwrap();
    let template = test_site();
    db.add_site(
        &template.name,
        &template.url_prefix,
        &template.url_suffix,
        &template.config,
    )
    .unwrap();
    let site = db.find_site(Some(&template.name)).unwrap().unwrap();
    let role = db.add_role(DEFAULT_USER_ID, site.id, "Warehouse", 1).unwrap();
    let ids = keywords
        .iter()
        .map(|k| db.add_keyword(role, k).unwrap())
        .collect();
    (db, site, ids)
}
