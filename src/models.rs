use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::adapter::SiteConfig;

/// Raw or merged listing fields keyed by field name ("title", "company", ...).
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub url_prefix: String,
    pub url_suffix: String,
    pub enabled: bool,
    pub config: SiteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub user_id: i64,
    pub site_id: i64,
    pub name: String,
    pub enabled: bool,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub id: i64,
    pub role_id: i64,
    pub keyword: String,
    pub enabled: bool,
    pub last_run: Option<String>,
}

/// One enabled (role, keyword) pair the orchestrator will scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordTask {
    pub keyword_id: i64,
    pub keyword: String,
    pub role_id: i64,
    pub role_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Word,
    Regex,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Contains => "contains",
            MatchMethod::Equals => "equals",
            MatchMethod::StartsWith => "startswith",
            MatchMethod::EndsWith => "endswith",
            MatchMethod::Word => "word",
            MatchMethod::Regex => "regex",
        }
    }
}

impl FromStr for MatchMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "contains" | "list" | "any" | "include" => Ok(MatchMethod::Contains),
            "equals" | "exact" => Ok(MatchMethod::Equals),
            "startswith" => Ok(MatchMethod::StartsWith),
            "endswith" => Ok(MatchMethod::EndsWith),
            "word" | "wholeword" => Ok(MatchMethod::Word),
            "regex" | "re" => Ok(MatchMethod::Regex),
            other => Err(anyhow!(
                "Unknown match method '{}'. Use contains, equals, startswith, endswith, word or regex",
                other
            )),
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a matching list item does to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Minimum,
    Decrease,
    Increase,
    Maximum,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Impact::Minimum => "minimum",
            Impact::Decrease => "decrease",
            Impact::Increase => "increase",
            Impact::Maximum => "maximum",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Impact::Minimum | Impact::Maximum)
    }
}

impl FromStr for Impact {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let alias = s.trim().to_lowercase().replace(['_', ' '], "");
        match alias.as_str() {
            "minimum" | "min" | "minimumscore" | "minscore" => Ok(Impact::Minimum),
            "decrease" | "dec" | "decreasescore" | "negative" => Ok(Impact::Decrease),
            "increase" | "inc" | "increasescore" | "positive" => Ok(Impact::Increase),
            "maximum" | "max" | "maximumscore" | "maxscore" => Ok(Impact::Maximum),
            _ => Err(anyhow!(
                "Unknown impact '{}'. Use minimum, decrease, increase or maximum",
                s
            )),
        }
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: i64,
    pub user_id: i64,
    pub site_id: Option<i64>,
    pub field_name: String,
    pub tag: Option<String>,
    pub method: MatchMethod,
    pub card_view: bool,
    pub maximum_score: u8,
    pub increase_score: u8,
    pub decrease_score: u8,
}

/// Criterion as entered through the CLI, before it has an id.
#[derive(Debug, Clone)]
pub struct NewCriterion {
    pub user_id: i64,
    pub site_id: Option<i64>,
    pub field_name: String,
    pub tag: Option<String>,
    pub method: MatchMethod,
    pub card_view: bool,
    pub maximum_score: u8,
    pub increase_score: u8,
    pub decrease_score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionItem {
    pub id: i64,
    pub criterion_id: i64,
    pub term: String,
    pub impact: Impact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    New,
    Applied,
    Pending,
    Ignored,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::New => "new",
            ListingStatus::Applied => "applied",
            ListingStatus::Pending => "pending",
            ListingStatus::Ignored => "ignored",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(ListingStatus::New),
            "applied" | "apply" => Ok(ListingStatus::Applied),
            "pending" => Ok(ListingStatus::Pending),
            "ignored" | "ignore" => Ok(ListingStatus::Ignored),
            other => Err(anyhow!(
                "Unknown status '{}'. Use new, applied, pending or ignored",
                other
            )),
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub listing_id: String, // site's external id
    pub site_id: i64,
    pub keyword_id: i64,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub pay_rate: Option<String>,
    pub listing_date: Option<String>,
    pub closing_date: Option<String>,
    pub schedule: Option<String>,
    pub experience_level: Option<String>,
    pub requires_license: Option<bool>,
    pub no_experience: Option<bool>,
    pub suitability_score: u8,
    pub status: ListingStatus,
    pub captured_at: String,
    pub deep_scanned_at: Option<String>,
}

impl Listing {
    /// Stored card-level fields in the shape the scorer expects.
    pub fn field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("listing_id".to_string(), self.listing_id.clone());
        fields.insert("title".to_string(), self.title.clone());
        let optional = [
            ("company", &self.company),
            ("location", &self.location),
            ("url", &self.url),
            ("listing_date", &self.listing_date),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                fields.insert(name.to_string(), v.clone());
            }
        }
        fields
    }
}

/// A card that passed dedup and is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewListing {
    pub external_id: String,
    pub site_id: i64,
    pub keyword_id: i64,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub listing_date: Option<String>,
    pub suitability_score: u8,
}

/// Extended fields merged into a listing by the deep scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingEnrichment {
    pub description: String,
    pub pay_rate: Option<String>,
    pub closing_date: Option<String>,
    pub schedule: Option<String>,
    pub experience_level: Option<String>,
    pub requires_license: bool,
    pub no_experience: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: i64,
    pub keyword_id: i64,
    pub keyword: Option<String>, // joined for display
    pub site_id: i64,
    pub run_at: String,
    pub total_reported: i64,
    pub listings_found: i64,
    pub skipped_duplicates: i64,
    pub highly_suitable: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewRunSummary {
    pub keyword_id: i64,
    pub site_id: i64,
    pub total_reported: u32,
    pub listings_found: u32,
    pub skipped_duplicates: u32,
    pub highly_suitable: u32,
}
