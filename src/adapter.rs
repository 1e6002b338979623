use chrono::Utc;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{FieldMap, Site};

/// DOM knowledge for one site, stored as JSON on the `Sites` row.
///
/// Any tag may be a plain CSS selector (element text) or `selector@attr`
/// (attribute value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub result_count_tag: Option<String>,
    pub card_tag: String,
    pub title_tag: String,
    pub link_tag: Option<String>,
    pub company_tag: Option<String>,
    pub location_tag: Option<String>,
    pub date_tag: Option<String>,
    pub description_tag: String,
    pub next_page_tag: Option<String>,
    pub id_attr: Option<String>,
    pub id_pattern: String,
    pub page_param: String,
    pub challenge_markers: Vec<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            result_count_tag: Some(r#"[data-automation="totalJobsCount"]"#.to_string()),
            card_tag: r#"article[data-automation="normalJob"]"#.to_string(),
            title_tag: r#"a[data-automation="jobTitle"]"#.to_string(),
            link_tag: None,
            company_tag: Some(r#"[data-automation="jobCompany"]"#.to_string()),
            location_tag: Some(r#"[data-automation="jobLocation"]"#.to_string()),
            date_tag: Some(r#"[data-automation="jobListingDate"]"#.to_string()),
            description_tag: r#"[data-automation="jobAdDetails"]"#.to_string(),
            next_page_tag: None,
            id_attr: Some("data-job-id".to_string()),
            id_pattern: r"(\d{5,12})".to_string(),
            page_param: "page".to_string(),
            challenge_markers: vec![
                "verify you are human".to_string(),
                "are you a robot".to_string(),
                "unusual traffic".to_string(),
                "cf-challenge".to_string(),
                "h-captcha".to_string(),
            ],
        }
    }
}

/// A criterion's extraction tag as handed to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTag {
    pub field: String,
    pub tag: String,
    pub card_view: bool,
}

/// One page of search results.
#[derive(Debug)]
pub struct SummaryPage {
    pub total_count: Option<u32>,
    pub cards: Vec<ScrapeResult<FieldMap>>,
    pub has_next: bool,
}

/// One implementation per listing site.
pub trait SiteAdapter {
    fn name(&self) -> &str;

    /// `page_index` starts at 1.
    fn fetch_summary_page(&mut self, keyword: &str, page_index: u32) -> ScrapeResult<SummaryPage>;

    fn fetch_detail(&mut self, listing_url: &str) -> ScrapeResult<FieldMap>;
}

/// A fetched document. `status` is `None` when the source cannot see the
/// HTTP status (a browser).
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    pub status: Option<u16>,
}

/// Something that can turn a URL into HTML. Error statuses still return
/// the body so challenge pages can be recognised.
pub trait PageSource {
    fn fetch_html(&mut self, url: &str) -> ScrapeResult<FetchedPage>;
}

#[derive(Debug, Clone)]
struct Tag {
    selector: Selector,
    attr: Option<String>,
}

impl Tag {
    fn parse(raw: &str) -> ScrapeResult<Self> {
        let raw = raw.trim();
        let (css, attr) = match raw.rsplit_once('@') {
            Some((css, attr))
                if !attr.is_empty()
                    && attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                (css.trim(), Some(attr.to_string()))
            }
            _ => (raw, None),
        };
        let selector = Selector::parse(css)
            .map_err(|e| ScrapeError::Configuration(format!("invalid selector '{}': {:?}", css, e)))?;
        Ok(Self { selector, attr })
    }

    fn extract(&self, scope: ElementRef) -> Option<String> {
        let element = scope.select(&self.selector).next()?;
        let value = match &self.attr {
            Some(attr) => element.value().attr(attr)?.trim().to_string(),
            None => normalize_text(element),
        };
        if value.is_empty() { None } else { Some(value) }
    }
}

fn normalize_text(element: ElementRef) -> String {
    element
        .text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_optional(raw: &Option<String>) -> ScrapeResult<Option<Tag>> {
    match raw.as_deref().map(str::trim) {
        Some(r) if !r.is_empty() => Tag::parse(r).map(Some),
        _ => Ok(None),
    }
}

/// Builds the search URL for one keyword and page.
pub fn build_search_url(
    prefix: &str,
    suffix: &str,
    page_param: &str,
    keyword: &str,
    page_index: u32,
) -> ScrapeResult<String> {
    let slug = slugify(keyword);
    if slug.is_empty() {
        return Err(ScrapeError::Configuration(format!(
            "keyword '{}' has no searchable characters",
            keyword
        )));
    }
    let mut url = format!("{}{}{}", prefix, slug, suffix);
    if page_index > 1 {
        let sep = if url.contains('?') { '&' } else { '?' };
        url.push_str(&format!("{}{}={}", sep, page_param, page_index));
    }
    Ok(url)
}

fn slugify(keyword: &str) -> String {
    let mut slug = String::new();
    for c in keyword.trim().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

static RE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d[\d,]*)").expect("count pattern is valid"));
static RE_EMBEDDED_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""totalJobCount"\s*:\s*(\d+)"#).expect("total pattern is valid")
});

fn parse_count(text: &str) -> Option<u32> {
    let digits = RE_COUNT.captures(text)?.get(1)?.as_str().replace(',', "");
    digits.parse().ok()
}

fn embedded_total(html: &str) -> Option<u32> {
    RE_EMBEDDED_TOTAL.captures(html)?.get(1)?.as_str().parse().ok()
}

/// Configuration-driven adapter: every site-specific value comes from
/// [`SiteConfig`] and the criteria's field tags.
pub struct SelectorAdapter<S: PageSource> {
    site_name: String,
    url_prefix: String,
    url_suffix: String,
    page_param: String,
    base_url: Option<Url>,
    result_count: Option<Tag>,
    card: Selector,
    title: Tag,
    link: Tag,
    company: Option<Tag>,
    location: Option<Tag>,
    date: Option<Tag>,
    description: Tag,
    next_page: Option<Tag>,
    id_attr: Option<String>,
    id_pattern: Regex,
    challenge_markers: Vec<String>,
    fields: Vec<(String, Tag, bool)>,
    page_size: usize,
    debug_dir: Option<PathBuf>,
    source: S,
}

impl<S: PageSource> SelectorAdapter<S> {
    pub fn new(site: &Site, field_tags: &[FieldTag], source: S) -> ScrapeResult<Self> {
        let config = &site.config;
        let card = Selector::parse(config.card_tag.trim()).map_err(|e| {
            ScrapeError::Configuration(format!("invalid card tag '{}': {:?}", config.card_tag, e))
        })?;
        let title = Tag::parse(&config.title_tag)?;
        let link = match config.link_tag.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Tag::parse(raw)?,
            _ => Tag {
                selector: title.selector.clone(),
                attr: Some("href".to_string()),
            },
        };
        let id_pattern = Regex::new(&config.id_pattern).map_err(|e| {
            ScrapeError::Configuration(format!("invalid id pattern '{}': {}", config.id_pattern, e))
        })?;

        let mut fields = Vec::new();
        for ft in field_tags {
            match Tag::parse(&ft.tag) {
                Ok(tag) => fields.push((ft.field.clone(), tag, ft.card_view)),
                Err(e) => tracing::warn!("Skipping extraction tag for field '{}': {}", ft.field, e),
            }
        }

        Ok(Self {
            site_name: site.name.clone(),
            url_prefix: site.url_prefix.clone(),
            url_suffix: site.url_suffix.clone(),
            page_param: config.page_param.clone(),
            base_url: Url::parse(&site.url_prefix).ok(),
            result_count: parse_optional(&config.result_count_tag)?,
            card,
            title,
            link,
            company: parse_optional(&config.company_tag)?,
            location: parse_optional(&config.location_tag)?,
            date: parse_optional(&config.date_tag)?,
            description: Tag::parse(&config.description_tag)?,
            next_page: parse_optional(&config.next_page_tag)?,
            id_attr: config.id_attr.clone().filter(|a| !a.trim().is_empty()),
            id_pattern,
            challenge_markers: config
                .challenge_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            fields,
            page_size: 0,
            debug_dir: None,
            source,
        })
    }

    /// Pages that yield no cards, unparseable cards or no description are
    /// saved under `dir` for inspection.
    pub fn with_debug_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_dir = dir;
        self
    }

    fn fetch_checked(&mut self, url: &str) -> ScrapeResult<String> {
        let page = self.source.fetch_html(url)?;
        let lower = page.html.to_lowercase();
        if let Some(marker) = self.challenge_markers.iter().find(|m| lower.contains(m.as_str())) {
            debug!("Challenge marker '{}' found at {}", marker, url);
            return Err(ScrapeError::VerificationChallenge { url: url.to_string() });
        }
        if let Some(status) = page.status.filter(|s| !(200..300).contains(s)) {
            return Err(ScrapeError::fetch(url, format!("HTTP {}", status)));
        }
        Ok(page.html)
    }

    fn save_artifact(&self, label: &str, html: &str) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        let mut name: String = slugify(&format!("{} {}", self.site_name, label))
            .chars()
            .take(80)
            .collect();
        name.push_str(&format!("-{}.html", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let path = dir.join(name);
        let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, html));
        match written {
            Ok(()) => debug!("Saved page to {}", path.display()),
            Err(e) => warn!("Could not save page to {}: {}", path.display(), e),
        }
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            return href.to_string();
        }
        match self.base_url.as_ref().and_then(|base| base.join(href).ok()) {
            Some(url) => url.to_string(),
            None => href.to_string(),
        }
    }

    fn extract_card(&self, card: ElementRef) -> ScrapeResult<FieldMap> {
        let title = self
            .title
            .extract(card)
            .ok_or_else(|| ScrapeError::parse("card", "no title element"))?;
        let url = self.link.extract(card).map(|href| self.absolute_url(&href));

        let external_id = self
            .id_attr
            .as_deref()
            .and_then(|attr| card.value().attr(attr))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                let url = url.as_deref()?;
                let caps = self.id_pattern.captures(url)?;
                caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str().to_string())
            })
            .ok_or_else(|| ScrapeError::parse(format!("card '{}'", title), "no listing id"))?;

        let mut fields = FieldMap::new();
        fields.insert("listing_id".to_string(), external_id);
        fields.insert("title".to_string(), title);
        if let Some(url) = url {
            fields.insert("url".to_string(), url);
        }
        let optional = [
            ("company", &self.company),
            ("location", &self.location),
            ("listing_date", &self.date),
        ];
        for (name, tag) in optional {
            if let Some(value) = tag.as_ref().and_then(|t| t.extract(card)) {
                fields.insert(name.to_string(), value);
            }
        }
        for (name, tag, card_view) in &self.fields {
            if !*card_view {
                continue;
            }
            if let Some(value) = tag.extract(card) {
                fields.insert(name.clone(), value);
            }
        }
        Ok(fields)
    }
}

impl<S: PageSource> SiteAdapter for SelectorAdapter<S> {
    fn name(&self) -> &str {
        &self.site_name
    }

    fn fetch_summary_page(&mut self, keyword: &str, page_index: u32) -> ScrapeResult<SummaryPage> {
        let url = build_search_url(
            &self.url_prefix,
            &self.url_suffix,
            &self.page_param,
            keyword,
            page_index,
        )?;
        let html = self.fetch_checked(&url)?;
        let document = Html::parse_document(&html);
        let root = document.root_element();

        let total_count = self
            .result_count
            .as_ref()
            .and_then(|tag| tag.extract(root))
            .and_then(|text| parse_count(&text))
            .or_else(|| embedded_total(&html));

        let cards: Vec<_> = document
            .select(&self.card)
            .map(|card| self.extract_card(card))
            .collect();
        self.page_size = self.page_size.max(cards.len());
        if cards.is_empty() || cards.iter().any(|c| c.is_err()) {
            self.save_artifact(&format!("{} page {}", keyword, page_index), &html);
        }

        let has_next = if cards.is_empty() {
            false
        } else if let Some(next) = &self.next_page {
            root.select(&next.selector).next().is_some()
        } else if let Some(total) = total_count {
            (page_index as usize) * self.page_size < total as usize
        } else {
            true
        };

        debug!(
            "{} page {} for '{}': {} cards, total={:?}, has_next={}",
            self.site_name,
            page_index,
            keyword,
            cards.len(),
            total_count,
            has_next
        );

        Ok(SummaryPage {
            total_count,
            cards,
            has_next,
        })
    }

    fn fetch_detail(&mut self, listing_url: &str) -> ScrapeResult<FieldMap> {
        let html = self.fetch_checked(listing_url)?;
        let document = Html::parse_document(&html);
        let root = document.root_element();

        let Some(description) = self.description.extract(root) else {
            self.save_artifact(&format!("detail {}", listing_url), &html);
            return Err(ScrapeError::parse(
                format!("detail page {}", listing_url),
                "no description",
            ));
        };

        let mut fields = FieldMap::new();
        fields.insert("description".to_string(), description);
        for (name, tag, _) in &self.fields {
            if let Some(value) = tag.extract(root) {
                fields.insert(name.clone(), value);
            }
        }
        Ok(fields)
    }
}
