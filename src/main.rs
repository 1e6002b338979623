mod adapter;
mod browser;
mod config;
mod db;
mod dedup;
mod deep_scan;
mod enrich;
mod error;
mod interrupt;
mod models;
mod orchestrator;
mod progress;
mod scoring;
mod session;
mod summary;
#[cfg(test)]
mod testing;
mod tui;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use adapter::{FieldTag, SelectorAdapter, SiteAdapter, SiteConfig};
use browser::{BrowserSession, HttpSource};
use config::{Backend, Settings};
use db::{Database, ListingFilter};
use error::{ScrapeError, ScrapeResult};
use interrupt::{FileControl, InterruptHandler};
use models::{Impact, ListingStatus, MatchMethod, NewCriterion, Site};
use orchestrator::{KeywordOutcome, Orchestrator, RunReport};
use progress::{JsonFileSink, ProgressTracker};
use session::CrawlSession;

#[derive(Parser)]
#[command(name = "jobscout")]
#[command(about = "Harvest job listings, score them against your criteria, and track applications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage job sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },

    /// Manage roles (groups of search keywords)
    Role {
        #[command(subcommand)]
        command: RoleCommands,
    },

    /// Manage search keywords
    Keyword {
        #[command(subcommand)]
        command: KeywordCommands,
    },

    /// Manage scoring criteria
    Criterion {
        #[command(subcommand)]
        command: CriterionCommands,
    },

    /// Crawl every enabled keyword of a site
    Run {
        /// Site name (defaults to JOBSCOUT_SITE, then the first enabled site)
        #[arg(short, long)]
        site: Option<String>,

        /// Stop each keyword after this many result pages
        #[arg(long)]
        max_pages: Option<u32>,

        /// Only crawl the first N keywords
        #[arg(long)]
        keyword_limit: Option<usize>,

        /// Skip the detail-page pass
        #[arg(long)]
        no_deep_scan: bool,

        /// Minimum summary score for a deep scan (1-5)
        #[arg(long)]
        threshold: Option<u8>,

        /// Most detail pages per keyword (0 for no cap)
        #[arg(long)]
        deep_scan_limit: Option<usize>,

        /// Fetch with plain HTTP instead of the browser
        #[arg(long)]
        http: bool,

        /// Run the browser headless
        #[arg(long)]
        headless: bool,
    },

    /// Resume a run suspended on a verification challenge
    Resume,

    /// Ask the running crawl to stop
    Stop,

    /// Show progress of the current or last run
    Status {
        /// Live view that refreshes until you quit
        #[arg(short, long)]
        watch: bool,
    },

    /// List harvested listings, best first
    List {
        /// Filter by status (new, applied, pending, ignored)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by search keyword
        #[arg(short, long)]
        keyword: Option<String>,

        /// Minimum suitability score
        #[arg(short, long)]
        min_score: Option<u8>,

        /// Number of listings to show
        #[arg(short, long, default_value = "25")]
        limit: usize,
    },

    /// Show listing details
    Show {
        /// Listing ID
        id: i64,
    },

    /// Set a listing's status (applied also records an application)
    Mark {
        /// Listing ID
        id: i64,

        /// new, applied, pending or ignored
        status: String,

        /// Notes stored with the application
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Show recent run summaries
    History {
        /// Number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    /// Register a site
    Add {
        /// Site name
        name: String,

        /// Search URL up to the keyword slug
        prefix: String,

        /// Search URL after the keyword slug
        #[arg(default_value = "")]
        suffix: String,

        /// JSON file with the site's selectors
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List sites
    List,
}

#[derive(Subcommand)]
enum RoleCommands {
    /// Add a role
    Add {
        /// Role name
        name: String,

        /// Site name (defaults to the first enabled site)
        #[arg(short, long)]
        site: Option<String>,

        /// Lower ranks are crawled first
        #[arg(short, long, default_value = "1")]
        rank: i64,
    },

    /// List roles and their keywords
    List,

    /// Enable a role
    Enable {
        /// Role ID
        id: i64,
    },

    /// Disable a role
    Disable {
        /// Role ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum KeywordCommands {
    /// Add a search keyword to a role
    Add {
        /// Role ID
        role_id: i64,

        /// Search keyword
        keyword: String,
    },

    /// Enable a keyword
    Enable {
        /// Keyword ID
        id: i64,
    },

    /// Disable a keyword
    Disable {
        /// Keyword ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum CriterionCommands {
    /// Add a criterion on one listing field
    Add {
        /// Field to match (title, company, location, description, ...)
        field: String,

        /// Selector to extract the field with (`selector` or `selector@attr`)
        #[arg(short, long)]
        tag: Option<String>,

        /// contains, equals, startswith, endswith, word or regex
        #[arg(short, long, default_value = "contains")]
        method: String,

        /// Also apply on result cards, not only detail pages
        #[arg(long)]
        card_view: bool,

        /// Only apply on this site
        #[arg(short, long)]
        site: Option<String>,

        /// Score a maximum item sets
        #[arg(long, default_value = "5")]
        maximum: u8,

        /// Points an increase item adds
        #[arg(long, default_value = "1")]
        increase: u8,

        /// Points a decrease item removes
        #[arg(long, default_value = "1")]
        decrease: u8,
    },

    /// Add a term to a criterion
    Item {
        /// Criterion ID
        criterion_id: i64,

        /// Term to look for
        term: String,

        /// minimum, decrease, increase or maximum
        impact: String,
    },

    /// List criteria and their items
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobscout=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Resume => {
            FileControl::new(&settings.control_dir).request_resume()?;
            println!("Resume requested.");
            return Ok(());
        }
        Commands::Stop => {
            FileControl::new(&settings.control_dir).request_stop()?;
            println!("Stop requested. The run ends after its current fetch.");
            return Ok(());
        }
        Commands::Status { watch } => {
            if watch {
                return tui::watch(&settings.progress_path, &settings.control_dir);
            }
            print_status(&settings);
            return Ok(());
        }
        _ => {}
    }

    let db = Database::open(&settings.db_path)?;
    let user_id = settings.run.user_id;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Site { command } => {
            db.ensure_initialized()?;
            match command {
                SiteCommands::Add {
                    name,
                    prefix,
                    suffix,
                    config,
                } => {
                    let site_config = match config {
                        Some(path) => {
                            let json = std::fs::read_to_string(&path)
                                .with_context(|| format!("Failed to read {}", path.display()))?;
                            serde_json::from_str::<SiteConfig>(&json)
                                .with_context(|| format!("Invalid site config in {}", path.display()))?
                        }
                        None => SiteConfig::default(),
                    };
                    let id = db.add_site(&name, &prefix, &suffix, &site_config)?;
                    println!("Added site '{}' (ID: {})", name, id);
                }

                SiteCommands::List => {
                    let sites = db.list_sites()?;
                    if sites.is_empty() {
                        println!("No sites found.");
                    } else {
                        println!("{:<6} {:<8} {:<16} {:<50}", "ID", "ENABLED", "NAME", "SEARCH URL");
                        println!("{}", "-".repeat(82));
                        for site in sites {
                            println!(
                                "{:<6} {:<8} {:<16} {:<50}",
                                site.id,
                                yes_no(site.enabled),
                                truncate(&site.name, 14),
                                truncate(&format!("{}<keyword>{}", site.url_prefix, site.url_suffix), 50)
                            );
                        }
                    }
                }
            }
        }

        Commands::Role { command } => {
            db.ensure_initialized()?;
            match command {
                RoleCommands::Add { name, site, rank } => {
                    let site = require_site(&db, site.as_deref())?;
                    let id = db.add_role(user_id, site.id, &name, rank)?;
                    println!("Added role '{}' on {} (ID: {})", name, site.name, id);
                }

                RoleCommands::List => {
                    let roles = db.list_roles(user_id)?;
                    if roles.is_empty() {
                        println!("No roles found.");
                    }
                    for role in roles {
                        println!(
                            "Role #{} {} (rank {}, site {}){}",
                            role.id,
                            role.name,
                            role.rank,
                            role.site_id,
                            if role.enabled { "" } else { " [disabled]" }
                        );
                        for kw in db.list_keywords(role.id)? {
                            println!(
                                "  #{:<5} {:<30} {:<8} last run: {}",
                                kw.id,
                                truncate(&kw.keyword, 28),
                                if kw.enabled { "enabled" } else { "disabled" },
                                kw.last_run.as_deref().unwrap_or("never")
                            );
                        }
                    }
                }

                RoleCommands::Enable { id } => {
                    set_enabled(db.set_role_enabled(id, true)?, "Role", id, true)?;
                }

                RoleCommands::Disable { id } => {
                    set_enabled(db.set_role_enabled(id, false)?, "Role", id, false)?;
                }
            }
        }

        Commands::Keyword { command } => {
            db.ensure_initialized()?;
            match command {
                KeywordCommands::Add { role_id, keyword } => {
                    let id = db.add_keyword(role_id, &keyword)?;
                    println!("Added keyword '{}' (ID: {})", keyword, id);
                }

                KeywordCommands::Enable { id } => {
                    set_enabled(db.set_keyword_enabled(id, true)?, "Keyword", id, true)?;
                }

                KeywordCommands::Disable { id } => {
                    set_enabled(db.set_keyword_enabled(id, false)?, "Keyword", id, false)?;
                }
            }
        }

        Commands::Criterion { command } => {
            db.ensure_initialized()?;
            match command {
                CriterionCommands::Add {
                    field,
                    tag,
                    method,
                    card_view,
                    site,
                    maximum,
                    increase,
                    decrease,
                } => {
                    let site_id = match site {
                        Some(name) => Some(require_site(&db, Some(&name))?.id),
                        None => None,
                    };
                    if !(1..=5).contains(&maximum) {
                        return Err(anyhow!("--maximum must be between 1 and 5"));
                    }
                    let id = db.add_criterion(&NewCriterion {
                        user_id,
                        site_id,
                        field_name: field.clone(),
                        tag,
                        method: method.parse::<MatchMethod>()?,
                        card_view,
                        maximum_score: maximum,
                        increase_score: increase,
                        decrease_score: decrease,
                    })?;
                    println!("Added criterion on '{}' (ID: {})", field, id);
                }

                CriterionCommands::Item {
                    criterion_id,
                    term,
                    impact,
                } => {
                    let impact = impact.parse::<Impact>()?;
                    let id = db.add_criterion_item(criterion_id, &term, impact)?;
                    println!("Added '{}' ({}) to criterion #{} (ID: {})", term, impact, criterion_id, id);
                }

                CriterionCommands::List => {
                    let rules = db.load_rules(user_id, None)?;
                    if rules.is_empty() {
                        println!("No criteria found.");
                    }
                    for (criterion, items) in rules {
                        let scope = match criterion.site_id {
                            Some(id) => format!("site {}", id),
                            None => "all sites".to_string(),
                        };
                        println!(
                            "Criterion #{} {} [{}] {}{}",
                            criterion.id,
                            criterion.field_name,
                            criterion.method,
                            scope,
                            if criterion.card_view { ", card view" } else { "" }
                        );
                        if let Some(tag) = &criterion.tag {
                            println!("  tag: {}", tag);
                        }
                        for item in items {
                            println!("  #{:<5} {:<10} {}", item.id, item.impact, item.term);
                        }
                    }
                }
            }
        }

        Commands::Run {
            site,
            max_pages,
            keyword_limit,
            no_deep_scan,
            threshold,
            deep_scan_limit,
            http,
            headless,
        } => {
            db.ensure_initialized()?;
            let mut settings = settings;
            if let Some(n) = max_pages {
                settings.run.max_pages = Some(n);
            }
            if let Some(n) = keyword_limit {
                settings.run.keyword_limit = Some(n);
            }
            if no_deep_scan {
                settings.run.deep_scan = false;
            }
            if let Some(t) = threshold {
                if !(1..=5).contains(&t) {
                    return Err(anyhow!("--threshold must be between 1 and 5"));
                }
                settings.run.threshold = t;
            }
            if let Some(n) = deep_scan_limit {
                settings.run.deep_scan_limit = (n > 0).then_some(n);
            }
            if http {
                settings.fetch.backend = Backend::Http;
            }
            if headless {
                settings.fetch.headless = true;
            }

            let site = require_site(&db, site.as_deref().or(settings.site.as_deref()))?;
            if !site.enabled {
                return Err(anyhow!("Site '{}' is disabled", site.name));
            }

            let tracker = ProgressTracker::new(
                Box::new(JsonFileSink::new(&settings.progress_path)),
                &site.name,
            );
            let mut orchestrator = Orchestrator::new(&db, tracker, settings.run.clone());
            println!("Crawling {} ...", site.name);
            let report = orchestrator.run(&site, |tags| open_session(&settings, &site, tags));
            print_report(&report);
            if let Some(reason) = report.aborted {
                return Err(anyhow!("Run aborted: {}", reason));
            }
        }

        Commands::List {
            status,
            keyword,
            min_score,
            limit,
        } => {
            db.ensure_initialized()?;
            let filter = ListingFilter {
                status: status.as_deref().map(str::parse::<ListingStatus>).transpose()?,
                keyword,
                min_score,
                limit: Some(limit),
            };
            let listings = db.list_listings(&filter)?;
            if listings.is_empty() {
                println!("No listings found.");
            } else {
                println!(
                    "{:<6} {:>5} {:<8} {:<32} {:<20} {:<16}",
                    "ID", "SCORE", "STATUS", "TITLE", "COMPANY", "PAY"
                );
                println!("{}", "-".repeat(92));
                for listing in listings {
                    println!(
                        "{:<6} {:>5} {:<8} {:<32} {:<20} {:<16}",
                        listing.id,
                        listing.suitability_score,
                        listing.status,
                        truncate(&listing.title, 30),
                        truncate(listing.company.as_deref().unwrap_or("-"), 18),
                        truncate(listing.pay_rate.as_deref().unwrap_or("-"), 16)
                    );
                }
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_listing(id)? {
                Some(listing) => {
                    println!("Listing #{} ({})", listing.id, listing.listing_id);
                    println!("Title: {}", listing.title);
                    if let Some(company) = &listing.company {
                        println!("Company: {}", company);
                    }
                    if let Some(location) = &listing.location {
                        println!("Location: {}", location);
                    }
                    println!("Score: {}/{}", listing.suitability_score, scoring::MAX_SCORE);
                    println!("Status: {}", listing.status);
                    if let Some(url) = &listing.url {
                        println!("URL: {}", url);
                    }
                    if let Some(pay) = &listing.pay_rate {
                        println!("Pay: {}", pay);
                    }
                    if let Some(schedule) = &listing.schedule {
                        println!("Schedule: {}", schedule);
                    }
                    if let Some(level) = &listing.experience_level {
                        println!("Experience: {}", level);
                    }
                    if let Some(flag) = listing.requires_license {
                        println!("Licence/transport required: {}", yes_no(flag));
                    }
                    if let Some(flag) = listing.no_experience {
                        println!("No experience needed: {}", yes_no(flag));
                    }
                    if let Some(date) = &listing.listing_date {
                        println!("Listed: {}", date);
                    }
                    if let Some(date) = &listing.closing_date {
                        println!("Closes: {}", date);
                    }
                    println!("Captured: {}", listing.captured_at);
                    if let Some(at) = &listing.deep_scanned_at {
                        println!("Deep scanned: {}", at);
                    }
                    let applications = db.count_applications(listing.id)?;
                    if applications > 0 {
                        println!("Applications: {}", applications);
                    }
                    if let Some(description) = &listing.description {
                        println!("\n--- Description ---\n{}", textwrap::fill(description, 80));
                    }
                }
                None => {
                    println!("Listing #{} not found.", id);
                }
            }
        }

        Commands::Mark { id, status, notes } => {
            db.ensure_initialized()?;
            let status = status.parse::<ListingStatus>()?;
            if db.set_listing_status(id, status, notes.as_deref())? {
                println!("Marked listing #{} as {}.", id, status);
            } else {
                println!("Listing #{} not found.", id);
            }
        }

        Commands::History { limit } => {
            db.ensure_initialized()?;
            let runs = db.list_run_summaries(limit)?;
            if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<20} {:<24} {:>8} {:>6} {:>6} {:>8}",
                    "RUN AT", "KEYWORD", "REPORTED", "NEW", "DUPES", "HIGHLY"
                );
                println!("{}", "-".repeat(77));
                for run in runs {
                    println!(
                        "{:<20} {:<24} {:>8} {:>6} {:>6} {:>8}",
                        truncate(&run.run_at, 19),
                        truncate(run.keyword.as_deref().unwrap_or("?"), 22),
                        run.total_reported,
                        run.listings_found,
                        run.skipped_duplicates,
                        run.highly_suitable
                    );
                }
            }
        }

        Commands::Resume | Commands::Stop | Commands::Status { .. } => {}
    }

    Ok(())
}

fn open_session(settings: &Settings, site: &Site, tags: &[FieldTag]) -> ScrapeResult<CrawlSession> {
    let fetch = &settings.fetch;
    let adapter: Box<dyn SiteAdapter> = match fetch.backend {
        Backend::Browser => {
            let source = BrowserSession::new(
                &fetch.webdriver_url,
                fetch.headless,
                &fetch.user_agent,
                fetch.page_load_timeout,
                fetch.settle,
            )
            .map_err(|e| ScrapeError::Configuration(format!("{:#}", e)))?;
            Box::new(
                SelectorAdapter::new(site, tags, source)?.with_debug_dir(settings.debug_dir.clone()),
            )
        }
        Backend::Http => {
            let source = HttpSource::new(&fetch.user_agent, fetch.page_load_timeout)
                .map_err(|e| ScrapeError::Configuration(format!("{:#}", e)))?;
            Box::new(
                SelectorAdapter::new(site, tags, source)?.with_debug_dir(settings.debug_dir.clone()),
            )
        }
    };
    let interrupt = InterruptHandler::new(
        Box::new(FileControl::new(&settings.control_dir)),
        settings.poll_interval,
        settings.resolution_timeout,
    );
    Ok(CrawlSession::new(
        adapter,
        interrupt,
        fetch.retry.clone(),
        fetch.pacing.clone(),
    ))
}

fn require_site(db: &Database, name: Option<&str>) -> Result<Site> {
    db.find_site(name)?.ok_or_else(|| match name {
        Some(n) => anyhow!("Site '{}' not found", n),
        None => anyhow!("No enabled site. Add one with: jobscout site add"),
    })
}

fn set_enabled(found: bool, what: &str, id: i64, enabled: bool) -> Result<()> {
    if !found {
        return Err(anyhow!("{} #{} not found", what, id));
    }
    println!(
        "{} #{} {}.",
        what,
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn print_status(settings: &Settings) {
    match progress::read_snapshot(&settings.progress_path) {
        Some(s) => {
            println!("Site:      {}", s.site);
            println!("State:     {:?}", s.state);
            println!("Phase:     {}", s.phase.label());
            println!("Keyword:   {} ({}/{})", s.keyword, s.keyword_index, s.total_keywords);
            println!("Processed: {}/{}", s.processed_count, s.total_listings);
            println!("Skipped:   {}", s.skipped_existing);
            println!(
                "Scores:    {} highly suitable, {} suitable, {} not suitable",
                s.highly_suitable, s.suitable, s.not_suitable
            );
            if s.total_deep > 0 {
                println!("Deep scan: {}/{}", s.deep_scanned, s.total_deep);
            }
            println!("Updated:   {}", s.updated_at);
        }
        None => println!("No run in progress or on record."),
    }
    if let Some(challenge) = FileControl::new(&settings.control_dir).suspended() {
        println!("\nSuspended on a verification challenge since {}:", challenge.detected_at);
        println!("  {}", challenge.url);
        println!("Solve it in the browser window, then run: jobscout resume");
    }
}

fn print_report(report: &RunReport) {
    if report.keywords.is_empty() {
        println!("No keywords crawled on {}.", report.site);
    } else {
        println!(
            "\n{:<24} {:>8} {:>6} {:>6} {:>6} {:>6}  {:<10}",
            "KEYWORD", "REPORTED", "NEW", "DUPES", "DEEP", "HIGHLY", "OUTCOME"
        );
        println!("{}", "-".repeat(80));
        for k in &report.keywords {
            let deep = k.deep_scan.as_ref().map(|d| d.enriched).unwrap_or(0);
            let outcome = match &k.outcome {
                KeywordOutcome::Completed if k.summary.ended_early => "partial".to_string(),
                KeywordOutcome::Completed => "done".to_string(),
                KeywordOutcome::Stopped => "stopped".to_string(),
                KeywordOutcome::Failed(reason) => format!("failed: {}", truncate(reason, 40)),
            };
            println!(
                "{:<24} {:>8} {:>6} {:>6} {:>6} {:>6}  {:<10}",
                truncate(&k.keyword, 22),
                k.summary.total_reported,
                k.summary.inserted,
                k.summary.skipped_duplicates,
                deep,
                k.highly_suitable,
                outcome
            );
        }
    }
    println!(
        "\nTotal: {} new, {} already known, {} keywords failed",
        report.inserted(),
        report.skipped(),
        report.failed()
    );
    if report.stopped {
        println!("Run stopped on request.");
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
