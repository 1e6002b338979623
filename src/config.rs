use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::RunOptions;
use crate::session::{Pacing, RetryPolicy};

const PREFIX: &str = "JOBSCOUT_";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Browser,
    Http,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "browser" | "webdriver" | "chrome" => Ok(Backend::Browser),
            "http" | "reqwest" => Ok(Backend::Http),
            other => Err(anyhow!("Unknown backend '{}'. Use browser or http", other)),
        }
    }
}

/// How pages are fetched.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub backend: Backend,
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub page_load_timeout: Duration,
    pub settle: Duration,
    pub pacing: Pacing,
    pub retry: RetryPolicy,
}

/// Everything a run needs, from `JOBSCOUT_*` variables (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub progress_path: PathBuf,
    pub control_dir: PathBuf,
    pub site: Option<String>,
    pub run: RunOptions,
    pub fetch: FetchSettings,
    pub poll_interval: Duration,
    pub resolution_timeout: Option<Duration>,
    /// Where pages that fail to parse are saved. Off when unset.
    pub debug_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; keys are given without the prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(&format!("{}{}", PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = match get("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };

        let run = RunOptions {
            user_id: parse_or(&get, "USER_ID", crate::db::DEFAULT_USER_ID)?,
            deep_scan: parse_bool(&get, "DEEP_SCAN", true)?,
            threshold: parse_or(&get, "DEEP_SCAN_THRESHOLD", 4u8)?,
            deep_scan_limit: match parse_or(&get, "DEEP_SCAN_LIMIT", 50usize)? {
                0 => None,
                n => Some(n),
            },
            max_pages: parse_opt(&get, "MAX_PAGES")?,
            keyword_limit: parse_opt(&get, "KEYWORD_LIMIT")?,
        };
        if !(1..=5).contains(&run.threshold) {
            return Err(anyhow!(
                "{}DEEP_SCAN_THRESHOLD must be between 1 and 5, got {}",
                PREFIX,
                run.threshold
            ));
        }

        let fetch = FetchSettings {
            backend: parse_or(&get, "BACKEND", Backend::Browser)?,
            webdriver_url: get("WEBDRIVER_URL").unwrap_or_else(|| "http://localhost:9515".to_string()),
            headless: parse_bool(&get, "HEADLESS", false)?,
            user_agent: get("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            page_load_timeout: Duration::from_secs(parse_or(&get, "PAGE_LOAD_TIMEOUT_SECS", 25)?),
            settle: millis(&get, "SETTLE_MS", 150)?,
            pacing: Pacing {
                page_delay: millis(&get, "PAGE_DELAY_MS", 2000)?,
                detail_delay: millis(&get, "DETAIL_DELAY_MS", 2000)?,
            },
            retry: RetryPolicy {
                max_attempts: parse_or(&get, "FETCH_ATTEMPTS", 3u32)?.max(1),
                base_delay: millis(&get, "BACKOFF_MS", 1000)?,
                max_delay: millis(&get, "MAX_BACKOFF_MS", 15_000)?,
                jitter_ms: parse_or(&get, "JITTER_MS", 250)?,
            },
        };

        Ok(Self {
            db_path: get("DB").map(PathBuf::from).unwrap_or_else(|| data_dir.join("jobscout.db")),
            progress_path: get("PROGRESS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("scrape_progress.json")),
            control_dir: data_dir.join("control"),
            site: get("SITE"),
            run,
            fetch,
            poll_interval: millis(&get, "POLL_MS", 500)?,
            resolution_timeout: parse_opt::<u64>(&get, "RESOLUTION_TIMEOUT_SECS")?.map(Duration::from_secs),
            debug_dir: get("DEBUG_DIR").map(PathBuf::from),
        })
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobscout") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Invalid {}{}='{}'", PREFIX, name, raw)),
        None => Ok(None),
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(get, name)?.unwrap_or(default))
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    match get(name).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("Invalid {}{}='{}', expected true or false", PREFIX, name, v)),
        },
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parse_or(get, name, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("JOBSCOUT_{}", k), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[("DATA_DIR", "/tmp/js")]).unwrap();
        assert_eq!(s.db_path, PathBuf::from("/tmp/js/jobscout.db"));
        assert_eq!(s.progress_path, PathBuf::from("/tmp/js/scrape_progress.json"));
        assert_eq!(s.control_dir, PathBuf::from("/tmp/js/control"));
        assert_eq!(s.run.user_id, 1);
        assert!(s.run.deep_scan);
        assert_eq!(s.run.threshold, 4);
        assert_eq!(s.run.deep_scan_limit, Some(50));
        assert_eq!(s.run.max_pages, None);
        assert_eq!(s.fetch.backend, Backend::Browser);
        assert_eq!(s.fetch.webdriver_url, "http://localhost:9515");
        assert!(!s.fetch.headless);
        assert_eq!(s.fetch.pacing.page_delay, Duration::from_millis(2000));
        assert_eq!(s.fetch.retry.max_attempts, 3);
        assert_eq!(s.fetch.retry.max_delay, Duration::from_millis(15_000));
        assert_eq!(s.poll_interval, Duration::from_millis(500));
        assert!(s.resolution_timeout.is_none());
        assert!(s.debug_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("SITE", "seek"),
            ("DEEP_SCAN", "off"),
            ("DEEP_SCAN_THRESHOLD", "5"),
            ("DEEP_SCAN_LIMIT", "0"),
            ("MAX_PAGES", "3"),
            ("BACKEND", "HTTP"),
            ("HEADLESS", "yes"),
            ("RESOLUTION_TIMEOUT_SECS", "600"),
            ("DB", "/var/lib/jobs.db"),
            ("DEBUG_DIR", "/tmp/js/pages"),
        ])
        .unwrap();
        assert_eq!(s.site.as_deref(), Some("seek"));
        assert!(!s.run.deep_scan);
        assert_eq!(s.run.threshold, 5);
        assert_eq!(s.run.deep_scan_limit, None);
        assert_eq!(s.run.max_pages, Some(3));
        assert_eq!(s.fetch.backend, Backend::Http);
        assert!(s.fetch.headless);
        assert_eq!(s.resolution_timeout, Some(Duration::from_secs(600)));
        assert_eq!(s.db_path, PathBuf::from("/var/lib/jobs.db"));
        assert_eq!(s.debug_dir, Some(PathBuf::from("/tmp/js/pages")));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = settings(&[("PAGE_DELAY_MS", "soon")]).unwrap_err();
        assert!(format!("{:#}", err).contains("JOBSCOUT_PAGE_DELAY_MS"));

        let err = settings(&[("DEEP_SCAN_THRESHOLD", "9")]).unwrap_err();
        assert!(err.to_string().contains("between 1 and 5"));

        assert!(settings(&[("HEADLESS", "maybe")]).is_err());
        assert!(settings(&[("BACKEND", "carrier-pigeon")]).is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let s = settings(&[("SITE", "  "), ("MAX_PAGES", "")]).unwrap();
        assert!(s.site.is_none());
        assert!(s.run.max_pages.is_none());
    }
}
