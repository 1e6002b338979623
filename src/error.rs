use thiserror::Error;

/// Failures the scrape pipeline distinguishes between.
///
/// Only `Fetch` is retried. `VerificationChallenge` suspends the run,
/// `Storage` ends it, everything else costs at most one keyword.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("could not parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("verification challenge at {url}")]
    VerificationChallenge { url: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("run stopped by operator")]
    Cancelled,
}

impl ScrapeError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        ScrapeError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        ScrapeError::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrapeError::Fetch { .. })
    }
}

pub type ScrapeResult<T> = std::result::Result<T, ScrapeError>;
