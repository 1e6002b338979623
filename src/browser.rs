use anyhow::{Context, Result};
use std::time::Duration;
use thirtyfour::{ChromiumLikeCapabilities, DesiredCapabilities, WebDriver};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::adapter::{FetchedPage, PageSource};
use crate::error::{ScrapeError, ScrapeResult};

/// A Chrome window driven over WebDriver. Stays on screen unless headless,
/// so a human can clear verification challenges in it.
pub struct BrowserSession {
    runtime: Runtime,
    driver: Option<WebDriver>,
    settle: Duration,
}

impl BrowserSession {
    pub fn new(
        webdriver_url: &str,
        headless: bool,
        user_agent: &str,
        page_load_timeout: Duration,
        settle: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start browser runtime")?;

        let driver = runtime.block_on(async {
            let mut caps = DesiredCapabilities::chrome();
            if headless {
                caps.set_headless()?;
            }
            caps.add_arg(&format!("--user-agent={}", user_agent))?;
            caps.add_arg("--window-size=1280,900")?;
            let driver = WebDriver::new(webdriver_url, caps).await?;
            driver.set_page_load_timeout(page_load_timeout).await?;
            Ok::<_, thirtyfour::error::WebDriverError>(driver)
        })
        .with_context(|| {
            format!(
                "Failed to start Chrome through {}. Is chromedriver running?",
                webdriver_url
            )
        })?;

        info!("Browser session started via {}", webdriver_url);
        Ok(Self {
            runtime,
            driver: Some(driver),
            settle,
        })
    }
}

impl PageSource for BrowserSession {
    fn fetch_html(&mut self, url: &str) -> ScrapeResult<FetchedPage> {
        let Some(driver) = self.driver.as_ref() else {
            return Err(ScrapeError::fetch(url, "browser session already closed"));
        };
        debug!("Navigating to {}", url);
        let settle = self.settle;
        let html = self.runtime.block_on(async {
            driver.goto(url).await.map_err(|e| ScrapeError::fetch(url, e))?;
            // Client-side rendering needs a moment after load.
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            driver.source().await.map_err(|e| ScrapeError::fetch(url, e))
        })?;
        Ok(FetchedPage { html, status: None })
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = self.runtime.block_on(driver.quit()) {
                warn!("Failed to close browser: {}", e);
            }
        }
    }
}

/// Plain HTTP fetching for sites that render server-side.
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl PageSource for HttpSource {
    fn fetch_html(&mut self, url: &str) -> ScrapeResult<FetchedPage> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| ScrapeError::fetch(url, e))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            debug!("{} answered {}", url, status);
        }
        let html = response.text().map_err(|e| ScrapeError::fetch(url, e))?;
        Ok(FetchedPage {
            html,
            status: Some(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_source_reports_unreachable_host_as_fetch_error() {
        let mut source = HttpSource::new("jobscout-test", Duration::from_secs(2)).unwrap();
        let err = source.fetch_html("http://127.0.0.1:9/jobs").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_http_source_returns_body_of_error_status() {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let body = "<html><body>Please verify you are human</body></html>";
            let response = format!(
                "HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });

        let mut source = HttpSource::new("jobscout-test", Duration::from_secs(5)).unwrap();
        let page = source.fetch_html(&format!("http://{}/jobs", addr)).unwrap();
        server.join().unwrap();
        assert_eq!(page.status, Some(403));
        assert!(page.html.contains("verify you are human"));
    }

    #[test]
    #[ignore] // Needs chromedriver listening on localhost:9515
    fn test_browser_fetches_page_source() {
        let mut session = BrowserSession::new(
            "http://localhost:9515",
            true,
            crate::config::DEFAULT_USER_AGENT,
            Duration::from_secs(20),
            Duration::from_millis(100),
        )
        .expect("Failed to start browser");
        let page = session.fetch_html("https://example.com/").unwrap();
        assert!(page.html.contains("Example Domain"));
        assert!(page.status.is_none());
    }
}
