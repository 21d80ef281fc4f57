use crate::config::{FeedConfig, RetryConfig};
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_HTTP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const MAX_FEED_BODY_BYTES: u64 = 8 * 1024 * 1024;

/// One item as the feed returns it. Unknown fields are ignored, missing
/// fields default to empty strings; validation happens downstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub author_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FeedPage {
    #[serde(default)]
    items: Vec<RawItem>,
    #[serde(default)]
    total: i64,
    #[serde(default)]
    page: i64,
}

pub(crate) fn build_http_agent(timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .user_agent(DEFAULT_HTTP_USER_AGENT);
    config.build().into()
}

pub struct FeedClient {
    agent: ureq::Agent,
    config: FeedConfig,
    retry: RetryConfig,
}

impl FeedClient {
    pub fn new(config: &FeedConfig, retry: &RetryConfig) -> Self {
        Self {
            agent: build_http_agent(config.timeout_secs),
            config: config.clone(),
            retry: retry.clone(),
        }
    }

    /// Single fetch of one feed page. Transport failures, HTTP >= 400 and
    /// malformed bodies all surface as `Err`; retrying is the caller's
    /// business (`fetch_with_retry`).
    pub fn fetch_page(&self, page: u32, size: u32) -> Result<Vec<RawItem>> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| VaultError::InvalidInput(format!("feed base URL: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            if !self.config.author_id.trim().is_empty() {
                pairs.append_pair("author_id", self.config.author_id.trim());
            }
            pairs.append_pair("page", &page.to_string());
            pairs.append_pair("size", &size.to_string());
        }

        debug!(%url, "requesting feed page");
        let mut response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| VaultError::Http(format!("feed request failed: {e}")))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(VaultError::Http(format!("feed returned http {status}")));
        }

        let mut body = String::new();
        response
            .body_mut()
            .as_reader()
            .take(MAX_FEED_BODY_BYTES)
            .read_to_string(&mut body)
            .map_err(|e| VaultError::Http(format!("failed reading feed body: {e}")))?;

        let parsed: FeedPage = serde_json::from_str(&body)?;
        debug!(
            total = parsed.total,
            page = parsed.page,
            items = parsed.items.len(),
            "feed page decoded"
        );

        let author_filter = self.config.author_id.trim();
        let items = parsed
            .items
            .into_iter()
            .filter(|item| {
                author_filter.is_empty()
                    || item.author_id.is_empty()
                    || item.author_id == author_filter
            })
            .collect();
        Ok(items)
    }

    /// Bounded retry loop around `fetch_page`. Attempt `n` (n >= 2) sleeps
    /// `base_delay * factor^(n-2)` first. Exhaustion yields an empty list:
    /// "no data", never an error past this boundary.
    pub fn fetch_with_retry(&self, page: u32, size: u32) -> Vec<RawItem> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff_delay(&self.retry, attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying feed fetch");
                std::thread::sleep(delay);
            }

            match self.fetch_page(page, size) {
                Ok(items) => {
                    if attempt > 1 {
                        info!(attempt, "feed fetch succeeded after retry");
                    }
                    return items;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "feed fetch attempt failed");
                }
            }
        }

        warn!(attempts, "feed fetch exhausted all attempts, returning no data");
        Vec::new()
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2) as i32;
    let factor = retry.backoff_factor.max(1.0).powi(exponent);
    let millis = (retry.base_delay_ms as f64 * factor).min(u64::MAX as f64);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let retry = RetryConfig {
            max_attempts: 4,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
        };
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&retry, 4), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_tolerates_degenerate_factor() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 0.0,
        };
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(500));
    }

    #[test]
    fn feed_page_decodes_with_missing_fields() {
        let body = r#"{"items":[{"id":"a1","description":"clip 0714 #x","url":"https://cdn/v.m3u8"},{"id":"a2"}],"total":2,"page":1}"#;
        let page: FeedPage = serde_json::from_str(body).expect("decode");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "a1");
        assert!(page.items[1].url.is_empty());
    }

    #[test]
    fn fetch_with_retry_returns_empty_on_unreachable_host() {
        let client = FeedClient::new(
            &FeedConfig {
                base_url: "http://127.0.0.1:1/feed".to_string(),
                author_id: String::new(),
                page_size: 10,
                timeout_secs: 1,
            },
            &RetryConfig {
                max_attempts: 2,
                base_delay_ms: 10,
                backoff_factor: 1.0,
            },
        );
        assert!(client.fetch_with_retry(1, 10).is_empty());
    }
}
