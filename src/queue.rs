use crate::config::FetchConfig;
use crate::error::{ FetchError, FetchResult };
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::{ Duration, Instant };
use tokio::sync::Mutex;

/// Transport seam. Production wraps reqwest; tests substitute a mock.
#[async_trait]
pub trait TextFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> FetchResult<String>;
}

/// reqwest-backed fetcher. Non-success statuses count as failures.
pub struct HttpTextFetcher {
    client: Client,
}

impl HttpTextFetcher {
    pub fn new(timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TextFetcher for HttpTextFetcher {
    async fn fetch_text(&self, url: &str) -> FetchResult<String> {
        let response = self.client
            .get(url)
            .send().await
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Serializes all outbound dispatches behind a global minimum spacing and
/// retries failed downloads forever after a fixed cool-down.
///
/// The retry-forever policy (no cap, no backoff) is deliberate: callers
/// never see a network error, only an eventually-delivered body. Swapping
/// the policy means touching this type only.
pub struct FetchQueue {
    fetcher: Arc<dyn TextFetcher>,
    /// Shared last-dispatch timestamp; advanced on every attempt, success
    /// or failure, so retries respect spacing relative to unrelated keys.
    last_dispatch: Mutex<Option<Instant>>,
    spacing: Duration,
    retry_cooldown: Duration,
}

impl FetchQueue {
    pub fn new(config: &FetchConfig) -> FetchResult<Self> {
        let fetcher = HttpTextFetcher::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::with_fetcher(Arc::new(fetcher), config))
    }

    pub fn with_fetcher(fetcher: Arc<dyn TextFetcher>, config: &FetchConfig) -> Self {
        Self {
            fetcher,
            last_dispatch: Mutex::new(None),
            spacing: config.spacing(),
            retry_cooldown: config.retry_cooldown(),
        }
    }

    /// One rate-limited attempt. Used by the retry loop below; exposed for
    /// callers that want to handle failures themselves.
    pub async fn get_text(&self, url: &str) -> FetchResult<String> {
        self.wait_for_slot().await;
        log::debug!("Dispatching GET {}", url);
        self.fetcher.fetch_text(url).await
    }

    /// Fetch `url`, retrying after the cool-down until it succeeds. The
    /// cool-down sleep happens outside the dispatch lock so a failing url
    /// never blocks requests for other keys.
    pub async fn get_text_retrying(&self, url: &str) -> String {
        loop {
            match self.get_text(url).await {
                Ok(body) => {
                    return body;
                }
                Err(e) => {
                    log::warn!("Download failed ({}), retrying in {:?}", e, self.retry_cooldown);
                    tokio::time::sleep(self.retry_cooldown).await;
                }
            }
        }
    }

    /// Wait until at least `spacing` has passed since the last dispatch by
    /// any caller, then claim the slot. Holding the lock across the sleep
    /// queues concurrent dispatchers instead of releasing them in a herd.
    async fn wait_for_slot(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.spacing {
                tokio::time::sleep(self.spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
