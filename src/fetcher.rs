use crate::config::{CrawlerConfig, RateLimit};
use crate::types::PageResponse;
use crate::FetchError;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};
use url::Url;

/// Longest `Retry-After` delay honored; longer requests are clamped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Decides how often and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, rate_limit: &RateLimit) -> Self {
        Self {
            max_retries,
            base_delay: rate_limit.backoff_base,
            max_delay: rate_limit.backoff_max,
        }
    }

    /// Delay before retry number `attempt + 1`: the server's `Retry-After`
    /// when given, else exponential backoff with jitter in `[0, base_delay)`.
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        if let FetchError::Http {
            retry_after: Some(after),
            ..
        } = error
        {
            return (*after).min(MAX_RETRY_AFTER);
        }

        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = self.base_delay.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..jitter_ms))
        };
        exp + jitter
    }

    /// Runs `op` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &err);
                    debug!("Attempt {} failed ({}), retrying in {:?}", attempt + 1, err, delay);
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Per-host politeness bookkeeping: the earliest instant each host may be
/// contacted again.
#[derive(Debug)]
pub struct HostLimiter {
    interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the next slot for `host` and returns when it starts.
    /// Concurrent callers for the same host get distinct, spaced slots.
    pub fn reserve(&self, host: &str) -> Instant {
        let now = Instant::now();
        let mut slots = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(host).copied().map_or(now, |next| next.max(now));
        slots.insert(host.to_string(), slot + self.interval);
        slot
    }

    /// Waits for this caller's turn on `host`.
    pub async fn wait_turn(&self, host: &str) {
        let slot = self.reserve(host);
        if slot > Instant::now() {
            sleep_until(slot).await;
        }
    }

    /// Pushes the next slot of `host` back by at least `delay` (e.g. after a 429).
    pub fn penalize(&self, host: &str, delay: Duration) {
        let until = Instant::now() + delay;
        let mut slots = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
        let entry = slots.entry(host.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }
}

/// The `Fetcher` issues HTTP GETs under a global concurrency cap and a
/// per-host minimum interval, retrying transient failures.
///
/// One `Fetcher` is shared by every stage of a run, so the cap bounds
/// discovery and extraction together.
pub struct Fetcher {
    /// The HTTP client used for making requests.
    client: Client,
    /// Global concurrency cap.
    permits: Arc<Semaphore>,
    hosts: HostLimiter,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(config: &CrawlerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.fetch_timeout)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            hosts: HostLimiter::new(config.rate_limit.per_host_interval),
            retry: RetryPolicy::new(config.retry_count, &config.rate_limit),
        })
    }

    /// Fetches `url`, retrying transient failures.
    pub async fn fetch(&self, url: &Url) -> Result<PageResponse, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_string();

        let result = self
            .retry
            .execute(|attempt| {
                let host = host.as_str();
                async move {
                    if attempt > 0 {
                        debug!("Retry {} for {}", attempt, url);
                    }
                    let outcome = self.attempt(url, host).await;
                    if let Err(FetchError::Http {
                        status: 429,
                        retry_after,
                    }) = &outcome
                    {
                        let delay = retry_after.unwrap_or(self.retry.base_delay);
                        self.hosts.penalize(host, delay);
                    }
                    outcome
                }
            })
            .await;

        if let Err(err) = &result {
            warn!("Fetching {} failed: {}", url, err);
        }
        result
    }

    /// A single attempt. The permit is held only for the duration of the request.
    async fn attempt(&self, url: &Url, host: &str) -> Result<PageResponse, FetchError> {
        self.hosts.wait_turn(host).await;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        debug!("Fetching {}", url);
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.8,*/*;q=0.7")
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                retry_after: parse_retry_after(response.headers()),
            });
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(PageResponse {
            url: final_url,
            status: status.as_u16(),
            content_type,
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// Reads `Retry-After` as delta-seconds or an HTTP-date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(retry_count: u32) -> CrawlerConfig {
        let mut config = CrawlerConfig::default();
        config.retry_count = retry_count;
        config.rate_limit.per_host_interval = Duration::ZERO;
        config.rate_limit.backoff_base = Duration::from_millis(1);
        config.rate_limit.backoff_max = Duration::from_millis(5);
        config
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, &fast_config(max_retries).rate_limit)
    }

    #[tokio::test]
    async fn test_retries_timeouts_exactly_retry_count_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Timeout) }
            })
            .await;

        assert_eq!(result.unwrap_err(), FetchError::Timeout);
        // first attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_never_retries_not_found() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::Http {
                        status: 404,
                        retry_after: None,
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Http { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let result = policy(2)
            .execute(|attempt| async move {
                if attempt == 0 {
                    Err(FetchError::Network("connection reset".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let first = policy.delay_for(0, &FetchError::Timeout);
        let third = policy.delay_for(2, &FetchError::Timeout);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(350) && third < Duration::from_millis(450));
    }

    #[test]
    fn test_retry_after_wins_over_backoff() {
        let error = FetchError::Http {
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy(3).delay_for(0, &error), Duration::from_secs(7));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_host_limiter_spaces_same_host() {
        let limiter = HostLimiter::new(Duration::from_millis(500));
        let a = limiter.reserve("shop.example.com");
        let b = limiter.reserve("shop.example.com");
        let other = limiter.reserve("other.example.com");

        assert_eq!(b - a, Duration::from_millis(500));
        // other hosts are not held back by shop.example.com
        assert!(other < b);

        limiter.penalize("other.example.com", Duration::from_secs(3));
        let after_penalty = limiter.reserve("other.example.com");
        assert!(after_penalty >= a + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_fetch_returns_page() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/item/1")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body><h1>Watch</h1></body></html>")
            .create_async()
            .await;

        let fetcher = Fetcher::new(&fast_config(2)).unwrap();
        let url = Url::parse(&format!("{}/item/1", server.url())).unwrap();
        let page = fetcher.fetch(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.body.contains("Watch"));
        assert_eq!(page.content_type.as_deref(), Some("text/html; charset=utf-8"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_404() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let fetcher = Fetcher::new(&fast_config(3)).unwrap();
        let url = Url::parse(&format!("{}/gone", server.url())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();

        assert!(matches!(err, FetchError::Http { status: 404, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let fetcher = Fetcher::new(&fast_config(2)).unwrap();
        let url = Url::parse(&format!("{}/flaky", server.url())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();

        assert!(matches!(err, FetchError::Http { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_honors_too_many_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/busy")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;

        let fetcher = Fetcher::new(&fast_config(1)).unwrap();
        let url = Url::parse(&format!("{}/busy", server.url())).unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();

        assert_eq!(
            err,
            FetchError::Http {
                status: 429,
                retry_after: Some(Duration::ZERO)
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_maps_silent_server_to_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let accepted = hits.clone();
        let server = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                // hold the connection open without ever answering
                open.push(socket);
            }
        });

        let mut config = fast_config(2);
        config.fetch_timeout = Duration::from_millis(200);
        let fetcher = Fetcher::new(&config).unwrap();
        let url = Url::parse(&format!("http://{addr}/slow")).unwrap();

        let err = fetcher.fetch(&url).await.unwrap_err();

        assert_eq!(err, FetchError::Timeout);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        server.abort();
    }
}
