//! Rate-limited HTTP fetch core shared by every provider client.
//!
//! One fetcher per upstream provider: a token bucket sized to 90 % of the
//! provider's documented budget, one reused connection pool, and a retry
//! policy that only retries transport faults and server-advised rate limits.

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Provider-level failure kinds. Fully absorbed by the price service; never
/// surfaced to orchestrators.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Timeout,
    RateLimited { retry_after: Option<Duration> },
    NotFound,
    Auth,
    Parse(String),
    Transport(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "request deadline elapsed"),
            Self::RateLimited { retry_after } => match retry_after {
                Some(wait) => write!(f, "rate limited (retry after {:?})", wait),
                None => write!(f, "rate limited"),
            },
            Self::NotFound => write!(f, "not found"),
            Self::Auth => write!(f, "authentication rejected"),
            Self::Parse(msg) => write!(f, "response parse error: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }
}

/// Token bucket refilled continuously; sized to 90 % of the documented
/// per-minute budget so bursts never brush the provider's real limit.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(budget_per_minute: f64) -> Self {
        let effective = (budget_per_minute * 0.9).max(0.1);
        Self {
            capacity: effective.max(1.0),
            tokens: effective.max(1.0),
            refill_per_sec: effective / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available; zero if one can be taken now.
    fn wait_for_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// One queued, token-bucket-limited HTTP client for a single upstream.
/// Requests are serialized per provider over one persistent connection pool.
pub struct RateLimitedFetcher {
    provider: &'static str,
    client: Client,
    bucket: Mutex<TokenBucket>,
    serialize: Mutex<()>,
    timeout: Duration,
}

impl RateLimitedFetcher {
    pub fn new(provider: &'static str, budget_per_minute: f64, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent("callscope/0.1 (channel call tracker)")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            provider,
            client,
            bucket: Mutex::new(TokenBucket::new(budget_per_minute)),
            serialize: Mutex::new(()),
            timeout,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Wait for a rate-limit token, bounded by `deadline`.
    async fn acquire(&self, deadline: Instant) -> Result<(), ProviderError> {
        loop {
            let wait = self.bucket.lock().await.wait_for_token();
            if wait.is_zero() {
                return Ok(());
            }
            let now = Instant::now();
            if now + wait > deadline {
                return Err(ProviderError::Timeout);
            }
            debug!(provider = self.provider, wait_ms = wait.as_millis() as u64, "rate bucket empty, waiting");
            sleep(wait).await;
        }
    }

    /// GET `url` with `query`, decode the JSON body as `T`.
    ///
    /// Retries only `Transport` and `RateLimited` (honoring a server-advised
    /// wait), at most 3 times with exponential backoff and ±50 % jitter.
    /// `NotFound`, `Auth` and `Parse` are returned immediately.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        deadline: Instant,
    ) -> Result<T, ProviderError> {
        let _serialized = self.serialize.lock().await;
        let mut backoff = BACKOFF_BASE;

        for attempt in 0..=MAX_RETRIES {
            self.acquire(deadline).await?;

            match self.execute(url, query, headers, deadline).await {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && attempt < MAX_RETRIES => {
                    let wait = match &e {
                        ProviderError::RateLimited {
                            retry_after: Some(advised),
                        } => *advised,
                        _ => jittered(backoff),
                    };
                    if Instant::now() + wait > deadline {
                        return Err(ProviderError::Timeout);
                    }
                    warn!(
                        provider = self.provider,
                        attempt = attempt + 1,
                        error = %e,
                        backoff_ms = wait.as_millis() as u64,
                        "retrying provider request"
                    );
                    sleep(wait).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ProviderError::Transport(format!(
            "max retries exceeded for {}",
            url
        )))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
        deadline: Instant,
    ) -> Result<T, ProviderError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProviderError::Timeout);
        }

        let mut request = self
            .client
            .get(url)
            .query(query)
            .timeout(remaining.min(self.timeout));
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(ProviderError::Timeout),
            Err(e) => return Err(ProviderError::Transport(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            metrics::counter!("provider_requests_ok", 1, "provider" => self.provider);
            return response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()));
        }

        metrics::counter!("provider_requests_failed", 1, "provider" => self.provider);
        match status {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Auth),
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited {
                retry_after: parse_retry_after(&response),
            }),
            s if s.is_server_error() => {
                Err(ProviderError::Transport(format!("server error {}", s)))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transport(format!(
                    "unexpected status {}: {}",
                    s,
                    body.chars().take(200).collect::<String>()
                )))
            }
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..=1.5);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_sized_to_90_pct() {
        let bucket = TokenBucket::new(100.0);
        assert!((bucket.capacity - 90.0).abs() < 1e-9);
        assert!((bucket.refill_per_sec - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_drains_then_reports_wait() {
        let mut bucket = TokenBucket::new(60.0); // 54 effective, 0.9/s refill
        for _ in 0..54 {
            assert_eq!(bucket.wait_for_token(), Duration::ZERO);
        }
        let wait = bucket.wait_for_token();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(2));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Transport("boom".into()).retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.retryable());
        assert!(!ProviderError::NotFound.retryable());
        assert!(!ProviderError::Auth.retryable());
        assert!(!ProviderError::Parse("bad".into()).retryable());
        assert!(!ProviderError::Timeout.retryable());
    }

    #[test]
    fn test_jitter_stays_within_band() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(2));
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn test_acquire_respects_deadline() {
        let fetcher = RateLimitedFetcher::new("test", 60.0, Duration::from_secs(10));
        // Drain the bucket completely.
        {
            let mut bucket = fetcher.bucket.lock().await;
            bucket.tokens = 0.0;
            bucket.refill_per_sec = 1e-9;
        }
        let deadline = Instant::now() + Duration::from_millis(50);
        let res = fetcher.acquire(deadline).await;
        assert!(matches!(res, Err(ProviderError::Timeout)));
    }
}
