//! Throttling and retries for metadata provider requests
//!
//! Every provider call goes through a token bucket so a large scan cannot exhaust the
//! provider's request allowance, and transient failures get a few spaced-out retries
//! before the item is deferred to a later run.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

/// Request allowance of one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    /// Requests allowed per `period`
    pub requests: u32,
    pub period: Duration,
    /// Requests that may go out back to back before throttling starts
    pub burst: u32,
}

impl Throttle {
    /// TMDB allows about 40 requests every 10 seconds
    pub const TMDB: Throttle = Throttle {
        requests: 40,
        period: Duration::from_secs(10),
        burst: 10,
    };

    fn quota(&self) -> Quota {
        let requests = NonZeroU32::new(self.requests).unwrap_or(NonZeroU32::MIN);
        let interval = self.period / requests.get();
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(requests))
            .allow_burst(burst)
    }
}

/// HTTP client that waits for a token before each request
pub struct RateLimitedClient {
    client: Client,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    provider: &'static str,
}

impl RateLimitedClient {
    pub fn new(
        provider: &'static str,
        throttle: Throttle,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            limiter: RateLimiter::direct(throttle.quota()),
            provider,
        })
    }

    pub async fn get<Q: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        query: &Q,
    ) -> reqwest::Result<Response> {
        self.limiter.until_ready().await;
        debug!(provider = self.provider, url = %url, "Provider request");
        self.client.get(url).query(query).send().await
    }
}

/// How a provider response status should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Unauthorized,
    /// 429; back off and try again
    RateLimited,
    /// 408 and 5xx; the provider may recover on its own
    Transient,
    /// Any other client error; retrying will not help
    Rejected,
}

impl StatusClass {
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=299 => StatusClass::Success,
            401 | 403 => StatusClass::Unauthorized,
            404 => StatusClass::NotFound,
            429 => StatusClass::RateLimited,
            408 | 500..=599 => StatusClass::Transient,
            _ => StatusClass::Rejected,
        }
    }
}

/// Errors that know whether another attempt could help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential backoff for provider calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            multiplier: 2.0,
            randomization_factor: 0.2,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `operation` until it succeeds, fails for good, or the attempts run out
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let delay = match backoff.next_backoff() {
                Some(delay) if attempt < self.attempts => delay,
                _ => {
                    warn!(operation = %operation_name, attempts = attempt, error = %err, "Giving up after retries");
                    return Err(err);
                }
            };

            debug!(
                operation = %operation_name,
                attempt,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Retrying provider call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky {
        retryable: bool,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.retryable)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(StatusClass::of(StatusCode::OK), StatusClass::Success);
        assert_eq!(StatusClass::of(StatusCode::NOT_FOUND), StatusClass::NotFound);
        assert_eq!(StatusClass::of(StatusCode::UNAUTHORIZED), StatusClass::Unauthorized);
        assert_eq!(StatusClass::of(StatusCode::TOO_MANY_REQUESTS), StatusClass::RateLimited);
        assert_eq!(StatusClass::of(StatusCode::BAD_GATEWAY), StatusClass::Transient);
        assert_eq!(StatusClass::of(StatusCode::REQUEST_TIMEOUT), StatusClass::Transient);
        assert_eq!(StatusClass::of(StatusCode::UNPROCESSABLE_ENTITY), StatusClass::Rejected);
    }

    #[test]
    fn test_tmdb_throttle_builds_quota() {
        let quota = Throttle::TMDB.quota();
        assert_eq!(quota.burst_size().get(), 10);
        assert_eq!(quota.replenish_interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = quick()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky { retryable: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = quick()
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky { retryable: false }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let result = quick()
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Flaky { retryable: true })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }
}
