use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{
    RateLimitConfig, HTTP_TIMEOUT_SECS, IP_BAN_SLEEP_SECS, MAX_THROTTLE_RETRIES,
    RETRY_AFTER_DEFAULT_SECS, USER_AGENT, WEIGHT_SLEEP_MARGIN_MS, WEIGHT_WINDOW_SECS,
};

// ── Error types ───────────────────────────────────────────────────────────────

/// Terminal outcome of a governed call. Callers treat every variant as
/// "data unavailable for this symbol / cycle".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("{path} failed after {attempts} attempts")]
    RequestFailed { path: String, attempts: u32 },
    #[error("{path} rejected with HTTP {status}: {body}")]
    Rejected { path: String, status: u16, body: String },
    #[error("{path} returned an unreadable body: {reason}")]
    Decode { path: String, reason: String },
}

/// Classification of a single failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// HTTP 429. Wait the server-advised time, then try again.
    Throttled { retry_after: Duration },
    /// HTTP 418, the exchange's IP ban signal.
    Banned,
    /// Timeout, connection error, HTTP 5xx.
    Transient(String),
    /// Anything that retrying cannot fix.
    Permanent(ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Timeout(String),
    Connection(String),
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "timeout: {msg}"),
            TransportError::Connection(msg) => write!(f, "connection error: {msg}"),
            TransportError::Other(msg) => write!(f, "request error: {msg}"),
        }
    }
}

/// Status, advised retry delay and raw body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub body: String,
}

/// Map one HTTP outcome onto the retry taxonomy.
pub fn classify(path: &str, resp: RawResponse) -> Result<String, Failure> {
    match resp.status {
        200..=299 => Ok(resp.body),
        429 => Err(Failure::Throttled {
            retry_after: Duration::from_secs(resp.retry_after.unwrap_or(RETRY_AFTER_DEFAULT_SECS)),
        }),
        418 => Err(Failure::Banned),
        500..=599 => Err(Failure::Transient(format!("HTTP {}", resp.status))),
        status => Err(Failure::Permanent(ApiError::Rejected {
            path: path.to_string(),
            status,
            body: resp.body.chars().take(200).collect(),
        })),
    }
}

// ── Retry wrapper ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Sleep after failed attempt `n` (1-based).
    pub backoff: fn(u32) -> Duration,
    pub ban_sleep: Duration,
    /// Cap on 429/418 retries for one call. They do not consume attempts.
    pub max_throttle_retries: u32,
}

pub fn exponential_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: crate::config::REQUEST_MAX_ATTEMPTS,
            backoff: exponential_backoff,
            ban_sleep: Duration::from_secs(IP_BAN_SLEEP_SECS),
            max_throttle_retries: MAX_THROTTLE_RETRIES,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget is spent.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, path: &str, operation: F) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;
    let mut throttled: u32 = 0;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(Failure::Permanent(e)) => return Err(e),
            Err(Failure::Throttled { retry_after }) => {
                throttled += 1;
                if throttled > policy.max_throttle_retries {
                    return Err(ApiError::RequestFailed { path: path.to_string(), attempts: attempt });
                }
                log::warn!("429 on {} — backing off {}s", path, retry_after.as_secs());
                tokio::time::sleep(retry_after).await;
            }
            Err(Failure::Banned) => {
                throttled += 1;
                if throttled > policy.max_throttle_retries {
                    return Err(ApiError::RequestFailed { path: path.to_string(), attempts: attempt });
                }
                log::error!("IP auto-banned on {} — sleeping {}s", path, policy.ban_sleep.as_secs());
                tokio::time::sleep(policy.ban_sleep).await;
            }
            Err(Failure::Transient(msg)) => {
                log::warn!("{} on {} (attempt {}/{})", msg, path, attempt, max_attempts);
                if attempt >= max_attempts {
                    return Err(ApiError::RequestFailed { path: path.to_string(), attempts: attempt });
                }
                tokio::time::sleep((policy.backoff)(attempt)).await;
                attempt += 1;
            }
        }
    }
}

// ── Weight ledger ─────────────────────────────────────────────────────────────

/// Sliding 60 s window of (timestamp, weight) entries.
pub struct WeightLedger {
    entries: Mutex<VecDeque<(Instant, u32)>>,
    ceiling: u32,
    window: Duration,
    margin: Duration,
}

impl WeightLedger {
    pub fn new(ceiling: u32) -> Self {
        WeightLedger {
            entries: Mutex::new(VecDeque::new()),
            ceiling,
            window: Duration::from_secs(WEIGHT_WINDOW_SECS),
            margin: Duration::from_millis(WEIGHT_SLEEP_MARGIN_MS),
        }
    }

    /// Blocks until `weight` fits under the ceiling, then records it.
    /// The lock is held through the sleep so every caller queues behind it.
    pub async fn admit(&self, weight: u32) {
        let mut entries = self.entries.lock().await;
        loop {
            let now = Instant::now();
            Self::evict(&mut entries, now, self.window);
            let used: u32 = entries.iter().map(|(_, w)| *w).sum();
            // an empty window admits anything, even a call heavier than the ceiling
            let Some(&(oldest, _)) = entries.front() else { break };
            if used + weight <= self.ceiling {
                break;
            }
            let wait = (self.window + self.margin).saturating_sub(now.duration_since(oldest));
            log::warn!(
                "Rate-limit headroom low ({}/{}) — sleeping {:.1}s",
                used, self.ceiling, wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
        }
        entries.push_back((Instant::now(), weight));
    }

    pub async fn used_weight(&self) -> u32 {
        let mut entries = self.entries.lock().await;
        Self::evict(&mut entries, Instant::now(), self.window);
        entries.iter().map(|(_, w)| *w).sum()
    }

    fn evict(entries: &mut VecDeque<(Instant, u32)>, now: Instant, window: Duration) {
        while let Some(&(ts, _)) = entries.front() {
            if now.duration_since(ts) > window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport against one base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpTransport { client, base_url: base_url.to_string(), api_key })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<RawResponse, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            req = req.header("X-MBX-APIKEY", key);
        }
        let resp = req.send().await.map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(RawResponse { status, retry_after, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

// ── Governor ──────────────────────────────────────────────────────────────────

/// Every exchange call goes through here: weight budget, pacing, retries.
pub struct RequestGovernor {
    transport: Box<dyn Transport>,
    ledger: WeightLedger,
    call_delay: Duration,
    policy: RetryPolicy,
}

impl RequestGovernor {
    pub fn new(transport: Box<dyn Transport>, cfg: &RateLimitConfig) -> Self {
        RequestGovernor {
            transport,
            ledger: WeightLedger::new(cfg.weight_ceiling),
            call_delay: Duration::from_millis(cfg.request_delay_ms),
            policy: RetryPolicy { max_attempts: cfg.max_attempts, ..RetryPolicy::default() },
        }
    }

    pub async fn execute(
        &self,
        path: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<serde_json::Value, ApiError> {
        with_retry(&self.policy, path, || self.attempt(path, params, weight)).await
    }

    pub async fn used_weight(&self) -> u32 {
        self.ledger.used_weight().await
    }

    async fn attempt(
        &self,
        path: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<serde_json::Value, Failure> {
        self.ledger.admit(weight).await;
        tokio::time::sleep(self.call_delay).await;

        let resp = match self.transport.get(path, params).await {
            Ok(r) => r,
            Err(e) => return Err(Failure::Transient(e.to_string())),
        };
        let body = classify(path, resp)?;
        serde_json::from_str(&body).map_err(|e| {
            Failure::Permanent(ApiError::Decode { path: path.to_string(), reason: e.to_string() })
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Replays scripted outcomes; once exhausted, keeps answering `fallback`.
    pub(crate) struct ScriptedTransport {
        script: StdMutex<VecDeque<Result<RawResponse, TransportError>>>,
        pub calls: AtomicU32,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: Vec<Result<RawResponse, TransportError>>) -> Self {
            ScriptedTransport { script: StdMutex::new(script.into()), calls: AtomicU32::new(0) }
        }
    }

    pub(crate) fn ok(body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse { status: 200, retry_after: None, body: body.to_string() })
    }

    fn status(code: u16, retry_after: Option<u64>) -> Result<RawResponse, TransportError> {
        Ok(RawResponse { status: code, retry_after, body: "{\"msg\":\"nope\"}".to_string() })
    }

    #[async_trait]
    impl Transport for std::sync::Arc<ScriptedTransport> {
        async fn get(&self, _path: &str, _params: &[(&str, String)]) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    fn governor(script: Vec<Result<RawResponse, TransportError>>) -> (RequestGovernor, std::sync::Arc<ScriptedTransport>) {
        let transport = std::sync::Arc::new(ScriptedTransport::new(script));
        let cfg = RateLimitConfig { weight_ceiling: 2000, request_delay_ms: 100, max_attempts: 3 };
        (RequestGovernor::new(Box::new(transport.clone()), &cfg), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_then_success_is_retried() {
        let (gov, transport) = governor(vec![status(503, None), ok("[1,2]")]);
        let start = Instant::now();
        let body = gov.execute("/x", &[], 1).await.unwrap();
        assert_eq!(body, serde_json::json!([1, 2]));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        // 2 × call delay + 2^1 s backoff
        assert!(start.elapsed() >= Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let (gov, transport) = governor(vec![status(400, None), ok("{}")]);
        let err = gov.execute("/fapi/v1/klines", &[], 1).await.unwrap_err();
        assert!(matches!(err, ApiError::Rejected { status: 400, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_budget() {
        let (gov, transport) = governor(vec![
            Err(TransportError::Timeout("t".into())),
            Err(TransportError::Connection("reset".into())),
            status(500, None),
            ok("{}"),
        ]);
        let err = gov.execute("/x", &[], 1).await.unwrap_err();
        assert_eq!(err, ApiError::RequestFailed { path: "/x".into(), attempts: 3 });
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_does_not_consume_attempts() {
        let (gov, transport) = governor(vec![
            status(429, Some(7)),
            status(418, None),
            status(429, None),
            Err(TransportError::Timeout("t".into())),
            ok("{\"ok\":true}"),
        ]);
        let start = Instant::now();
        let body = gov.execute("/x", &[], 1).await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        // 7 s + 120 s + 60 s + 2 s backoff
        assert!(start.elapsed() >= Duration::from_secs(189));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_cap_is_terminal() {
        let script = (0..20).map(|_| status(429, Some(1))).collect();
        let (gov, transport) = governor(script);
        let err = gov.execute("/x", &[], 1).await.unwrap_err();
        assert!(matches!(err, ApiError::RequestFailed { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), MAX_THROTTLE_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_is_decode_error() {
        let (gov, _) = governor(vec![ok("<html>")]);
        let err = gov.execute("/x", &[], 1).await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_blocks_until_oldest_entry_ages_out() {
        let ledger = WeightLedger::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            ledger.admit(1).await;
        }
        assert_eq!(ledger.used_weight().await, 5);
        assert!(start.elapsed() < Duration::from_secs(1));

        ledger.admit(1).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(60_500));
        assert!(waited < Duration::from_secs(62));
        // the first five aged out during the sleep
        assert_eq!(ledger.used_weight().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_waits_for_as_many_entries_as_needed() {
        let ledger = WeightLedger::new(10);
        let start = Instant::now();
        ledger.admit(1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        ledger.admit(9).await;

        // evicting the weight-1 entry alone leaves 9 + 5 over the ceiling
        ledger.admit(5).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90_500));
        assert!(waited < Duration::from_secs(92));
        assert_eq!(ledger.used_weight().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_never_exceeds_ceiling_under_mixed_weights() {
        let ledger = WeightLedger::new(10);
        for w in [3, 7, 2, 9, 1, 6, 10, 4] {
            ledger.admit(w).await;
            assert!(ledger.used_weight().await <= 10);
            tokio::time::sleep(Duration::from_secs(7)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_forgets_entries_older_than_window() {
        let ledger = WeightLedger::new(10);
        ledger.admit(4).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        ledger.admit(3).await;
        assert_eq!(ledger.used_weight().await, 7);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ledger.used_weight().await, 3);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(exponential_backoff(1), Duration::from_secs(2));
        assert_eq!(exponential_backoff(2), Duration::from_secs(4));
        assert_eq!(exponential_backoff(3), Duration::from_secs(8));
    }
}
