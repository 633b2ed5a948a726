//! Single attempt through one relay.
//!
//! The executor builds the relay URL for an authenticated target, performs
//! the request within its time budget and cancellation token, resolves the
//! relay's response shape, and feeds the outcome back into the stats store.
//! The admission slot is consumed by value and dropped on every exit path.

use crate::catalog::ProxyCatalog;
use crate::error::{FetchError, Result};
use crate::pool::SlotGuard;
use crate::stats::StatsStore;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Label used for unproxied requests.
pub const DIRECT: &str = "direct";

/// How the response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    #[default]
    Json,
    Text,
    Binary,
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(text) => serde_json::from_str(&text).ok(),
            Self::Binary(bytes) => serde_json::from_slice(&bytes).ok(),
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Json(value) => Some(value.to_string()),
            Self::Text(text) => Some(text),
            Self::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        }
    }
}

/// Where the payload sits in a relay response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// The body is the payload.
    Direct,
    /// `{"contents": <json>}`
    WrappedJson,
    /// `{"contents": "<json-encoded string>"}`
    WrappedJsonString,
}

impl ResponseShape {
    /// Resolves the shape from the relay's `wrap` flag and the parsed envelope.
    pub fn resolve(wrap: bool, envelope: &Value) -> Self {
        if !wrap {
            return Self::Direct;
        }
        match envelope.get("contents") {
            Some(Value::String(_)) => Self::WrappedJsonString,
            _ => Self::WrappedJson,
        }
    }
}

/// Raw HTTP response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

/// The network seam. Production uses [`ReqwestTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::network("http-client", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Failed(e.to_string())
            }
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_err)?;

        Ok(TransportResponse { status, body })
    }
}

/// Appends the timestamp and device-id query parameters, ahead of any
/// fragment.
pub fn authenticate(target: &str, device_id: &str, unix_secs: i64) -> String {
    let (base, fragment) = match target.find('#') {
        Some(i) => target.split_at(i),
        None => (target, ""),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{}{}t={}&did={}{}",
        base,
        separator,
        unix_secs,
        urlencoding::encode(device_id),
        fragment
    )
}

/// Interprets a response body according to mode and relay shape.
pub fn decode_body(proxy: &str, wrap: bool, mode: FetchMode, body: Bytes) -> Result<Payload> {
    if mode == FetchMode::Binary {
        if body.is_empty() {
            return Err(FetchError::parse(proxy, "empty body"));
        }
        return Ok(Payload::Binary(body));
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FetchError::parse(proxy, "empty body"));
    }

    if mode == FetchMode::Text && !wrap {
        return Ok(Payload::Text(String::from_utf8_lossy(&body).into_owned()));
    }

    let envelope: Value =
        serde_json::from_slice(&body).map_err(|e| FetchError::parse(proxy, e.to_string()))?;

    let shape = ResponseShape::resolve(wrap, &envelope);
    trace!(proxy = %proxy, shape = ?shape, "Resolved response shape");

    let payload = match (shape, mode) {
        (ResponseShape::Direct, _) => Payload::Json(envelope),
        (ResponseShape::WrappedJson, FetchMode::Text) => {
            Payload::Text(take_contents(proxy, envelope)?.to_string())
        }
        (ResponseShape::WrappedJson, _) => Payload::Json(take_contents(proxy, envelope)?),
        (ResponseShape::WrappedJsonString, FetchMode::Text) => match take_contents(proxy, envelope)? {
            Value::String(text) => Payload::Text(text),
            other => Payload::Text(other.to_string()),
        },
        (ResponseShape::WrappedJsonString, _) => match take_contents(proxy, envelope)? {
            Value::String(text) => Payload::Json(
                serde_json::from_str(&text)
                    .map_err(|e| FetchError::parse(proxy, format!("nested contents: {}", e)))?,
            ),
            other => Payload::Json(other),
        },
    };

    match &payload {
        Payload::Json(Value::Null) => Err(FetchError::parse(proxy, "null payload")),
        Payload::Text(text) if text.trim().is_empty() => {
            Err(FetchError::parse(proxy, "empty contents"))
        }
        _ => Ok(payload),
    }
}

fn take_contents(proxy: &str, mut envelope: Value) -> Result<Value> {
    match envelope.get_mut("contents").map(Value::take) {
        Some(Value::Null) | None => Err(FetchError::parse(proxy, "missing contents field")),
        Some(contents) => Ok(contents),
    }
}

/// Performs attempts and reports their outcome.
pub struct FetchExecutor {
    catalog: Arc<ProxyCatalog>,
    stats: Arc<StatsStore>,
    transport: Arc<dyn Transport>,
    device_id: String,
}

impl FetchExecutor {
    pub fn new(
        catalog: Arc<ProxyCatalog>,
        stats: Arc<StatsStore>,
        transport: Arc<dyn Transport>,
        device_id: String,
    ) -> Self {
        Self {
            catalog,
            stats,
            transport,
            device_id,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// One attempt through the proxy that owns `slot`.
    pub async fn attempt(
        &self,
        slot: SlotGuard,
        target: &str,
        mode: FetchMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Payload> {
        let proxy = self
            .catalog
            .get(slot.name())
            .cloned()
            .ok_or_else(|| FetchError::UnknownProxy(slot.name().to_string()))?;

        let authenticated = authenticate(
            target,
            &self.device_id,
            chrono::Utc::now().timestamp(),
        );
        let request_url = proxy.build_url(&authenticated);
        let started = Instant::now();

        let outcome = match self.send(&proxy.name, &request_url, timeout, cancel).await {
            Ok(response) => decode_body(&proxy.name, proxy.wrap, mode, response.body),
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => {
                debug!(proxy = %proxy.name, elapsed_ms = elapsed_ms, "Attempt succeeded");
                self.stats.record_result(&proxy.name, true, elapsed_ms);
            }
            Err(e) if e.counts_as_failure() => {
                debug!(
                    proxy = %proxy.name,
                    elapsed_ms = elapsed_ms,
                    network = e.is_network(),
                    error = %e,
                    "Attempt failed"
                );
                self.stats.record_result(&proxy.name, false, elapsed_ms);
            }
            Err(e) => {
                trace!(proxy = %proxy.name, error = %e, "Attempt abandoned");
            }
        }

        drop(slot);
        outcome
    }

    /// Unproxied fetch used by the direct probe. Not recorded in stats.
    pub async fn fetch_direct(
        &self,
        target: &str,
        mode: FetchMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Payload> {
        let response = self.send(DIRECT, target, timeout, cancel).await?;
        decode_body(DIRECT, false, mode, response.body)
    }

    async fn send(
        &self,
        proxy: &str,
        url: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse> {
        trace!(proxy = %proxy, url = %url, "Sending request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = tokio::time::timeout(timeout, self.transport.get(url, timeout)) => match result {
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    return Err(FetchError::Timeout {
                        proxy: proxy.to_string(),
                        after_ms: timeout.as_millis() as u64,
                    })
                }
                Ok(Err(TransportError::Failed(message))) => {
                    return Err(FetchError::network(proxy, message))
                }
                Ok(Ok(response)) => response,
            },
        };

        if !response.is_success() {
            return Err(FetchError::HttpStatus {
                proxy: proxy.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProxyDescriptor, Region, Tier, UrlTemplate};
    use crate::config::StatsConfig;
    use crate::pool::ConcurrencyPool;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    struct StaticTransport {
        status: u16,
        body: &'static str,
        delay: Duration,
        urls: Mutex<Vec<String>>,
    }

    impl StaticTransport {
        fn new(status: u16, body: &'static str) -> Self {
            Self {
                status,
                body,
                delay: Duration::ZERO,
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn get(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> std::result::Result<TransportResponse, TransportError> {
            self.urls.lock().unwrap().push(url.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse {
                status: self.status,
                body: Bytes::from_static(self.body.as_bytes()),
            })
        }
    }

    fn setup(
        wrap: bool,
        transport: StaticTransport,
    ) -> (FetchExecutor, ConcurrencyPool, Arc<StatsStore>, Arc<StaticTransport>) {
        let catalog = Arc::new(
            ProxyCatalog::new(vec![ProxyDescriptor {
                name: "relay".to_string(),
                url: UrlTemplate::parse("https://relay.example/get?url={url}").unwrap(),
                wrap,
                weight: 1,
                region: Region::Global,
                tier: Tier::Standard,
            }])
            .unwrap(),
        );
        let stats = Arc::new(StatsStore::load(
            Arc::new(MemoryStore::new()),
            StatsConfig::default(),
        ));
        let transport = Arc::new(transport);
        let executor = FetchExecutor::new(
            catalog,
            stats.clone(),
            transport.clone(),
            "device-1".to_string(),
        );
        (
            executor,
            ConcurrencyPool::new(1, Duration::from_secs(15)),
            stats,
            transport,
        )
    }

    #[test]
    fn test_authenticate() {
        assert_eq!(
            authenticate("https://api.site.tv/live", "abc", 1700000000),
            "https://api.site.tv/live?t=1700000000&did=abc"
        );
        assert_eq!(
            authenticate("https://api.site.tv/live?room=1", "abc", 1700000000),
            "https://api.site.tv/live?room=1&t=1700000000&did=abc"
        );
    }

    #[test]
    fn test_authenticate_keeps_fragment_last() {
        assert_eq!(
            authenticate("https://api.site.tv/live#player", "abc", 1700000000),
            "https://api.site.tv/live?t=1700000000&did=abc#player"
        );
        assert_eq!(
            authenticate("https://api.site.tv/live?room=1#a?b", "abc", 1700000000),
            "https://api.site.tv/live?room=1&t=1700000000&did=abc#a?b"
        );
    }

    #[test]
    fn test_decode_direct_json() {
        let payload =
            decode_body("p", false, FetchMode::Json, Bytes::from_static(b"{\"live\":true}")).unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"live": true})));
    }

    #[test]
    fn test_decode_wrapped_json() {
        let body = Bytes::from_static(b"{\"contents\":{\"live\":true},\"status\":{}}");
        let payload = decode_body("p", true, FetchMode::Json, body).unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"live": true})));
    }

    #[test]
    fn test_decode_wrapped_json_string() {
        let body = Bytes::from_static(b"{\"contents\":\"{\\\"viewers\\\":42}\"}");
        let envelope: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            ResponseShape::resolve(true, &envelope),
            ResponseShape::WrappedJsonString
        );

        let payload = decode_body("p", true, FetchMode::Json, body.clone()).unwrap();
        assert_eq!(payload, Payload::Json(serde_json::json!({"viewers": 42})));

        let text = decode_body("p", true, FetchMode::Text, body).unwrap();
        assert_eq!(text, Payload::Text("{\"viewers\":42}".to_string()));
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(
            decode_body("p", false, FetchMode::Json, Bytes::new()),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            decode_body("p", false, FetchMode::Json, Bytes::from_static(b"<html>")),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            decode_body("p", true, FetchMode::Json, Bytes::from_static(b"{\"status\":{}}")),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            decode_body("p", true, FetchMode::Json, Bytes::from_static(b"{\"contents\":\"not json\"}")),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            decode_body("p", false, FetchMode::Json, Bytes::from_static(b"null")),
            Err(FetchError::Parse { .. })
        ));
    }

    #[test]
    fn test_decode_whitespace_binary_body() {
        let body = Bytes::from_static(b" \n\n ");
        assert_eq!(
            decode_body("p", false, FetchMode::Binary, body.clone()).unwrap(),
            Payload::Binary(body)
        );
        assert!(matches!(
            decode_body("p", false, FetchMode::Binary, Bytes::new()),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            decode_body("p", false, FetchMode::Text, Bytes::from_static(b" \n")),
            Err(FetchError::Parse { .. })
        ));
    }

    #[test]
    fn test_decode_binary_and_text() {
        let raw = Bytes::from_static(b"\x89PNG");
        assert_eq!(
            decode_body("p", false, FetchMode::Binary, raw.clone()).unwrap(),
            Payload::Binary(raw)
        );
        assert_eq!(
            decode_body("p", false, FetchMode::Text, Bytes::from_static(b"hello")).unwrap(),
            Payload::Text("hello".to_string())
        );
    }

    #[tokio::test]
    async fn test_attempt_success_records_and_releases() {
        let (executor, pool, stats, transport) =
            setup(true, StaticTransport::new(200, "{\"contents\":{\"ok\":1}}"));
        let slot = pool.acquire("relay", &[]).await.unwrap();

        let payload = executor
            .attempt(
                slot,
                "https://api.site.tv/live",
                FetchMode::Json,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(payload, Payload::Json(serde_json::json!({"ok": 1})));
        assert_eq!(stats.get("relay").unwrap().success, 1);
        assert_eq!(pool.active("relay"), 0);

        let urls = transport.urls.lock().unwrap();
        assert!(urls[0].starts_with("https://relay.example/get?url=https%3A%2F%2Fapi.site.tv%2Flive%3Ft%3D"));
        assert!(urls[0].ends_with("%26did%3Ddevice-1"));
    }

    #[tokio::test]
    async fn test_attempt_http_status_failure() {
        let (executor, pool, stats, _) = setup(false, StaticTransport::new(503, "busy"));
        let slot = pool.acquire("relay", &[]).await.unwrap();

        let err = executor
            .attempt(
                slot,
                "https://api.site.tv/live",
                FetchMode::Json,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(stats.get("relay").unwrap().fail, 1);
        assert_eq!(pool.active("relay"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_records_failure() {
        let mut transport = StaticTransport::new(200, "{}");
        transport.delay = Duration::from_secs(60);
        let (executor, pool, stats, _) = setup(false, transport);
        let slot = pool.acquire("relay", &[]).await.unwrap();

        let err = executor
            .attempt(
                slot,
                "https://api.site.tv/live",
                FetchMode::Json,
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout { after_ms: 2000, .. }));
        assert_eq!(stats.get("relay").unwrap().fail, 1);
        assert_eq!(pool.active("relay"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cancellation_releases_without_recording() {
        let mut transport = StaticTransport::new(200, "{}");
        transport.delay = Duration::from_secs(60);
        let (executor, pool, stats, _) = setup(false, transport);
        let slot = pool.acquire("relay", &[]).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = executor
            .attempt(
                slot,
                "https://api.site.tv/live",
                FetchMode::Json,
                Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled));
        assert!(stats.get("relay").is_none());
        assert_eq!(pool.active("relay"), 0);
    }

    #[tokio::test]
    async fn test_fetch_direct_skips_relay_and_stats() {
        let (executor, _, stats, transport) = setup(false, StaticTransport::new(200, "{\"a\":1}"));

        let payload = executor
            .fetch_direct(
                "https://m.douyu.com/room",
                FetchMode::Json,
                Duration::from_secs(3),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(payload, Payload::Json(serde_json::json!({"a": 1})));
        assert_eq!(transport.urls.lock().unwrap()[0], "https://m.douyu.com/room");
        assert!(stats.get("relay").is_none());
    }
}
