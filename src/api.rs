//! HTTP client for the remote order store.
//!
//! Speaks a small JSON REST surface under `{base}/api/orders`. All failures
//! surface as [`SyncError::Transport`]; 4xx responses other than 408/429 are
//! marked non-retryable, the engine still treats them uniformly.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{Order, OrderStatus, RemoteOrderBody};
use crate::remote::RemoteStore;

/// Timeout used for the lightweight connectivity probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const API_KEY_HEADER: &str = "X-POS-API-Key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - ensure a scheme is present (https, or http for loopback hosts)
/// - accept only http and https
/// - drop any query string or fragment
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_base_url(raw: &str) -> SyncResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::Config("remote URL is empty".into()));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else if is_loopback(raw) {
        format!("http://{raw}")
    } else {
        format!("https://{raw}")
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| SyncError::Config(format!("invalid remote URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::Config(format!(
            "unsupported scheme {:?} in remote URL",
            url.scheme()
        )));
    }
    url.set_query(None);
    url.set_fragment(None);

    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/api").unwrap_or(path).trim_end_matches('/').to_string();
    url.set_path(&path);

    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn is_loopback(host: &str) -> bool {
    ["localhost", "127.0.0.1", "[::1]"]
        .iter()
        .any(|prefix| host.starts_with(prefix))
}

/// Percent-encode an id for use as a single path segment.
fn encode_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::transport(format!("Cannot reach remote store at {url}"));
    }
    if err.is_timeout() {
        return SyncError::transport(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::transport_fatal(format!("Invalid remote store URL: {url}"));
    }
    SyncError::transport(format!("Network error communicating with {url}: {err}"))
}

fn status_error(status: StatusCode, body: &str) -> SyncError {
    let code = status.as_u16();
    let summary = match code {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Remote order not found".to_string(),
        s if s >= 500 => format!("Remote store server error (HTTP {s})"),
        s => format!("Unexpected response from remote store (HTTP {s})"),
    };
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| Some(body.trim().to_string()).filter(|s| !s.is_empty()));
    let message = match detail {
        Some(detail) => format!("{summary}: {detail}"),
        None => summary,
    };

    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        SyncError::transport(message)
    } else {
        SyncError::transport_fatal(message)
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    id: String,
}

/// The remote list endpoint returns either an array of orders or an object
/// keyed by order id.
fn parse_snapshot(body: Value) -> SyncResult<Vec<Order>> {
    let values: Vec<Value> = match body {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(key, mut value)| {
                if let Value::Object(ref mut fields) = value {
                    fields.entry("id").or_insert_with(|| Value::String(key));
                }
                value
            })
            .collect(),
        other => {
            return Err(SyncError::transport_fatal(format!(
                "Unexpected order list payload: {other}"
            )))
        }
    };

    let mut orders = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<Order>(value) {
            Ok(order) => orders.push(order),
            Err(e) => warn!("Skipping malformed remote order: {e}"),
        }
    }
    Ok(orders)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`RemoteStore`] backed by the remote REST API.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn orders_url(&self) -> String {
        format!("{}/api/orders", self.base_url)
    }

    fn order_url(&self, id: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, encode_segment(id))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    /// Send a request and return the JSON body (`Null` for empty bodies).
    async fn send(&self, req: RequestBuilder) -> SyncResult<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            SyncError::transport_fatal(format!("Invalid JSON from remote store: {e}"))
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create_order(&self, order: &Order) -> SyncResult<String> {
        let body = RemoteOrderBody::from(order);
        let req = self.request(Method::POST, &self.orders_url()).json(&body);
        let created: CreatedOrder = serde_json::from_value(self.send(req).await?).map_err(|e| {
            SyncError::transport_fatal(format!("Create response missing order id: {e}"))
        })?;
        debug!(local_id = %order.id, remote_id = %created.id, "Remote create acknowledged");
        Ok(created.id)
    }

    async fn upsert_order(&self, order: &Order) -> SyncResult<()> {
        let req = self.request(Method::PUT, &self.order_url(&order.id)).json(order);
        self.send(req).await?;
        Ok(())
    }

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> SyncResult<()> {
        let req = self
            .request(Method::PATCH, &self.order_url(id))
            .json(&serde_json::json!({
                "status": status,
                "updatedAt": Utc::now().to_rfc3339(),
            }));
        self.send(req).await?;
        Ok(())
    }

    async fn delete_order(&self, id: &str) -> SyncResult<()> {
        let req = self.request(Method::DELETE, &self.order_url(id));
        self.send(req).await?;
        Ok(())
    }

    async fn fetch_orders(&self) -> SyncResult<Vec<Order>> {
        let req = self.request(Method::GET, &self.orders_url());
        parse_snapshot(self.send(req).await?)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self
            .request(Method::HEAD, &url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {e}");
                false
            }
        }
    }
}
