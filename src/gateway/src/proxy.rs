//! Proxy engine
//!
//! Buffered and streaming HTTP forwarding over one pooled client. Network-
//! layer failures (timeouts, connection errors) retry with exponential
//! backoff; upstream application responses, including 4xx and 5xx, are
//! relayed as-is.

use crate::error::{GatewayError, Result};
use lattice_shared::ProxyConfig;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request headers never forwarded upstream, and response headers never
/// relayed downstream.
const HOP_HEADERS: [&str; 6] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "upgrade",
    "proxy-connection",
];

const BACKOFF_CAP_SECS: u64 = 30;

/// HTTP forwarding engine shared by every plane.
pub struct ProxyEngine {
    http: reqwest::Client,
    config: ProxyConfig,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    /// Forward a buffered request and relay the upstream response. Retries
    /// timeouts and connection errors with `2^attempt` second backoff; any
    /// status the upstream actually returns is passed through.
    pub async fn forward(
        &self,
        service_name: &str,
        method: &Method,
        target_url: &str,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Response> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", target_url, q),
            _ => target_url.to_string(),
        };
        let out_method = convert_method(method)?;
        let out_headers = outbound_headers(headers)?;

        let mut last_error = GatewayError::upstream_error("no attempt made");
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff(attempt - 1);
                debug!(url = %url, attempt, delay_secs = delay.as_secs(), "retrying upstream request");
                tokio::time::sleep(delay).await;
            }

            let started = std::time::Instant::now();
            let request = self
                .http
                .request(out_method.clone(), &url)
                .headers(out_headers.clone())
                .body(body.clone())
                .timeout(Duration::from_secs(self.config.timeout_secs));

            match request.send().await {
                Ok(upstream) => {
                    info!(
                        method = %method,
                        url = %url,
                        status = upstream.status().as_u16(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "proxied request"
                    );
                    return relay(service_name, upstream).await;
                }
                Err(e) if e.is_timeout() => {
                    warn!(url = %url, attempt, "upstream request timed out");
                    last_error = GatewayError::upstream_timeout(format!(
                        "upstream timed out after {} attempt(s)",
                        attempt + 1
                    ));
                }
                Err(e) if e.is_connect() => {
                    warn!(url = %url, attempt, error = %e, "upstream connection failed");
                    last_error = GatewayError::upstream_error(format!(
                        "upstream unreachable after {} attempt(s)",
                        attempt + 1
                    ));
                }
                // Anything else is not a network-layer failure; don't retry.
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_error)
    }

    /// Forward a request and relay the upstream body unbuffered. No retries:
    /// once bytes may have flowed, a replay would corrupt the stream.
    pub async fn forward_streaming(
        &self,
        service_name: &str,
        method: &Method,
        target_url: &str,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Response> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}?{}", target_url, q),
            _ => target_url.to_string(),
        };

        let upstream = self
            .http
            .request(convert_method(method)?, &url)
            .headers(outbound_headers(headers)?)
            .body(body)
            .send()
            .await?;

        let status = convert_status(upstream.status());
        let mut response_headers = inbound_headers(upstream.headers())?;
        add_gateway_headers(&mut response_headers, service_name);

        let stream = upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(stream))
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    /// Gateway-originated call to another service: JSON in, decoded JSON
    /// out, or a `{content, status_code}` pair for non-JSON replies.
    pub async fn make_internal_request(
        &self,
        method: &str,
        url: &str,
        body: Option<serde_json::Value>,
        timeout_secs: Option<u64>,
    ) -> Result<serde_json::Value> {
        let out_method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| GatewayError::bad_request(format!("invalid method: {}", method)))?;

        let mut request = self
            .http
            .request(out_method, url)
            .timeout(Duration::from_secs(
                timeout_secs.unwrap_or(self.config.timeout_secs),
            ));
        if let Some(json) = body {
            request = request.json(&json);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let is_json = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

        if is_json {
            Ok(response.json().await?)
        } else {
            let content = response.text().await?;
            Ok(serde_json::json!({ "content": content, "status_code": status }))
        }
    }

    /// Short-timeout liveness probe: true iff the GET returns 200.
    pub async fn check_service_health(&self, health_url: &str) -> bool {
        match self
            .http
            .get(health_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %health_url, error = %e, "health check failed");
                false
            }
        }
    }

    /// Probe many URLs concurrently.
    pub async fn batch_health_check(&self, health_urls: &[String]) -> HashMap<String, bool> {
        let probes = health_urls.iter().map(|url| async move {
            (url.clone(), self.check_service_health(url).await)
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Join a base URL and path without doubling slashes.
    pub fn build_target_url(base: &str, path: &str) -> String {
        let base = base.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(5)).min(BACKOFF_CAP_SECS))
}

async fn relay(service_name: &str, upstream: reqwest::Response) -> Result<Response> {
    let status = convert_status(upstream.status());
    let mut headers = inbound_headers(upstream.headers())?;
    add_gateway_headers(&mut headers, service_name);
    let body = upstream.bytes().await?;

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(body))
        .map_err(|e| GatewayError::internal(e.to_string()))?;
    *response.headers_mut() = headers;
    Ok(response)
}

fn add_gateway_headers(headers: &mut HeaderMap, service_name: &str) {
    if let Ok(value) = HeaderValue::from_str(service_name) {
        headers.insert("X-Service-Name", value);
    }
    if let Ok(value) = HeaderValue::from_str(&Utc::now().to_rfc3339()) {
        headers.insert("X-Gateway-Timestamp", value);
    }
}

fn convert_method(method: &Method) -> Result<reqwest::Method> {
    reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| GatewayError::bad_request(format!("invalid method: {}", method)))
}

fn convert_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Downstream request headers → upstream, minus hop-by-hop headers.
fn outbound_headers(headers: &HeaderMap) -> Result<reqwest::header::HeaderMap> {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let out_name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|_| GatewayError::bad_request(format!("invalid header: {}", name)))?;
        let out_value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| GatewayError::bad_request(format!("invalid header value: {}", name)))?;
        out.insert(out_name, out_value);
    }
    Ok(out)
}

/// Upstream response headers → downstream, minus hop-by-hop headers.
fn inbound_headers(headers: &reqwest::header::HeaderMap) -> Result<HeaderMap> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let in_name = axum::http::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        let in_value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        out.insert(in_name, in_value);
    }
    Ok(out)
}
