use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use super::bucket::{wait_duration, BucketRegistry, RateLimitHeaders};
use super::error::{HttpError, Result};
use super::global::GlobalThrottle;
use super::route::Route;
use super::transport::{File, HttpRequest, HttpResponse, HttpTransport, RequestBody};
use crate::core::config::HttpConfig;

const REASON: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b' ')
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Optional parts of a request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub payload: Option<Value>,
    pub files: Vec<File>,
    pub params: Vec<(String, String)>,
    /// Audit log reason
    pub reason: Option<String>,
}

impl RequestOptions {
    pub fn json(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn body(&self) -> RequestBody {
        if !self.files.is_empty() {
            RequestBody::Multipart {
                payload_json: self.payload.clone(),
                files: self.files.clone(),
            }
        } else if let Some(payload) = &self.payload {
            RequestBody::Json(payload.clone())
        } else {
            RequestBody::Empty
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Issues HTTP requests against rate-limit buckets.
pub struct RequestDispatcher {
    transport: Arc<dyn HttpTransport>,
    config: HttpConfig,
    buckets: BucketRegistry,
    global: GlobalThrottle,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn HttpTransport>, config: HttpConfig) -> Self {
        let buckets = BucketRegistry::new(Duration::from_secs(config.bucket_idle_secs));
        let global = GlobalThrottle::new(
            config.global_budget,
            Duration::from_millis(config.global_window_ms),
        );
        Self {
            transport,
            config,
            buckets,
            global,
        }
    }

    pub fn buckets(&self) -> &BucketRegistry {
        &self.buckets
    }

    pub fn global(&self) -> &GlobalThrottle {
        &self.global
    }

    fn build_request(&self, route: &Route, url: &str, options: &RequestOptions) -> HttpRequest {
        let mut headers = vec![("User-Agent".to_string(), self.config.user_agent.clone())];
        if let Some(authorization) = self.config.authorization() {
            headers.push(("Authorization".to_string(), authorization));
        }
        if let Some(reason) = &options.reason {
            headers.push((
                "X-Audit-Log-Reason".to_string(),
                utf8_percent_encode(reason, REASON).to_string(),
            ));
        }

        HttpRequest {
            method: route.method().clone(),
            url: url.to_string(),
            headers,
            body: options.body(),
        }
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_secs(1 + u64::from(attempt) * 2)
    }

    /// Send one request, absorbing rate limits and transient failures for up to
    /// `max_attempts` attempts. Returns the decoded JSON body (`Null` when empty).
    pub async fn request(&self, route: &Route, options: RequestOptions) -> Result<Value> {
        let url = route.url(&self.config.base_url, &options.params)?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let retries_left = attempt + 1 < max_attempts;
            let bucket = self.buckets.resolve(route);
            let permit = bucket.acquire().await;
            self.global.wait().await;

            debug!(route = %route, attempt, "sending {}", url);
            let response = match self.transport.execute(self.build_request(route, &url, &options)).await {
                Ok(response) => response,
                Err(e) if e.is_retryable_transport() => {
                    drop(permit);
                    warn!(route = %route, attempt, "connection lost: {}", e);
                    if retries_left {
                        time::sleep(Self::backoff(attempt)).await;
                    }
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let headers = RateLimitHeaders::from_response(&response);
            let bucket = match &headers.bucket {
                Some(hash) => {
                    let shared = self.buckets.record_hash(route, hash, &bucket);
                    if !Arc::ptr_eq(&shared, &bucket) {
                        bucket.ingest_headers(&headers);
                    }
                    shared
                }
                None => bucket,
            };
            bucket.ingest_headers(&headers);

            if response.status == 429 {
                let body: RateLimitedBody = serde_json::from_str(&response.body).unwrap_or_default();
                let retry_after = body
                    .retry_after
                    .or_else(|| response.header("retry-after").and_then(|v| v.parse().ok()))
                    .unwrap_or(1.0);
                let global = body.global || headers.global;
                let delay = wait_duration(retry_after);

                if global {
                    self.global.lock_for(delay).await;
                    drop(permit);
                } else {
                    if let Err(e) = bucket.lock_for_duration(delay, false).await {
                        debug!("{}, waiting for the existing lock", e);
                    }
                    drop(permit);
                    if retries_left {
                        bucket.wait_unlocked().await;
                    }
                }
                info!(route = %route, global, "rate limited for {:.2}s", retry_after);

                last_error = Some(HttpError::RateLimited {
                    route: route.key(),
                    retry_after,
                    global,
                });
                continue;
            }

            if response.is_success() && headers.remaining == Some(0) {
                let reset_after = headers.reset_after.unwrap_or(bucket.reset_after());
                if let Err(e) = bucket.lock_for_duration(wait_duration(reset_after), false).await {
                    debug!("bucket exhausted but {}", e);
                }
            }
            drop(permit);

            if matches!(response.status, 500 | 502 | 504) {
                warn!(route = %route, attempt, "server error {}", response.status);
                last_error = Some(HttpError::from_response(response.status, route.key(), &response.body));
                if retries_left {
                    time::sleep(Self::backoff(attempt)).await;
                }
                continue;
            }

            if !response.is_success() {
                return Err(HttpError::from_response(response.status, route.key(), &response.body));
            }
            return decode_body(&response);
        }

        Err(last_error.unwrap_or_else(|| HttpError::InvalidRequest("no attempt made".to_string())))
    }

    pub async fn request_json<T: DeserializeOwned>(&self, route: &Route, options: RequestOptions) -> Result<T> {
        let value = self.request(route, options).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn decode_body(response: &HttpResponse) -> Result<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let is_json = response
        .header("content-type")
        .map_or(true, |content_type| content_type.starts_with("application/json"));
    if is_json {
        Ok(serde_json::from_str(&response.body)?)
    } else {
        Ok(Value::String(response.body.clone()))
    }
}
