//! The REST side: every call goes through [`Http::request`], which handles rate limits,
//! retries and status codes.

pub mod endpoints;
pub mod ratelimit;
pub mod routing;

use std::time::Duration;

use log::{debug, warn};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT,
};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{ApiError, ClientError};
use ratelimit::{BucketStore, RateLimiter};
use routing::{BucketKey, Route};

pub const API_VERSION: u8 = 7;
pub const DEFAULT_API_URL: &str = "https://discordapp.com/api/v7";

/// How many times a 429 or 5xx is retried before giving up.
pub const MAX_RETRIES: u32 = 5;

const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// One REST call: the route, what goes into its placeholders, and what goes along with it.
#[derive(Debug, Clone)]
pub struct Request {
    route: Route,
    params: Vec<(&'static str, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    headers: HeaderMap,
    reason: Option<String>,
}

impl Request {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            params: Vec::new(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
            reason: None,
        }
    }

    pub fn param(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ClientError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Shows up in the guild's audit log next to the action.
    pub fn reason(mut self, reason: Option<impl Into<String>>) -> Self {
        self.reason = reason.map(Into::into);
        self
    }

    pub fn route(&self) -> Route {
        self.route
    }
}

/// What classifying a response decided.
enum Outcome {
    Success(Value),
    Retry(Value),
    Fatal(ClientError),
}

pub struct Http {
    client: reqwest::Client,
    pub base_url: String,
    token: String,
    rate_limiter: RateLimiter,
    max_retries: u32,
    retry_backoff: (Duration, Duration),
}

impl Http {
    pub fn new(token: &str, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            rate_limiter: RateLimiter::default(),
            max_retries: MAX_RETRIES,
            retry_backoff: (Duration::from_secs(1), Duration::from_secs(5)),
        }
    }

    /// Swaps in a different place to keep rate limit buckets.
    pub fn with_bucket_store(mut self, store: impl BucketStore + 'static) -> Self {
        self.rate_limiter = RateLimiter::new(store);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Random pause range before retrying a 429 or 5xx, on top of any rate limit cooldown.
    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff = (min, max.max(min));
        self
    }

    pub fn get_token(&self) -> &str {
        &self.token
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Performs a request and returns the parsed body.
    ///
    /// Empty bodies come back as `Value::Null`, non-JSON bodies as `Value::String`. Error bodies
    /// that claim to be JSON but don't parse are kept as text too, so they can still be retried
    /// or reported with their status.
    pub async fn request(&self, request: Request) -> Result<Value, ClientError> {
        let (path, bucket) = request.route.compile(&request.params)?;
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        debug!("Performing request to bucket {}", bucket);

        let mut retries = 0;
        loop {
            self.rate_limiter.acquire(&bucket).await;

            let response = self.build(&request, &url)?.send().await?;
            let status = response.status();
            self.rate_limiter.update_bucket(&bucket, response.headers()).await;
            let data = parse_body(response).await?;

            match classify(&bucket, status, data) {
                Outcome::Success(data) => {
                    debug!("Success, {} has received {}", bucket, data);
                    return Ok(data);
                }
                Outcome::Fatal(err) => return Err(err),
                Outcome::Retry(data) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(ClientError::RequestFailed(ApiError::new(
                            bucket,
                            status.as_u16(),
                            data,
                        )));
                    }

                    let delay = self.backoff();
                    warn!(
                        "Request to {} failed with {}, retry {}/{} in {:?}",
                        bucket, status, retries, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Like [`request`](Self::request), deserializing the body into `T`.
    pub async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T, ClientError> {
        let data = self.request(request).await?;
        Ok(serde_json::from_value(data)?)
    }

    fn build(&self, request: &Request, url: &Url) -> Result<reqwest::RequestBuilder, ClientError> {
        let auth = HeaderValue::from_str(&format!("Bot {}", self.token))
            .map_err(|_| ClientError::InvalidArgument("token is not a valid header value".into()))?;

        let mut builder = self
            .client
            .request(request.route.method.into(), url.clone())
            .header(AUTHORIZATION, auth)
            .header(USER_AGENT, user_agent())
            .headers(request.headers.clone());

        if let Some(reason) = &request.reason {
            let encoded = urlencoding::encode(reason);
            let value = HeaderValue::from_str(&encoded)
                .map_err(|_| ClientError::InvalidArgument("unusable audit log reason".into()))?;
            builder = builder.header(AUDIT_LOG_REASON, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        Ok(builder)
    }

    fn backoff(&self) -> Duration {
        let (min, max) = self.retry_backoff;
        min + (max - min).mul_f64(rand::random::<f64>())
    }
}

fn user_agent() -> String {
    format!(
        "DiscordBot ({}, v{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

async fn parse_body(response: Response) -> Result<Value, ClientError> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    let text = || Value::String(String::from_utf8_lossy(&bytes).into_owned());
    if !is_json {
        return Ok(text());
    }
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(e) if status.is_success() => Err(e.into()),
        Err(e) => {
            debug!("{status} body is not valid JSON: {e}");
            Ok(text())
        }
    }
}

/// 2xx succeeds, 429 and 5xx are worth another try, anything else is final.
fn classify(bucket: &BucketKey, status: StatusCode, data: Value) -> Outcome {
    if status.is_success() {
        return Outcome::Success(data);
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Outcome::Retry(data);
    }

    let error = ApiError::new(bucket.clone(), status.as_u16(), data);
    Outcome::Fatal(match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized(error),
        StatusCode::FORBIDDEN => ClientError::Forbidden(error),
        StatusCode::NOT_FOUND => ClientError::NotFound(error),
        _ => ClientError::RequestFailed(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use routing::Method;
    use serde_json::json;

    fn bucket() -> BucketKey {
        BucketKey::new(Method::Get, "/channels/1")
    }

    #[test]
    fn success_returns_body() {
        let outcome = classify(&bucket(), StatusCode::OK, json!({"id": "1"}));
        assert!(matches!(outcome, Outcome::Success(ref v) if v["id"] == "1"));

        let outcome = classify(&bucket(), StatusCode::NO_CONTENT, Value::Null);
        assert!(matches!(outcome, Outcome::Success(Value::Null)));
    }

    #[test]
    fn client_errors_map_to_typed_variants() {
        let cases = [
            (StatusCode::UNAUTHORIZED, "Unauthorized"),
            (StatusCode::FORBIDDEN, "Forbidden"),
            (StatusCode::NOT_FOUND, "NotFound"),
            (StatusCode::BAD_REQUEST, "RequestFailed"),
            (StatusCode::CONFLICT, "RequestFailed"),
        ];

        for (status, expected) in cases {
            let Outcome::Fatal(err) = classify(&bucket(), status, json!({"message": "x"})) else {
                panic!("{} should be fatal", status);
            };
            let name = match err {
                ClientError::Unauthorized(_) => "Unauthorized",
                ClientError::Forbidden(_) => "Forbidden",
                ClientError::NotFound(_) => "NotFound",
                ClientError::RequestFailed(_) => "RequestFailed",
                _ => "other",
            };
            assert_eq!(name, expected, "status {}", status);
            assert_eq!(err.api_error().map(|e| e.status), Some(status.as_u16()));
        }
    }

    #[test]
    fn throttles_and_server_errors_retry() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(
                classify(&bucket(), status, Value::Null),
                Outcome::Retry(_)
            ));
        }
    }

    #[test]
    fn backoff_stays_in_range() {
        let http = Http::new("t", DEFAULT_API_URL.into())
            .with_retry_backoff(Duration::from_millis(100), Duration::from_millis(200));
        for _ in 0..50 {
            let delay = http.backoff();
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let http = Http::new("t", "http://localhost:1234/api/".into());
        assert_eq!(http.base_url, "http://localhost:1234/api");
    }
}
