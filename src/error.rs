//! Error types used across the library.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::http::routing::BucketKey;

/// The error type returned by pretty much everything in the library.
///
/// REST failures show up as one of the four status variants
/// ([`Unauthorized`](ClientError::Unauthorized), [`Forbidden`](ClientError::Forbidden),
/// [`NotFound`](ClientError::NotFound), [`RequestFailed`](ClientError::RequestFailed)), each
/// carrying an [`ApiError`]. Gateway drops are handled internally by reconnecting, so the only
/// gateway errors you see from [`Shard::start`](crate::gateway::Shard::start) are the ones that
/// can't be fixed by trying again.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Not for bad status codes like 403 or 404 -- those show up as their own variants.
    /// This is for transport-level stuff like DNS failures, TLS errors, timeouts, etc.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A gateway frame arrived but couldn't be turned into a payload. The session keeps running.
    #[error("failed to decode gateway payload ({} bytes): {source}", .raw.len())]
    Decode {
        raw: Vec<u8>,
        #[source]
        source: CodecError,
    },

    #[error("failed to encode gateway payload: {0}")]
    Encode(#[source] CodecError),

    #[error("Connection closed by server")]
    ConnectionClosed,

    /// READY reported a protocol version other than the one we connected with.
    #[error("gateway protocol version mismatch: expected {expected}, got {received}")]
    VersionMismatch { expected: u8, received: u64 },

    /// READY placed us on a different shard than the one we identified as.
    #[error("running on wrong shard: expected {expected:?}, got {received:?}")]
    ShardMismatch { expected: [u64; 2], received: Value },

    #[error("unauthorized: {0}")]
    Unauthorized(ApiError),

    #[error("forbidden: {0}")]
    Forbidden(ApiError),

    #[error("not found: {0}")]
    NotFound(ApiError),

    #[error("request failed: {0}")]
    RequestFailed(ApiError),

    #[error("route {route} is missing the `{name}` parameter")]
    MissingParameter { route: &'static str, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Errors after which reconnecting would only hit the same wall again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. } | Self::ShardMismatch { .. })
    }

    /// The API error behind a failed REST call, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Unauthorized(e)
            | Self::Forbidden(e)
            | Self::NotFound(e)
            | Self::RequestFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures of the wire codecs and the inflate step in front of them.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("zlib: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty frame")]
    Empty,
}

/// What the API told us when a request didn't succeed.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// Method and major-parameter route the request was rate limited under.
    pub bucket: BucketKey,
    pub status: u16,
    /// Platform error code (`50013` and friends), when the body had one.
    pub code: Option<u64>,
    pub message: String,
    /// Field path to joined messages, e.g. `"embed.fields.0.name" -> "This field is required"`.
    pub errors: BTreeMap<String, String>,
    pub data: Value,
}

impl ApiError {
    pub fn new(bucket: BucketKey, status: u16, data: Value) -> Self {
        let code = data.get("code").and_then(Value::as_u64);
        let message = match data.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => match &data {
                Value::String(text) if !text.is_empty() => text.clone(),
                _ => format!("HTTP {}", status),
            },
        };

        let mut errors = BTreeMap::new();
        if let Some(nested) = data.get("errors") {
            flatten_errors(nested, String::new(), &mut errors);
        }

        Self {
            bucket,
            status,
            code,
            message,
            errors,
            data,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} returned HTTP {}", self.bucket, self.status)?;
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        write!(f, ": {}", self.message)?;
        for (field, message) in &self.errors {
            write!(f, "\n  {}: {}", field, message)?;
        }
        Ok(())
    }
}

/// Walks the nested `errors` object the API attaches to form-body failures.
///
/// Every `_errors` array collapses into one entry keyed by the dotted path that led to it.
fn flatten_errors(value: &Value, path: String, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "_errors" {
                    let messages: Vec<&str> = child
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect();
                    out.insert(path.clone(), messages.join("; "));
                    continue;
                }

                let next = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten_errors(child, next, out);
            }
        }
        Value::String(message) => {
            out.insert(path, message.clone());
        }
        _ => {}
    }
}
