use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::codec::{Codec, JsonCodec};
use super::payload::{ConnectionProperties, Presence};
use crate::error::ClientError;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Gateway protocol version this library speaks.
pub const GATEWAY_VERSION: u8 = 6;

/// How a shard connects and identifies. Start from [`Default`] and chain the setters.
#[derive(Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub version: u8,
    pub codec: Arc<dyn Codec>,
    /// Ask for the whole connection to be one zlib stream.
    pub transport_compression: bool,
    /// The `compress` field of IDENTIFY (per-payload compression).
    pub payload_compression: bool,
    pub large_threshold: u64,
    /// `[index, count]`.
    pub shard: [u64; 2],
    pub presence: Presence,
    pub properties: ConnectionProperties,
    pub guild_subscriptions: bool,
    /// A reconnect waits a random delay in this range.
    pub reconnect_delay: (Duration, Duration),
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            version: GATEWAY_VERSION,
            codec: Arc::new(JsonCodec),
            transport_compression: true,
            payload_compression: false,
            large_threshold: 50,
            shard: [0, 1],
            presence: Presence::default(),
            properties: ConnectionProperties::default(),
            guild_subscriptions: true,
            reconnect_delay: (Duration::from_secs(10), Duration::from_secs(20)),
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("version", &self.version)
            .field("codec", &self.codec.name())
            .field("transport_compression", &self.transport_compression)
            .field("shard", &self.shard)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn transport_compression(mut self, enabled: bool) -> Self {
        self.transport_compression = enabled;
        self
    }

    pub fn payload_compression(mut self, enabled: bool) -> Self {
        self.payload_compression = enabled;
        self
    }

    pub fn large_threshold(mut self, threshold: u64) -> Self {
        self.large_threshold = threshold;
        self
    }

    pub fn shard(mut self, index: u64, count: u64) -> Self {
        self.shard = [index, count];
        self
    }

    pub fn presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }

    pub fn properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_delay = (min, max.max(min));
        self
    }

    /// `<url>?v=<version>&encoding=<codec>[&compress=zlib-stream]`
    pub fn gateway_url(&self) -> Result<Url, ClientError> {
        self.gateway_url_for(&self.url)
    }

    /// Same as [`gateway_url`](Self::gateway_url) but against another base, e.g. the one
    /// handed out by `GET /gateway`.
    pub fn gateway_url_for(&self, base: &str) -> Result<Url, ClientError> {
        let mut url = Url::parse(base)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("v", &self.version.to_string())
                .append_pair("encoding", self.codec.name());
            if self.transport_compression {
                query.append_pair("compress", "zlib-stream");
            }
        }
        Ok(url)
    }

    pub(crate) fn reconnect_backoff(&self) -> Duration {
        let (min, max) = self.reconnect_delay;
        min + (max - min).mul_f64(rand::random::<f64>())
    }
}
