use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::emitter::{Emitter, Listener, Priority};
use crate::error::ClientError;
use crate::event::EventHandler;
use crate::gateway::{GatewayConfig, Shard, WeakShard};
use crate::http::{Http, DEFAULT_API_URL};

/// Handed to every [`EventHandler`] callback.
#[derive(Clone)]
pub struct Context {
    pub http: Arc<Http>,
    pub shard: Shard,
}

pub struct ClientBuilder {
    token: String,
    api_url: String,
    gateway: GatewayConfig,
    handler: Option<Arc<dyn EventHandler>>,
}

impl ClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            gateway: GatewayConfig::default(),
            handler: None,
        }
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn gateway_config(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    pub fn event_handler<H: EventHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Client {
        let http = Arc::new(Http::new(&self.token, self.api_url));
        let shard = Shard::new(self.token, self.gateway);

        if let Some(handler) = self.handler {
            let bridge: Arc<dyn Listener> = Arc::new(HandlerBridge {
                handler,
                http: http.clone(),
                shard: shard.downgrade(),
            });
            for event in HandlerBridge::EVENTS {
                shard
                    .emitter()
                    .add_shared(event, bridge.clone(), Priority::Normal);
            }
        }

        Client { http, shard }
    }
}

/// A REST client plus one gateway session sharing the same token.
#[derive(Clone)]
pub struct Client {
    http: Arc<Http>,
    shard: Shard,
}

impl Client {
    pub fn builder(token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// For events without a typed [`EventHandler`] callback.
    pub fn emitter(&self) -> &Arc<Emitter> {
        self.shard.emitter()
    }

    /// Looks up the gateway URL over REST and runs the session until it's closed.
    pub async fn start(&self) -> Result<(), ClientError> {
        // Another crate may have picked a provider already; either one is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let url = self.http.get_gateway().await?;
        log::debug!("gateway url is {url}");
        self.shard.set_gateway_url(url);
        self.shard.start().await
    }

    pub fn close(&self) {
        self.shard.close();
    }
}

struct HandlerBridge {
    handler: Arc<dyn EventHandler>,
    http: Arc<Http>,
    shard: WeakShard,
}

impl HandlerBridge {
    const EVENTS: [&'static str; 4] = ["READY", "RESUMED", "MESSAGE_CREATE", "GUILD_CREATE"];
}

#[async_trait]
impl Listener for HandlerBridge {
    async fn call(&self, event: &str, data: &Value) {
        let Some(shard) = self.shard.upgrade() else {
            return;
        };
        let ctx = Context {
            http: self.http.clone(),
            shard,
        };

        match event {
            "READY" => {
                if let Some(ready) = parse(event, data) {
                    self.handler.on_ready(ctx, ready).await;
                }
            }
            "RESUMED" => self.handler.on_resumed(ctx).await,
            "MESSAGE_CREATE" => {
                if let Some(msg) = parse(event, data) {
                    self.handler.on_message(ctx, msg).await;
                }
            }
            "GUILD_CREATE" => {
                if let Some(guild) = parse(event, data) {
                    self.handler.on_guild_create(ctx, guild).await;
                }
            }
            _ => {}
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, data: &Value) -> Option<T> {
    match serde_json::from_value(data.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("could not parse {event} payload: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn on_message(&self, _ctx: Context, msg: Message) {
            let _ = self.0.send(msg.content);
        }

        async fn on_resumed(&self, _ctx: Context) {
            let _ = self.0.send("resumed".to_string());
        }
    }

    #[tokio::test]
    async fn handler_receives_typed_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Client::builder("token").event_handler(Forward(tx)).build();

        let message = json!({
            "id": "1",
            "channel_id": "2",
            "author": {"id": "3", "username": "someone"},
            "content": "hello"
        });
        client.emitter().emit("MESSAGE_CREATE", message).await;
        client.emitter().emit("RESUMED", Value::Null).await;

        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(rx.recv().await.unwrap(), "resumed");
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Client::builder("token").event_handler(Forward(tx)).build();

        client
            .emitter()
            .emit("MESSAGE_CREATE", json!({"content": "no ids"}))
            .await;
        drop(client);
        assert!(rx.recv().await.is_none());
    }
}
