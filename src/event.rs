use async_trait::async_trait;

use crate::client::Context;
use crate::model::{Guild, Message, Ready};

/// Typed callbacks for the common events. Everything defaults to doing nothing, so implement
/// only what you need. For anything else, register a listener on [`Client::emitter`].
///
/// [`Client::emitter`]: crate::client::Client::emitter
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_ready(&self, ctx: Context, ready: Ready) {
        let _ = (ctx, ready);
    }

    async fn on_resumed(&self, ctx: Context) {
        let _ = ctx;
    }

    async fn on_message(&self, ctx: Context, msg: Message) {
        let _ = (ctx, msg);
    }

    async fn on_guild_create(&self, ctx: Context, guild: Guild) {
        let _ = (ctx, guild);
    }
}
