use std::env;
use std::time::Instant;

use async_trait::async_trait;
use clamor::prelude::*;

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn on_ready(&self, _ctx: Context, ready: Ready) {
        log::info!(
            "Logged in as {} on shard {:?}, {} guilds pending",
            ready.user.username,
            ready.shard.unwrap_or([0, 1]),
            ready.guilds.len()
        );
    }

    async fn on_guild_create(&self, _ctx: Context, guild: Guild) {
        let name = guild.name.unwrap_or_else(|| "Unknown Guild".to_string());
        log::info!("Guild loaded: {} ({})", name, guild.id);
    }

    async fn on_message(&self, ctx: Context, msg: Message) {
        if msg.author.bot.unwrap_or(false) || msg.content != "!ping" {
            return;
        }

        let start = Instant::now();
        let sent = match ctx.http.send_message(&msg.channel_id, "Pong!").await {
            Ok(sent) => sent,
            Err(e) => {
                log::error!("Failed to reply: {e}");
                return;
            }
        };

        let rest = start.elapsed().as_millis();
        let gateway = ctx
            .shard
            .latency()
            .map(|latency| format!("{}ms", latency.as_millis()))
            .unwrap_or_else(|| "n/a".to_string());

        let edited = ctx
            .http
            .edit_message(
                &msg.channel_id,
                &sent.id,
                &format!("Pong! REST {rest}ms, gateway {gateway}"),
            )
            .await;
        if let Err(e) = edited {
            log::error!("Failed to edit reply: {e}");
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let token = env::var("CLAMOR_TOKEN").expect("set CLAMOR_TOKEN to a bot token");
    let client = Client::builder(token).event_handler(Handler).build();

    let shutdown = client.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.close();
        }
    });

    if let Err(e) = client.start().await {
        log::error!("Client stopped: {e}");
    }
}
