//! # Bot Module
//!
//! Discord-facing side of the bot: prefix commands in text channels and
//! ephemeral status replies.
//!
//! ## Architecture
//!
//! The bot is built around the [`MusicBot`] struct which implements
//! Serenity's [`EventHandler`] trait. It owns:
//!
//! - The [`AudioPlayer`] with every guild's session
//! - The loaded [`Config`] (command prefix)
//!
//! Voice connections are managed by the player through songbird; the bot only
//! tells it which channel the requesting user sits in.
//!
//! ## Example
//!
//! ```rust,ignore
//! let bot = MusicBot::new(config, player);
//! let client = Client::builder(&token, intents).event_handler(bot).await?;
//! ```

use async_trait::async_trait;
use serenity::{
    all::{ChannelId, Context, EventHandler, Guild, Message, Ready, VoiceState},
    builder::CreateMessage,
    http::Http,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{AudioPlayer, StatusReporter},
    config::Config,
};
use commands::Command;

/// How long engine status messages stay in the channel.
const STATUS_TTL: Duration = Duration::from_secs(10);

/// Main Discord bot handler.
///
/// ## Fields
///
/// - `config`: Bot configuration (prefix)
/// - `player`: Playback engine shared by every guild
pub struct MusicBot {
    config: Arc<Config>,
    pub player: Arc<AudioPlayer>,
}

impl MusicBot {
    pub fn new(config: Arc<Config>, player: Arc<AudioPlayer>) -> Self {
        Self { config, player }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} servers", ready.guilds.len());
    }

    /// Creates the guild's session the first time the guild is seen.
    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.player.session(guild.id);
        debug!("🏠 Observed guild {} ({})", guild.name, guild.id);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(command) = Command::parse(self.prefix(), &msg.content) else {
            return;
        };

        if let Err(e) = handlers::handle_command(&ctx, &msg, command, self).await {
            error!("Error handling command: {:?}", e);
        }
    }

    /// Keeps the session in sync when the bot is removed from voice by
    /// someone else.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        match self.player.disconnect(guild_id).await {
            Ok(true) => info!("🔌 Bot was removed from voice in guild {}", guild_id),
            Ok(false) => {}
            Err(e) => warn!("Cleanup after forced disconnect failed: {}", e),
        }
    }
}

/// Posts engine status to a text channel and removes it after a while.
pub struct ChannelReporter {
    http: Arc<Http>,
}

impl ChannelReporter {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl StatusReporter for ChannelReporter {
    async fn report(&self, channel: ChannelId, message: String) {
        send_ephemeral(&self.http, channel, CreateMessage::new().content(message), STATUS_TTL).await;
    }
}

/// Sends `message` and deletes it after `ttl`.
pub async fn send_ephemeral(http: &Arc<Http>, channel: ChannelId, message: CreateMessage, ttl: Duration) {
    match channel.send_message(http, message).await {
        Ok(sent) => {
            let http = http.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(e) = sent.delete(&http).await {
                    debug!("Could not delete status message: {}", e);
                }
            });
        }
        Err(e) => warn!("Could not send message to channel {}: {}", channel, e),
    }
}
