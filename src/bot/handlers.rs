use anyhow::Result;
use serenity::{
    builder::CreateMessage,
    model::{
        channel::Message,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{debug, info, warn};

use super::{commands::{help_text, Command}, send_ephemeral, MusicBot};
use crate::{audio::PlayRequest, ui::embeds};

/// Runs one parsed command. The user's message is removed and the reply
/// deleted after the command's TTL.
pub async fn handle_command(ctx: &Context, msg: &Message, command: Command, bot: &MusicBot) -> Result<()> {
    let guild_id = msg
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Command used outside a server"))?;

    info!("📝 {:?} from {} in guild {}", command, msg.author.name, guild_id);

    if let Err(e) = msg.delete(&ctx.http).await {
        debug!("Could not delete command message: {}", e);
    }

    let ttl = command.reply_ttl();
    let bot_name = ctx.cache.current_user().name.clone();

    let reply = match command {
        Command::Play { query, shuffle } => handle_play(ctx, msg, guild_id, bot, &bot_name, query, shuffle).await,
        Command::Skip => handle_skip(guild_id, bot).await,
        Command::Clear => handle_clear(guild_id, bot).await,
        Command::Queue => {
            let snapshot = bot.player.queue(guild_id).await;
            CreateMessage::new().embed(embeds::queue_embed(&bot_name, &snapshot))
        }
        Command::Disconnect => handle_disconnect(guild_id, bot).await,
        Command::Summon => handle_summon(ctx, msg, guild_id, bot, &bot_name).await,
        Command::Help => CreateMessage::new().content(help_text(bot.prefix())),
    };

    send_ephemeral(&ctx.http, msg.channel_id, reply, ttl).await;
    Ok(())
}

async fn handle_play(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    bot: &MusicBot,
    bot_name: &str,
    query: String,
    shuffle: bool,
) -> CreateMessage {
    let Some(voice_channel) = user_voice_channel(ctx, guild_id, msg.author.id) else {
        return not_in_voice(bot_name);
    };

    let request = PlayRequest {
        guild_id,
        voice_channel,
        text_channel: msg.channel_id,
        query: query.clone(),
        requested_by: msg.author.name.clone(),
        shuffle,
    };

    match bot.player.play(request).await {
        Ok(slots) => CreateMessage::new().embed(embeds::enqueued_embed(bot_name, &query, slots)),
        Err(e) => {
            warn!("Play request {:?} failed: {}", query, e);
            CreateMessage::new().embed(embeds::error_embed(bot_name, &format!("❌ {}", e)))
        }
    }
}

async fn handle_skip(guild_id: GuildId, bot: &MusicBot) -> CreateMessage {
    let content = if bot.player.skip(guild_id).await {
        "⏭️ Skipped"
    } else {
        "Nothing is playing"
    };
    CreateMessage::new().content(content)
}

async fn handle_clear(guild_id: GuildId, bot: &MusicBot) -> CreateMessage {
    let removed = bot.player.clear(guild_id).await;
    CreateMessage::new().content(format!("🗑️ Removed {} queued track(s)", removed))
}

async fn handle_disconnect(guild_id: GuildId, bot: &MusicBot) -> CreateMessage {
    let content = match bot.player.disconnect(guild_id).await {
        Ok(true) => "👋 Disconnected, the queue is kept for next time".to_string(),
        Ok(false) => "Not connected to a voice channel".to_string(),
        Err(e) => format!("❌ {}", e),
    };
    CreateMessage::new().content(content)
}

async fn handle_summon(
    ctx: &Context,
    msg: &Message,
    guild_id: GuildId,
    bot: &MusicBot,
    bot_name: &str,
) -> CreateMessage {
    let Some(voice_channel) = user_voice_channel(ctx, guild_id, msg.author.id) else {
        return not_in_voice(bot_name);
    };

    match bot.player.summon(guild_id, voice_channel, msg.channel_id).await {
        Ok(Some(head)) => CreateMessage::new().content(format!(
            "🔊 Joined <#{}>, up next: **{}**",
            voice_channel, head.label
        )),
        Ok(None) => CreateMessage::new().content(format!("🔊 Joined <#{}>", voice_channel)),
        Err(e) => CreateMessage::new().embed(embeds::error_embed(bot_name, &format!("❌ {}", e))),
    }
}

fn not_in_voice(bot_name: &str) -> CreateMessage {
    CreateMessage::new().embed(embeds::error_embed(bot_name, "You must be in a voice channel"))
}

// Kept synchronous so the cache guard never lives across an await
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
