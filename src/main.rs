use anyhow::{Context, Result};
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod sources;
mod ui;

#[cfg(test)]
mod test_utils;

use crate::audio::{AudioPlayer, DownloadPipeline, ScriptTranscoder, SongbirdTransport};
use crate::bot::{ChannelReporter, MusicBot};
use crate::cache::AssetCache;
use crate::config::Config;
use crate::sources::{PlaylistApi, SpotifyClient, TrackResolver, YtDlpClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting guild-music v{}", env!("CARGO_PKG_VERSION"));

    // Handle health check if requested
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    // Check external tools
    let ytdlp = Arc::new(YtDlpClient::new(config.max_concurrent_downloads));
    match ytdlp.verify().await {
        Ok(version) => info!("📦 yt-dlp {}", version),
        Err(e) => warn!("yt-dlp not usable, downloads will fail: {}", e),
    }

    // Playlist support only exists with credentials; a failed exchange is fatal
    let playlists: Option<Arc<dyn PlaylistApi>> = match config.spotify_credentials() {
        Some((id, secret)) => {
            let client = SpotifyClient::connect(id, secret)
                .await
                .context("Spotify token exchange failed")?;
            Some(Arc::new(client) as Arc<dyn PlaylistApi>)
        }
        None => {
            info!("Spotify credentials not set, playlist links are disabled");
            None
        }
    };

    // Initialize cache and engine pieces
    let cache = Arc::new(AssetCache::open(&config.cache_dir).await?);
    let resolver = Arc::new(TrackResolver::new(
        cache.clone(),
        ytdlp.clone(),
        playlists,
        config.search_limit,
        config.max_playlist_size,
    ));
    let pipeline = Arc::new(DownloadPipeline::new(
        cache.clone(),
        ytdlp,
        Arc::new(ScriptTranscoder::new(&config.scripts_dir)),
        &config.download_dir,
    ));

    // Minimal intents needed
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    // Voice manager and status channel shared by the engine
    let songbird = Songbird::serenity();
    let http = Arc::new(serenity::http::Http::new(&config.discord_token));
    let player = Arc::new(AudioPlayer::new(
        resolver,
        pipeline,
        cache,
        Arc::new(SongbirdTransport::new(songbird.clone())),
        Arc::new(ChannelReporter::new(http)),
    ));

    // Create bot handler
    let handler = MusicBot::new(config.clone(), player);
    // Build client
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Handle graceful shutdown
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl+C handler");
        info!("⚠️ Shutdown signal received, exiting...");
        std::process::exit(0);
    });

    // Start bot
    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}

async fn health_check() -> Result<()> {
    // Verify critical dependencies
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies");
    }
}
