//! # Audio Module
//!
//! Per-guild playback engine: queue state, asset pipeline and the scheduler
//! that streams tracks into voice.
//!
//! ## Architecture
//!
//! ### [`session`] - Guild Session
//! - One [`GuildSession`](session::GuildSession) per guild, guarded by its own lock
//! - Ordered queue of entries that are resolving, downloading or ready
//! - Skip flag and voice connection handle
//!
//! ### [`pipeline`] - Download & Transcode
//! - Fetches raw audio, converts it and records it in the asset cache
//! - Idempotent per asset key; failures leave no partial files behind
//!
//! ### [`scheduler`] - Playback Scheduler
//! - Single consumer per guild, started on demand
//! - Streams the head of the queue, honours skip and disconnect
//!
//! ### [`transport`] - Voice Transport
//! - Songbird-backed connect / disconnect / stream
//!
//! ### [`player`] - Audio Player
//! - Session registry and the operations the chat surface calls
//!
//! ## Concurrency
//!
//! Guilds never share a lock. Request handlers and pipeline runs are short
//! lived tasks that only touch their guild's session and the shared
//! [`AssetCache`](crate::cache::AssetCache). Exactly one scheduler task per
//! guild consumes the queue, so exactly one track streams per guild.
//!
//! ```rust,ignore
//! let player = AudioPlayer::new(resolver, pipeline, cache, transport, reporter);
//! player.play(PlayRequest { guild_id, voice_channel, text_channel, query, requested_by, shuffle: false }).await?;
//! player.skip(guild_id).await;
//! ```

pub mod pipeline;
pub mod player;
pub mod scheduler;
pub mod session;
pub mod transport;

use async_trait::async_trait;
use serenity::model::id::ChannelId;

pub use pipeline::{DownloadPipeline, ScriptTranscoder};
pub use player::{AudioPlayer, PlayRequest};
pub use session::{GuildSession, PlaybackState, QueueSnapshot};
pub use transport::SongbirdTransport;

/// Posts engine status (failed downloads, stream errors) back to the channel
/// a request came from.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, channel: ChannelId, message: String);
}
