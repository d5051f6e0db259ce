use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::File,
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{path::Path, sync::Arc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::session::VoiceHandle;
use crate::error::TransportError;

/// Stops a stream early. Completion is still reported through
/// [`ActiveStream::finished`].
pub trait StreamControl: Send + Sync {
    fn stop(&self);
}

/// A stream in progress.
pub struct ActiveStream {
    pub finished: oneshot::Receiver<Result<(), TransportError>>,
    pub control: Box<dyn StreamControl>,
}

/// Voice gateway as seen by the scheduler.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceHandle, TransportError>;

    async fn disconnect(&self, handle: &VoiceHandle) -> Result<(), TransportError>;

    /// Starts playing `file` and returns immediately.
    async fn stream(&self, handle: &VoiceHandle, file: &Path) -> Result<ActiveStream, TransportError>;
}

/// Songbird-backed transport.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceHandle, TransportError> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        {
            let mut call = call.lock().await;
            if let Err(e) = call.deafen(true).await {
                debug!("Could not self-deafen in guild {}: {}", guild_id, e);
            }
        }

        info!("🔊 Joined channel {} in guild {}", channel_id, guild_id);
        Ok(VoiceHandle { guild_id, channel_id })
    }

    async fn disconnect(&self, handle: &VoiceHandle) -> Result<(), TransportError> {
        self.manager
            .remove(handle.guild_id)
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))?;

        info!("👋 Left voice in guild {}", handle.guild_id);
        Ok(())
    }

    async fn stream(&self, handle: &VoiceHandle, file: &Path) -> Result<ActiveStream, TransportError> {
        let call = self
            .manager
            .get(handle.guild_id)
            .ok_or(TransportError::NotConnected)?;

        let track = {
            let mut call = call.lock().await;
            call.play_input(File::new(file.to_path_buf()).into())
        };

        let (tx, rx) = oneshot::channel();
        let notifier = StreamEndNotifier {
            sender: Arc::new(Mutex::new(Some(tx))),
        };
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), notifier.clone())
                .map_err(|e| TransportError::Stream(e.to_string()))?;
        }

        debug!("▶️ Streaming {} in guild {}", file.display(), handle.guild_id);
        Ok(ActiveStream {
            finished: rx,
            control: Box::new(SongbirdControl(track)),
        })
    }
}

struct SongbirdControl(TrackHandle);

impl StreamControl for SongbirdControl {
    fn stop(&self) {
        if let Err(e) = self.0.stop() {
            debug!("Track already gone: {}", e);
        }
    }
}

/// Fires the completion channel on the first End or Error event.
#[derive(Clone)]
struct StreamEndNotifier {
    sender: Arc<Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>>,
}

#[async_trait]
impl VoiceEventHandler for StreamEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let mut outcome = Ok(());
        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                if let PlayMode::Errored(e) = &state.playing {
                    warn!("Track errored: {:?}", e);
                    outcome = Err(TransportError::Stream(format!("{:?}", e)));
                }
            }
        }

        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(outcome);
        }
        Some(Event::Cancel)
    }
}
