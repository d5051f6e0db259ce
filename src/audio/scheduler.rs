use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use super::{
    session::{GuildSession, Interrupt, QueueEntry, Step, VoiceHandle},
    transport::{ActiveStream, VoiceTransport},
    StatusReporter,
};
use crate::cache::AssetCache;

/// How long a stopped stream gets to confirm it is gone.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(2);

/// Stop requests sent before giving up on a stream that will not end.
const STOP_ATTEMPTS: u32 = 3;

/// Single consumer of one guild's queue.
///
/// Started on demand once [`GuildSession::try_claim_scheduler`] succeeds and
/// runs until the queue drains or the voice connection goes away. The next
/// stream is only started after the previous one reported completion, which
/// keeps at most one track playing per guild.
pub(crate) struct Scheduler {
    pub session: Arc<GuildSession>,
    pub cache: Arc<AssetCache>,
    pub transport: Arc<dyn VoiceTransport>,
    pub reporter: Arc<dyn StatusReporter>,
    /// Wait per stop attempt, normally [`STOP_GRACE`].
    pub stop_grace: Duration,
}

impl Scheduler {
    pub async fn run(self) {
        let guild_id = self.session.guild_id();
        info!("🎶 Scheduler started for guild {}", guild_id);

        loop {
            // Registered before inspecting state so a change in between still wakes us
            let changed = self.session.changed().notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.session.next_step().await {
                Step::Exit => break,
                Step::Wait => {
                    debug!("⏳ Guild {} waiting for head of queue", guild_id);
                    changed.await;
                }
                Step::Play(entry, voice) => self.play(entry, voice).await,
            }
        }

        info!("🎶 Scheduler stopped for guild {}", guild_id);
    }

    async fn play(&self, entry: QueueEntry, voice: VoiceHandle) {
        let Some(track) = entry.track.as_ref() else {
            self.session.finish_track(entry.id, false).await;
            return;
        };

        let path = self.cache.audio_path(&track.asset_key);
        let stream = match self.transport.stream(&voice, &path).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not stream {} in guild {}: {}", track.title, voice.guild_id, e);
                self.report(format!("⚠️ Could not play **{}**: {}", track.title, e))
                    .await;
                let keep = self.session.take_interrupt().await == Interrupt::Disconnect;
                self.session.finish_track(entry.id, keep).await;
                return;
            }
        };

        info!("🎵 Now playing in guild {}: {}", voice.guild_id, track.title);
        let interrupt = self.drive(stream, &track.title).await;
        self.session
            .finish_track(entry.id, interrupt == Interrupt::Disconnect)
            .await;
    }

    /// Waits for the stream to end on its own or be interrupted. Returns only
    /// after the transport confirmed the stream is over (or the grace period
    /// ran out).
    async fn drive(&self, stream: ActiveStream, title: &str) -> Interrupt {
        let ActiveStream {
            mut finished,
            control,
        } = stream;

        let interrupt = loop {
            tokio::select! {
                result = &mut finished => {
                    match result {
                        Ok(Ok(())) => debug!("Finished {}", title),
                        Ok(Err(e)) => {
                            error!("Stream of {} failed: {}", title, e);
                            self.report(format!("⚠️ Playback of **{}** failed: {}", title, e)).await;
                        }
                        Err(_) => warn!("Transport dropped completion for {}", title),
                    }
                    // A disconnect that raced the natural end still counts
                    return self.session.take_interrupt().await;
                }
                _ = self.session.interrupt().notified() => {
                    match self.session.take_interrupt().await {
                        Interrupt::None => continue,
                        interrupt => break interrupt,
                    }
                }
            }
        };

        debug!("⏭️ Stopping {} ({:?})", title, interrupt);
        for attempt in 1..=STOP_ATTEMPTS {
            control.stop();
            if tokio::time::timeout(self.stop_grace, &mut finished).await.is_ok() {
                return interrupt;
            }
            warn!("Stream of {} did not confirm stop (attempt {})", title, attempt);
        }

        // The transport may still be sending audio for this track
        error!("Stream of {} never confirmed stop, moving on", title);
        interrupt
    }

    async fn report(&self, message: String) {
        if let Some(channel) = self.session.text_channel().await {
            self.reporter.report(channel, message).await;
        }
    }
}
