use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::sources::TrackDescriptor;

pub type EntryId = u64;

/// Where a queue entry is in its journey to the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Slot reserved, no descriptor yet.
    Resolving,
    /// Descriptor known, pipeline still running.
    Downloading,
    Ready,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: EntryId,
    /// What the user asked for; shown until a descriptor arrives.
    pub label: String,
    pub requested_by: String,
    pub track: Option<TrackDescriptor>,
    pub status: EntryStatus,
}

/// Scheduler state for one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    AwaitingAsset,
    Playing,
    Skipping,
    Disconnected,
}

/// Opaque handle to the guild's voice connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceHandle {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

/// Consistent copy of a guild's queue for display.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub state: PlaybackState,
    pub now_playing: Option<EntryId>,
    pub entries: Vec<QueueEntry>,
}

/// What the scheduler should do next.
#[derive(Debug)]
pub(crate) enum Step {
    Play(QueueEntry, VoiceHandle),
    Wait,
    Exit,
}

/// Reason the current stream was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Skip,
    Disconnect,
    None,
}

#[derive(Debug)]
struct SessionState {
    queue: VecDeque<QueueEntry>,
    skip_requested: bool,
    disconnect_requested: bool,
    voice: Option<VoiceHandle>,
    text_channel: Option<ChannelId>,
    playback: PlaybackState,
    now_playing: Option<EntryId>,
    scheduler_active: bool,
}

/// Per-guild playback state behind a dedicated guard.
///
/// All mutation goes through `state`; guilds never share a lock. `changed`
/// wakes the scheduler when the queue moves, `interrupt` wakes the stream it
/// is currently driving.
#[derive(Debug)]
pub struct GuildSession {
    guild_id: GuildId,
    state: Mutex<SessionState>,
    changed: Notify,
    interrupt: Notify,
    next_id: AtomicU64,
}

impl GuildSession {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            state: Mutex::new(SessionState {
                queue: VecDeque::new(),
                skip_requested: false,
                disconnect_requested: false,
                voice: None,
                text_channel: None,
                playback: PlaybackState::Idle,
                now_playing: None,
                scheduler_active: false,
            }),
            changed: Notify::new(),
            interrupt: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn allocate_id(&self) -> EntryId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a resolved descriptor. Returns without waiting for download.
    pub async fn enqueue(&self, track: TrackDescriptor) -> EntryId {
        let id = self.allocate_id();
        let entry = QueueEntry {
            id,
            label: track.title.clone(),
            requested_by: track.requested_by.clone(),
            status: if track.ready {
                EntryStatus::Ready
            } else {
                EntryStatus::Downloading
            },
            track: Some(track),
        };
        self.state.lock().await.queue.push_back(entry);
        self.changed.notify_waiters();
        id
    }

    /// Appends a placeholder slot to be filled once resolution finishes.
    pub async fn reserve(&self, label: impl Into<String>, requested_by: &str) -> EntryId {
        let id = self.allocate_id();
        self.state.lock().await.queue.push_back(QueueEntry {
            id,
            label: label.into(),
            requested_by: requested_by.to_string(),
            track: None,
            status: EntryStatus::Resolving,
        });
        self.changed.notify_waiters();
        id
    }

    /// Appends one placeholder per label as a contiguous block.
    pub async fn reserve_all<I>(&self, labels: I, requested_by: &str) -> Vec<EntryId>
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock().await;
        let ids = labels
            .into_iter()
            .map(|label| {
                let id = self.allocate_id();
                state.queue.push_back(QueueEntry {
                    id,
                    label,
                    requested_by: requested_by.to_string(),
                    track: None,
                    status: EntryStatus::Resolving,
                });
                id
            })
            .collect();
        drop(state);

        self.changed.notify_waiters();
        ids
    }

    /// Replaces placeholder `slot` with one entry per descriptor, in place.
    ///
    /// An empty `tracks` removes the slot. Returns the IDs of the new entries,
    /// empty if the slot was cleared meanwhile.
    pub async fn fill(&self, slot: EntryId, tracks: Vec<TrackDescriptor>) -> Vec<(EntryId, TrackDescriptor)> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.queue.iter().position(|e| e.id == slot) else {
            debug!("Slot {} in guild {} no longer queued", slot, self.guild_id);
            return Vec::new();
        };
        let Some(placeholder) = state.queue.remove(pos) else {
            return Vec::new();
        };

        let mut filled = Vec::with_capacity(tracks.len());
        for (offset, track) in tracks.into_iter().enumerate() {
            // The first descriptor inherits the slot's ID
            let id = if offset == 0 { slot } else { self.allocate_id() };
            let entry = QueueEntry {
                id,
                label: track.title.clone(),
                requested_by: placeholder.requested_by.clone(),
                status: if track.ready {
                    EntryStatus::Ready
                } else {
                    EntryStatus::Downloading
                },
                track: Some(track.clone()),
            };
            state.queue.insert(pos + offset, entry);
            filled.push((id, track));
        }
        drop(state);

        self.changed.notify_waiters();
        filled
    }

    /// Flags an entry as playable once its pipeline succeeded.
    pub async fn mark_ready(&self, id: EntryId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.queue.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        entry.status = EntryStatus::Ready;
        if let Some(track) = entry.track.as_mut() {
            track.ready = true;
        }
        drop(state);

        self.changed.notify_waiters();
        true
    }

    /// Removes an entry that will never become playable.
    pub async fn drop_entry(&self, id: EntryId) -> bool {
        let mut state = self.state.lock().await;
        if state.now_playing == Some(id) {
            return false;
        }
        let before = state.queue.len();
        state.queue.retain(|e| e.id != id);
        let removed = state.queue.len() != before;
        drop(state);

        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    pub async fn peek_head(&self) -> Option<QueueEntry> {
        self.state.lock().await.queue.front().cloned()
    }

    /// Removes the head if it is still `expected`.
    pub async fn pop_head(&self, expected: EntryId) -> Option<QueueEntry> {
        let mut state = self.state.lock().await;
        if state.queue.front().map(|e| e.id) != Some(expected) {
            return None;
        }
        state.queue.pop_front()
    }

    /// Asks the scheduler to end the current track early. Only meaningful
    /// while a track is streaming.
    pub async fn request_skip(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.playback != PlaybackState::Playing {
            return false;
        }
        state.skip_requested = true;
        drop(state);

        self.interrupt.notify_one();
        true
    }

    /// Removes every entry except the one currently streaming.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let keep = state.now_playing;
        let before = state.queue.len();
        state.queue.retain(|e| Some(e.id) == keep);
        let removed = before - state.queue.len();
        drop(state);

        info!("🗑️ Cleared {} entries in guild {}", removed, self.guild_id);
        self.changed.notify_waiters();
        removed
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            state: state.playback,
            now_playing: state.now_playing,
            entries: state.queue.iter().cloned().collect(),
        }
    }

    pub async fn playback_state(&self) -> PlaybackState {
        self.state.lock().await.playback
    }

    pub async fn voice(&self) -> Option<VoiceHandle> {
        self.state.lock().await.voice
    }

    pub async fn text_channel(&self) -> Option<ChannelId> {
        self.state.lock().await.text_channel
    }

    pub async fn set_text_channel(&self, channel: ChannelId) {
        self.state.lock().await.text_channel = Some(channel);
    }

    /// Stores a freshly established connection.
    pub async fn attach_voice(&self, handle: VoiceHandle) {
        let mut state = self.state.lock().await;
        state.voice = Some(handle);
        match state.playback {
            // A stream cut by an earlier disconnect is still winding down;
            // the scheduler consumes the flag and keeps the head queued
            PlaybackState::Playing | PlaybackState::Skipping => {}
            PlaybackState::Disconnected => {
                state.disconnect_requested = false;
                state.playback = PlaybackState::Idle;
            }
            _ => state.disconnect_requested = false,
        }
        drop(state);

        self.changed.notify_waiters();
    }

    /// Clears the connection handle and interrupts any stream using it.
    pub async fn release_voice(&self) -> Option<VoiceHandle> {
        let mut state = self.state.lock().await;
        let handle = state.voice.take()?;
        if matches!(state.playback, PlaybackState::Playing | PlaybackState::Skipping) {
            state.disconnect_requested = true;
        } else {
            state.playback = PlaybackState::Disconnected;
        }
        drop(state);

        self.interrupt.notify_one();
        self.changed.notify_waiters();
        Some(handle)
    }

    /// Claims the right to run this guild's scheduler. At most one claim is
    /// outstanding at a time.
    pub(crate) async fn try_claim_scheduler(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.scheduler_active || state.voice.is_none() || state.queue.is_empty() {
            return false;
        }
        state.scheduler_active = true;
        true
    }

    /// Decides the scheduler's next move under the guard.
    pub(crate) async fn next_step(&self) -> Step {
        let mut state = self.state.lock().await;

        let Some(voice) = state.voice else {
            state.playback = if state.queue.is_empty() {
                PlaybackState::Idle
            } else {
                PlaybackState::Disconnected
            };
            state.scheduler_active = false;
            return Step::Exit;
        };

        let Some(head) = state.queue.front() else {
            state.playback = PlaybackState::Idle;
            state.scheduler_active = false;
            return Step::Exit;
        };

        if head.status != EntryStatus::Ready {
            state.playback = PlaybackState::AwaitingAsset;
            return Step::Wait;
        }

        let head = head.clone();
        state.playback = PlaybackState::Playing;
        state.now_playing = Some(head.id);
        state.skip_requested = false;
        Step::Play(head, voice)
    }

    /// Reads and clears the pending interrupt.
    pub(crate) async fn take_interrupt(&self) -> Interrupt {
        let mut state = self.state.lock().await;
        if state.disconnect_requested {
            state.disconnect_requested = false;
            state.skip_requested = false;
            return Interrupt::Disconnect;
        }
        if std::mem::take(&mut state.skip_requested) {
            state.playback = PlaybackState::Skipping;
            return Interrupt::Skip;
        }
        Interrupt::None
    }

    /// Ends the streaming phase for `id`. The head is popped unless the stream
    /// was cut by a disconnect, in which case it stays queued for the next
    /// connection.
    pub(crate) async fn finish_track(&self, id: EntryId, keep_queued: bool) {
        if !keep_queued {
            self.pop_head(id).await;
        }

        let mut state = self.state.lock().await;
        state.now_playing = None;
        state.skip_requested = false;
        // Reconnected while the old stream was stopping: resume right away
        state.playback = if keep_queued && state.voice.is_none() {
            PlaybackState::Disconnected
        } else {
            PlaybackState::Idle
        };
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn interrupt(&self) -> &Notify {
        &self.interrupt
    }
}
