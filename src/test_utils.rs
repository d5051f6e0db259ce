//! Test fixtures and fake collaborators.
//!
//! The fakes stand in for yt-dlp, ffmpeg, Spotify and the Discord voice
//! gateway so the engine can be driven end to end inside `#[tokio::test]`.
//! Each one counts its calls so tests can assert on external traffic.
//!
//! ```ignore
//! let (cache, _dir) = temp_cache().await;
//! let extractor = FakeExtractor::default().with_link("https://a", vec![record("a", "A")]);
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};

use crate::{
    audio::{
        pipeline::Transcoder,
        session::VoiceHandle,
        transport::{ActiveStream, StreamControl, VoiceTransport},
        StatusReporter,
    },
    cache::AssetCache,
    error::{ExternalApiError, PipelineError, ResolutionError, TransportError},
    sources::{
        watch_url, AssetKey, AudioFetcher, MetadataExtractor, PlaylistApi, PlaylistItem,
        TrackDescriptor, TrackIdentity, TrackRecord,
    },
};

/// Extractor record for a YouTube video with a three minute duration.
pub fn record(id: &str, title: &str) -> TrackRecord {
    TrackRecord {
        identity: TrackIdentity::new(id, "youtube"),
        title: title.to_string(),
        duration: Some(Duration::from_secs(180)),
        webpage_url: watch_url(id),
    }
}

/// Unready descriptor requested by `tester`.
pub fn sample_descriptor(id: &str, title: &str) -> TrackDescriptor {
    TrackDescriptor::from_record(record(id, title), "tester")
}

impl TrackDescriptor {
    pub fn ready(mut self) -> Self {
        self.ready = true;
        self
    }
}

/// Writes a stand-in converted file so the cache accepts `key`.
pub fn write_asset(cache: &AssetCache, key: &AssetKey) {
    std::fs::write(cache.audio_path(key), b"OggS").expect("Failed to write asset");
}

/// Opens an empty cache in a temporary directory. Keep the `TempDir` alive.
pub async fn temp_cache() -> (Arc<AssetCache>, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let cache = AssetCache::open(dir.path().join("cache"))
        .await
        .expect("Failed to open cache");
    (Arc::new(cache), dir)
}

#[derive(Default)]
pub struct FakeExtractor {
    links: HashMap<String, Vec<TrackRecord>>,
    searches: HashMap<String, Vec<String>>,
    pub extract_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn with_link(mut self, link: &str, records: Vec<TrackRecord>) -> Self {
        self.links.insert(link.to_string(), records);
        self
    }

    /// Registers a search hit whose watch URL extracts to `title`.
    pub fn with_search(mut self, query: &str, id: &str, title: &str) -> Self {
        self.searches.insert(query.to_string(), vec![id.to_string()]);
        self.links.insert(watch_url(id), vec![record(id, title)]);
        self
    }

    /// Registers search results only; their watch URLs need `with_link`.
    pub fn with_search_ids(mut self, query: &str, ids: &[&str]) -> Self {
        self.searches
            .insert(query.to_string(), ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn extract_count(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataExtractor for FakeExtractor {
    async fn extract(&self, link: &str) -> Result<Vec<TrackRecord>, ResolutionError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.links
            .get(link)
            .cloned()
            .ok_or_else(|| ResolutionError::Extractor {
                target: link.to_string(),
                message: "unsupported URL".to_string(),
            })
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ResolutionError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let mut ids = self.searches.get(query).cloned().unwrap_or_default();
        ids.truncate(limit);
        Ok(ids)
    }
}

/// Writes a few bytes to the destination after `delay`.
#[derive(Default)]
pub struct FakeFetcher {
    pub delay: Duration,
    pub failing: HashSet<String>,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, source_id: &str) -> Self {
        self.failing.insert(source_id.to_string());
        self
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for FakeFetcher {
    async fn fetch(&self, track: &TrackDescriptor, dest: &Path) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing.contains(&track.identity.source_id) {
            return Err(PipelineError::Fetch {
                key: track.asset_key.clone(),
                message: "HTTP Error 403".to_string(),
            });
        }
        tokio::fs::write(dest, b"m4a").await?;
        Ok(())
    }
}

/// Copies input to output, or leaves a partial file behind and fails.
#[derive(Default)]
pub struct FakeTranscoder {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeTranscoder {
    pub fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn convert(&self, key: &AssetKey, input: &Path, output: &Path) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            tokio::fs::write(output, b"Ogg").await?;
            return Err(PipelineError::Convert {
                key: key.clone(),
                message: "ffmpeg exited with 1".to_string(),
            });
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlaylistApi {
    playlists: HashMap<String, Vec<PlaylistItem>>,
}

impl FakePlaylistApi {
    pub fn with_playlist(mut self, id: &str, items: &[(&str, &str)]) -> Self {
        let items = items
            .iter()
            .map(|(title, artist)| PlaylistItem {
                title: title.to_string(),
                artist: artist.to_string(),
            })
            .collect();
        self.playlists.insert(id.to_string(), items);
        self
    }
}

#[async_trait]
impl PlaylistApi for FakePlaylistApi {
    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>, ExternalApiError> {
        self.playlists
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| ExternalApiError::InvalidReference(playlist_id.to_string()))
    }
}

/// Voice transport whose streams last `track_length` unless stopped.
///
/// Tracks how many streams each guild has open so tests can assert that
/// playback never overlaps.
pub struct FakeTransport {
    track_length: Duration,
    active: Arc<DashMap<GuildId, usize>>,
    max_active: Arc<AtomicUsize>,
    played: Mutex<Vec<(GuildId, PathBuf)>>,
    pub fail_streams: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FakeTransport {
    pub fn new(track_length: Duration) -> Self {
        Self {
            track_length,
            active: Arc::new(DashMap::new()),
            max_active: Arc::new(AtomicUsize::new(0)),
            played: Mutex::new(Vec::new()),
            fail_streams: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// File stems streamed in `guild`, in order.
    pub fn played(&self, guild: GuildId) -> Vec<String> {
        self.played
            .lock()
            .iter()
            .filter(|(g, _)| *g == guild)
            .filter_map(|(_, path)| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }

    /// Highest number of simultaneous streams seen in any single guild.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct FakeControl(Arc<Notify>);

impl StreamControl for FakeControl {
    fn stop(&self) {
        self.0.notify_one();
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<VoiceHandle, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(VoiceHandle { guild_id, channel_id })
    }

    async fn disconnect(&self, _handle: &VoiceHandle) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(&self, handle: &VoiceHandle, file: &Path) -> Result<ActiveStream, TransportError> {
        if self.fail_streams.load(Ordering::SeqCst) {
            return Err(TransportError::Stream("decoder error".to_string()));
        }

        let guild = handle.guild_id;
        let now = {
            let mut count = self.active.entry(guild).or_insert(0);
            *count += 1;
            *count
        };
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.played.lock().push((guild, file.to_path_buf()));

        let (done_tx, done_rx) = oneshot::channel();
        let stop = Arc::new(Notify::new());
        let active = self.active.clone();
        let length = self.track_length;
        let stopped = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(length) => {}
                _ = stopped.notified() => {}
            }
            if let Some(mut count) = active.get_mut(&guild) {
                *count -= 1;
            }
            let _ = done_tx.send(Ok(()));
        });

        Ok(ActiveStream {
            finished: done_rx,
            control: Box::new(FakeControl(stop)),
        })
    }
}

/// Collects status messages instead of posting them.
#[derive(Default)]
pub struct CollectingReporter {
    pub messages: Mutex<Vec<(ChannelId, String)>>,
}

impl CollectingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl StatusReporter for CollectingReporter {
    async fn report(&self, channel: ChannelId, message: String) {
        self.messages.lock().push((channel, message));
    }
}
