use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    pipeline::DownloadPipeline,
    scheduler::{Scheduler, STOP_GRACE},
    session::{EntryId, GuildSession, QueueEntry, QueueSnapshot},
    transport::VoiceTransport,
    StatusReporter,
};
use crate::{
    cache::AssetCache,
    error::{PlayError, TransportError},
    sources::{Candidate, TrackRequest, TrackResolver},
};

/// A `play` command after the chat layer parsed it.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub guild_id: GuildId,
    pub voice_channel: ChannelId,
    pub text_channel: ChannelId,
    pub query: String,
    pub requested_by: String,
    pub shuffle: bool,
}

pub struct AudioPlayer {
    sessions: DashMap<GuildId, Arc<GuildSession>>,
    resolver: Arc<TrackResolver>,
    pipeline: Arc<DownloadPipeline>,
    cache: Arc<AssetCache>,
    transport: Arc<dyn VoiceTransport>,
    reporter: Arc<dyn StatusReporter>,
}

impl AudioPlayer {
    pub fn new(
        resolver: Arc<TrackResolver>,
        pipeline: Arc<DownloadPipeline>,
        cache: Arc<AssetCache>,
        transport: Arc<dyn VoiceTransport>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            resolver,
            pipeline,
            cache,
            transport,
            reporter,
        }
    }

    /// Session for `guild_id`, created on first observation.
    pub fn session(&self, guild_id: GuildId) -> Arc<GuildSession> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("Creating session for guild {}", guild_id);
                Arc::new(GuildSession::new(guild_id))
            })
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queues everything `request.query` resolves to and returns the number
    /// of slots reserved. Resolution and download continue in the background.
    pub async fn play(&self, request: PlayRequest) -> Result<usize, PlayError> {
        let session = self.session(request.guild_id);
        session.set_text_channel(request.text_channel).await;

        // Join the requester's channel on first use
        self.ensure_connected(&session, request.voice_channel).await?;

        // Expand the request (playlists go through the API here)
        let track_request = TrackRequest::classify(&request.query);
        let candidates = self
            .resolver
            .candidates(&track_request, request.shuffle)
            .await?;

        // A link already in the cache is playable now, no background job needed
        if let [candidate] = candidates.as_slice() {
            if let Some(track) = self.resolver.cached(candidate, &request.requested_by) {
                info!(
                    "➕ {} queued cached {} in guild {}",
                    request.requested_by, track.title, request.guild_id
                );
                session.enqueue(track).await;
                self.ensure_scheduler(&session).await;
                return Ok(1);
            }
        }

        // Slots are reserved as one block so concurrent resolution keeps request order
        let labels = candidates.iter().map(|c| c.label.clone());
        let slots = session.reserve_all(labels, &request.requested_by).await;
        let count = slots.len();
        info!(
            "➕ {} queued {} item(s) in guild {}",
            request.requested_by, count, request.guild_id
        );

        // Resolve each slot in the background
        for (slot, candidate) in slots.into_iter().zip(candidates) {
            let job = ResolveJob {
                session: session.clone(),
                resolver: self.resolver.clone(),
                pipeline: self.pipeline.clone(),
                reporter: self.reporter.clone(),
                text_channel: request.text_channel,
            };
            let requested_by = request.requested_by.clone();
            let shuffle = request.shuffle;
            tokio::spawn(async move { job.run(slot, candidate, requested_by, shuffle).await });
        }

        self.ensure_scheduler(&session).await;
        Ok(count)
    }

    pub async fn skip(&self, guild_id: GuildId) -> bool {
        self.session(guild_id).request_skip().await
    }

    pub async fn clear(&self, guild_id: GuildId) -> usize {
        self.session(guild_id).clear().await
    }

    pub async fn queue(&self, guild_id: GuildId) -> QueueSnapshot {
        self.session(guild_id).snapshot().await
    }

    /// Joins (or moves to) `voice_channel` and resumes a queue left behind by
    /// an earlier disconnect. Returns the head of the queue, if any.
    pub async fn summon(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
        text_channel: ChannelId,
    ) -> Result<Option<QueueEntry>, TransportError> {
        let session = self.session(guild_id);
        session.set_text_channel(text_channel).await;

        // Move only when not already in that channel
        if session.voice().await.map(|v| v.channel_id) != Some(voice_channel) {
            let handle = self.transport.connect(guild_id, voice_channel).await?;
            session.attach_voice(handle).await;
        }

        self.ensure_scheduler(&session).await;
        Ok(session.peek_head().await)
    }

    /// Leaves voice. The queue is kept; returns false when not connected.
    pub async fn disconnect(&self, guild_id: GuildId) -> Result<bool, TransportError> {
        let session = self.session(guild_id);
        let Some(handle) = session.release_voice().await else {
            return Ok(false);
        };
        self.transport.disconnect(&handle).await?;
        Ok(true)
    }

    async fn ensure_connected(
        &self,
        session: &GuildSession,
        voice_channel: ChannelId,
    ) -> Result<(), TransportError> {
        if session.voice().await.is_some() {
            return Ok(());
        }
        let handle = self
            .transport
            .connect(session.guild_id(), voice_channel)
            .await?;
        session.attach_voice(handle).await;
        Ok(())
    }

    async fn ensure_scheduler(&self, session: &Arc<GuildSession>) {
        if !session.try_claim_scheduler().await {
            return;
        }
        let scheduler = Scheduler {
            session: session.clone(),
            cache: self.cache.clone(),
            transport: self.transport.clone(),
            reporter: self.reporter.clone(),
            stop_grace: STOP_GRACE,
        };
        tokio::spawn(scheduler.run());
    }
}

/// Background work for one reserved slot: resolve, fill, then run the
/// pipeline for every descriptor that is not playable yet.
struct ResolveJob {
    session: Arc<GuildSession>,
    resolver: Arc<TrackResolver>,
    pipeline: Arc<DownloadPipeline>,
    reporter: Arc<dyn StatusReporter>,
    text_channel: ChannelId,
}

impl ResolveJob {
    async fn run(self, slot: EntryId, candidate: Candidate, requested_by: String, shuffle: bool) {
        let tracks = match self.resolver.resolve(&candidate, &requested_by, shuffle).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("Could not resolve {:?}: {}", candidate.label, e);
                self.session.fill(slot, Vec::new()).await;
                self.reporter
                    .report(self.text_channel, format!("❌ Nothing playable for **{}**", candidate.label))
                    .await;
                return;
            }
        };

        // Cached tracks are already playable, the rest need the pipeline
        for (id, track) in self.session.fill(slot, tracks).await {
            if track.ready {
                continue;
            }
            let session = self.session.clone();
            let pipeline = self.pipeline.clone();
            let reporter = self.reporter.clone();
            let text_channel = self.text_channel;
            tokio::spawn(async move {
                match pipeline.run(&track).await {
                    Ok(()) => {
                        session.mark_ready(id).await;
                    }
                    Err(e) => {
                        warn!("Pipeline failed for {}: {}", track.title, e);
                        session.drop_entry(id).await;
                        reporter
                            .report(text_channel, format!("❌ Could not download **{}**", track.title))
                            .await;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::session::{EntryStatus, PlaybackState},
        test_utils::{
            record, sample_descriptor, temp_cache, write_asset, CollectingReporter, FakeExtractor,
            FakeFetcher, FakePlaylistApi, FakeTranscoder, FakeTransport,
        },
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(10);
    const TICK: Duration = Duration::from_millis(5);
    const LONG_TRACK: Duration = Duration::from_secs(3600);

    struct Harness {
        player: Arc<AudioPlayer>,
        cache: Arc<AssetCache>,
        transport: Arc<FakeTransport>,
        fetcher: Arc<FakeFetcher>,
        reporter: Arc<CollectingReporter>,
        _dir: TempDir,
    }

    async fn harness(
        extractor: FakeExtractor,
        playlists: Option<FakePlaylistApi>,
        fetcher: FakeFetcher,
        track_length: Duration,
    ) -> Harness {
        let (cache, dir) = temp_cache().await;
        let fetcher = Arc::new(fetcher);
        let transport = Arc::new(FakeTransport::new(track_length));
        let reporter = Arc::new(CollectingReporter::default());
        let playlists = playlists.map(|api| Arc::new(api) as Arc<dyn crate::sources::PlaylistApi>);

        let resolver = Arc::new(TrackResolver::new(cache.clone(), Arc::new(extractor), playlists, 1, 100));
        let pipeline = Arc::new(DownloadPipeline::new(
            cache.clone(),
            fetcher.clone(),
            Arc::new(FakeTranscoder::default()),
            dir.path().join("download"),
        ));
        let player = Arc::new(AudioPlayer::new(
            resolver,
            pipeline,
            cache.clone(),
            transport.clone(),
            reporter.clone(),
        ));

        Harness {
            player,
            cache,
            transport,
            fetcher,
            reporter,
            _dir: dir,
        }
    }

    fn links(ids: &[&str]) -> FakeExtractor {
        ids.iter().fold(FakeExtractor::default(), |extractor, id| {
            extractor.with_link(&link(id), vec![record(id, &id.to_uppercase())])
        })
    }

    fn link(id: &str) -> String {
        format!("https://youtu.be/{}", id)
    }

    fn keys(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| format!("{}-youtube", id)).collect()
    }

    fn request(guild: GuildId, query: &str) -> PlayRequest {
        PlayRequest {
            guild_id: guild,
            voice_channel: ChannelId::new(100),
            text_channel: ChannelId::new(200),
            query: query.to_string(),
            requested_by: "alice".to_string(),
            shuffle: false,
        }
    }

    async fn wait_played(transport: &FakeTransport, guild: GuildId, count: usize) {
        timeout(WAIT, async {
            while transport.played(guild).len() < count {
                sleep(TICK).await;
            }
        })
        .await
        .expect("expected streams never started");
    }

    async fn wait_state(player: &AudioPlayer, guild: GuildId, state: PlaybackState, queued: usize) {
        timeout(WAIT, async {
            loop {
                let snapshot = player.queue(guild).await;
                if snapshot.state == state && snapshot.entries.len() == queued {
                    break;
                }
                sleep(TICK).await;
            }
        })
        .await
        .expect("session never reached expected state");
    }

    #[tokio::test]
    async fn test_links_play_in_request_order() {
        let h = harness(links(&["a", "b", "c"]), None, FakeFetcher::default(), Duration::from_millis(20)).await;
        let guild = GuildId::new(1);

        for id in ["a", "b", "c"] {
            assert_eq!(h.player.play(request(guild, &link(id))).await.unwrap(), 1);
        }

        wait_played(&h.transport, guild, 3).await;
        wait_state(&h.player, guild, PlaybackState::Idle, 0).await;
        assert_eq!(h.transport.played(guild), keys(&["a", "b", "c"]));
        assert_eq!(h.transport.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_shows_pending_entry_immediately() {
        let h = harness(
            links(&["a"]),
            None,
            FakeFetcher::with_delay(Duration::from_millis(200)),
            LONG_TRACK,
        )
        .await;
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();

        let snapshot = h.player.queue(guild).await;
        assert_eq!(snapshot.entries.len(), 1);
        assert!(snapshot.entries[0].track.as_ref().map_or(true, |t| !t.ready));
    }

    #[tokio::test]
    async fn test_skip_advances_without_replay() {
        let h = harness(links(&["a", "b"]), None, FakeFetcher::default(), LONG_TRACK).await;
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();
        h.player.play(request(guild, &link("b"))).await.unwrap();

        wait_played(&h.transport, guild, 1).await;
        assert!(h.player.skip(guild).await);
        wait_played(&h.transport, guild, 2).await;
        assert!(h.player.skip(guild).await);
        wait_state(&h.player, guild, PlaybackState::Idle, 0).await;

        assert_eq!(h.transport.played(guild), keys(&["a", "b"]));
        assert!(!h.player.skip(guild).await);
    }

    #[tokio::test]
    async fn test_playlist_with_unresolvable_item() {
        let extractor = FakeExtractor::default()
            .with_search("One - Ann", "one", "One")
            .with_search("Two - Ben", "two", "Two")
            .with_search("Four - Dan", "four", "Four")
            .with_search("Five - Eve", "five", "Five");
        let playlists = FakePlaylistApi::default().with_playlist(
            "pl5",
            &[
                ("One", "Ann"),
                ("Two", "Ben"),
                ("Three", "Cat"),
                ("Four", "Dan"),
                ("Five", "Eve"),
            ],
        );
        let h = harness(extractor, Some(playlists), FakeFetcher::default(), Duration::from_millis(10)).await;
        let guild = GuildId::new(1);

        let queued = h
            .player
            .play(request(guild, "spotify:playlist:pl5"))
            .await
            .unwrap();
        assert_eq!(queued, 5);

        wait_played(&h.transport, guild, 4).await;
        wait_state(&h.player, guild, PlaybackState::Idle, 0).await;
        assert_eq!(h.transport.played(guild), keys(&["one", "two", "four", "five"]));
        assert_eq!(h.reporter.messages(), vec!["❌ Nothing playable for **Three - Cat**".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_link_twice_downloads_once() {
        let h = harness(
            links(&["a"]),
            None,
            FakeFetcher::with_delay(Duration::from_millis(50)),
            Duration::from_millis(10),
        )
        .await;
        let guild = GuildId::new(1);

        let (first, second) = tokio::join!(
            h.player.play(request(guild, &link("a"))),
            h.player.play(request(guild, &link("a")))
        );
        first.unwrap();
        second.unwrap();

        wait_played(&h.transport, guild, 2).await;
        assert_eq!(h.transport.played(guild), keys(&["a", "a"]));
        assert_eq!(h.fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_cached_link_plays_without_download() {
        let h = harness(FakeExtractor::default(), None, FakeFetcher::default(), Duration::from_millis(10)).await;
        let track = sample_descriptor("a", "A").with_link(Some(link("a")));
        write_asset(&h.cache, &track.asset_key);
        h.cache.record(&track).await.unwrap();
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();

        wait_played(&h.transport, guild, 1).await;
        assert_eq!(h.fetcher.count(), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_advances_queue() {
        let h = harness(links(&["a", "b"]), None, FakeFetcher::default(), LONG_TRACK).await;
        h.transport
            .fail_streams
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();
        h.player.play(request(guild, &link("b"))).await.unwrap();

        wait_state(&h.player, guild, PlaybackState::Idle, 0).await;
        assert_eq!(h.reporter.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_head_until_summoned() {
        let h = harness(links(&["a", "b"]), None, FakeFetcher::default(), LONG_TRACK).await;
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();
        h.player.play(request(guild, &link("b"))).await.unwrap();
        wait_played(&h.transport, guild, 1).await;

        assert!(h.player.disconnect(guild).await.unwrap());
        wait_state(&h.player, guild, PlaybackState::Disconnected, 2).await;
        assert!(!h.player.disconnect(guild).await.unwrap());

        h.player
            .summon(guild, ChannelId::new(100), ChannelId::new(200))
            .await
            .unwrap();
        wait_played(&h.transport, guild, 2).await;
        assert_eq!(h.transport.played(guild), keys(&["a", "a"]));
    }

    #[tokio::test]
    async fn test_summon_right_after_disconnect_replays_cut_track() {
        let h = harness(links(&["a", "b"]), None, FakeFetcher::default(), LONG_TRACK).await;
        let guild = GuildId::new(1);

        h.player.play(request(guild, &link("a"))).await.unwrap();
        h.player.play(request(guild, &link("b"))).await.unwrap();
        wait_played(&h.transport, guild, 1).await;

        assert!(h.player.disconnect(guild).await.unwrap());
        let head = h
            .player
            .summon(guild, ChannelId::new(100), ChannelId::new(200))
            .await
            .unwrap();
        assert_eq!(head.map(|entry| entry.label), Some("A".to_string()));

        wait_played(&h.transport, guild, 2).await;
        assert_eq!(h.transport.played(guild), keys(&["a", "a"]));
        assert_eq!(h.player.queue(guild).await.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_cached_link_is_queued_before_play_returns() {
        let h = harness(FakeExtractor::default(), None, FakeFetcher::default(), LONG_TRACK).await;
        let track = sample_descriptor("a", "A").with_link(Some(link("a")));
        write_asset(&h.cache, &track.asset_key);
        h.cache.record(&track).await.unwrap();
        let guild = GuildId::new(1);

        assert_eq!(h.player.play(request(guild, &link("a"))).await.unwrap(), 1);

        let snapshot = h.player.queue(guild).await;
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].status, EntryStatus::Ready);
        assert_eq!(snapshot.entries[0].requested_by, "alice");
    }

    #[tokio::test]
    async fn test_clear_spares_current_track() {
        let h = harness(links(&["a", "b", "c"]), None, FakeFetcher::default(), LONG_TRACK).await;
        let guild = GuildId::new(1);

        for id in ["a", "b", "c"] {
            h.player.play(request(guild, &link(id))).await.unwrap();
        }
        wait_played(&h.transport, guild, 1).await;

        assert_eq!(h.player.clear(guild).await, 2);
        let snapshot = h.player.queue(guild).await;
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.now_playing, Some(snapshot.entries[0].id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_guilds_never_stream_two_tracks_at_once() {
        let ids = ["a", "b", "c", "d"];
        let h = harness(links(&ids), None, FakeFetcher::default(), Duration::from_millis(15)).await;

        let mut tasks = Vec::new();
        for g in 1..=12u64 {
            let player = h.player.clone();
            tasks.push(tokio::spawn(async move {
                let guild = GuildId::new(g);
                for id in ids {
                    player.play(request(guild, &link(id))).await.unwrap();
                    if fastrand::bool() {
                        player.skip(guild).await;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for g in 1..=12u64 {
            let guild = GuildId::new(g);
            wait_state(&h.player, guild, PlaybackState::Idle, 0).await;
            assert_eq!(h.transport.played(guild), keys(&ids));
        }
        assert_eq!(h.transport.max_concurrent(), 1);
        assert_eq!(h.player.session_count(), 12);
    }
}
