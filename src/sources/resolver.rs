use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{watch_url, MetadataExtractor, PlaylistApi, TrackDescriptor, TrackRequest};
use crate::{cache::AssetCache, error::ResolutionError};

/// One unit of resolution work, dispatched independently of its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Shown in the queue while the candidate is resolving.
    pub label: String,
    pub kind: CandidateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateKind {
    Link(String),
    Search(String),
}

impl Candidate {
    pub fn link(link: impl Into<String>) -> Self {
        let link = link.into();
        Self {
            label: link.clone(),
            kind: CandidateKind::Link(link),
        }
    }

    pub fn search(query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            label: query.clone(),
            kind: CandidateKind::Search(query),
        }
    }
}

/// Turns user requests into track descriptors, consulting the asset cache
/// before any external call.
pub struct TrackResolver {
    cache: Arc<AssetCache>,
    extractor: Arc<dyn MetadataExtractor>,
    playlists: Option<Arc<dyn PlaylistApi>>,
    search_limit: usize,
    max_playlist_size: usize,
}

impl TrackResolver {
    pub fn new(
        cache: Arc<AssetCache>,
        extractor: Arc<dyn MetadataExtractor>,
        playlists: Option<Arc<dyn PlaylistApi>>,
        search_limit: usize,
        max_playlist_size: usize,
    ) -> Self {
        Self {
            cache,
            extractor,
            playlists,
            search_limit: search_limit.max(1),
            max_playlist_size,
        }
    }

    /// Expands a request into ordered candidates. With `shuffle` the list is
    /// permuted once here, before any candidate is resolved.
    pub async fn candidates(
        &self,
        request: &TrackRequest,
        shuffle: bool,
    ) -> Result<Vec<Candidate>, ResolutionError> {
        let mut candidates = match request {
            TrackRequest::Link(link) => vec![Candidate::link(link)],
            TrackRequest::Search(query) => vec![Candidate::search(query)],
            TrackRequest::Playlist(id) => {
                let api = self
                    .playlists
                    .as_ref()
                    .ok_or(ResolutionError::PlaylistUnavailable)?;
                let mut items = api.playlist_tracks(id).await?;
                if items.is_empty() {
                    return Err(ResolutionError::NoResults(id.clone()));
                }
                if items.len() > self.max_playlist_size {
                    warn!(
                        "Playlist {} has {} tracks, keeping the first {}",
                        id,
                        items.len(),
                        self.max_playlist_size
                    );
                    items.truncate(self.max_playlist_size);
                }
                items
                    .iter()
                    .map(|item| Candidate::search(item.search_query()))
                    .collect()
            }
        };

        if shuffle {
            candidates.shuffle(&mut rand::thread_rng());
        }
        Ok(candidates)
    }

    /// Ready descriptor for a link candidate already in the cache. Never calls
    /// the extractor.
    pub fn cached(&self, candidate: &Candidate, requested_by: &str) -> Option<TrackDescriptor> {
        match &candidate.kind {
            CandidateKind::Link(link) => self
                .cache
                .lookup_by_link(link)
                .map(|track| track.with_requester(requested_by)),
            CandidateKind::Search(_) => None,
        }
    }

    /// Resolves one candidate. An error here affects only this candidate.
    pub async fn resolve(
        &self,
        candidate: &Candidate,
        requested_by: &str,
        shuffle: bool,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        match &candidate.kind {
            CandidateKind::Link(link) => self.resolve_link(link, requested_by, shuffle).await,
            CandidateKind::Search(query) => self.resolve_search(query, requested_by).await,
        }
    }

    async fn resolve_search(
        &self,
        query: &str,
        requested_by: &str,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        let ids = self.extractor.search(query, self.search_limit).await?;
        if ids.is_empty() {
            return Err(ResolutionError::NoResults(query.to_string()));
        }

        let urls: Vec<String> = ids.iter().map(|id| watch_url(id)).collect();
        let results = join_all(urls.iter().map(|url| self.resolve_link(url, requested_by, false))).await;

        let mut tracks = Vec::new();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(found) => tracks.extend(found),
                Err(e) => warn!("Search hit {} for {:?} failed: {}", url, query, e),
            }
        }

        if tracks.is_empty() {
            return Err(ResolutionError::NoResults(query.to_string()));
        }
        Ok(tracks)
    }

    /// Direct-link path. A link-index hit returns a ready descriptor without
    /// touching the extractor.
    pub async fn resolve_link(
        &self,
        link: &str,
        requested_by: &str,
        shuffle: bool,
    ) -> Result<Vec<TrackDescriptor>, ResolutionError> {
        if let Some(track) = self.cache.lookup_by_link(link) {
            return Ok(vec![track.with_requester(requested_by)]);
        }

        let mut records = self.extractor.extract(link).await?;
        if records.is_empty() {
            return Err(ResolutionError::NoResults(link.to_string()));
        }

        // The literal link only identifies a track when it expanded to exactly one
        let single = records.len() == 1;
        if shuffle && !single {
            records.shuffle(&mut rand::thread_rng());
        }

        let mut tracks = Vec::with_capacity(records.len());
        for record in records {
            let own_link = single.then(|| link.to_string());
            match self.cache.lookup_by_identity(&record.identity) {
                Some(cached) => {
                    let track = cached.with_link(own_link).with_requester(requested_by);
                    if track.link.is_some() {
                        if let Err(e) = self.cache.record(&track).await {
                            warn!("Could not index link {}: {}", link, e);
                        }
                    }
                    tracks.push(track);
                }
                None => {
                    debug!("Cache miss for {}", record.identity.asset_key());
                    tracks.push(TrackDescriptor::from_record(record, requested_by).with_link(own_link));
                }
            }
        }

        info!("🔗 {} resolved to {} track(s)", link, tracks.len());
        Ok(tracks)
    }
}
