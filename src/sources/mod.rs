//! # Sources Module
//!
//! Track identities, descriptors and the external collaborators that produce
//! them.
//!
//! - [`ytdlp`] - metadata extraction, search and raw audio download via yt-dlp
//! - [`spotify`] - playlist expansion through the Spotify Web API
//! - [`resolver`] - turns a user request into queueable descriptors
//!
//! The collaborators sit behind the [`MetadataExtractor`], [`AudioFetcher`] and
//! [`PlaylistApi`] traits so the engine can be driven by fakes in tests.

pub mod resolver;
pub mod spotify;
pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, time::Duration};
use url::Url;

use crate::error::{ExternalApiError, PipelineError, ResolutionError};

pub use resolver::{Candidate, TrackResolver};
pub use spotify::SpotifyClient;
pub use ytdlp::YtDlpClient;

/// Upstream identity of a track, independent of how the user asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackIdentity {
    pub source_id: String,
    pub extractor: String,
}

impl TrackIdentity {
    pub fn new(source_id: impl Into<String>, extractor: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            extractor: extractor.into(),
        }
    }

    /// Cache key derived from the identity. Each component is percent-encoded
    /// (`-` included) so the key is injective and doubles as a file stem.
    pub fn asset_key(&self) -> AssetKey {
        AssetKey(format!(
            "{}-{}",
            encode_component(&self.source_id),
            encode_component(&self.extractor)
        ))
    }
}

// `urlencoding` leaves `-` alone; it is the component separator here
fn encode_component(value: &str) -> String {
    urlencoding::encode(value).replace('-', "%2D")
}

/// Canonical cache key of a converted asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(String);

impl AssetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One structured record produced by the metadata extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub identity: TrackIdentity,
    pub title: String,
    pub duration: Option<Duration>,
    pub webpage_url: String,
}

/// Resolved metadata for one playable item.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    pub identity: TrackIdentity,
    pub asset_key: AssetKey,
    pub title: String,
    pub duration: Option<Duration>,
    pub webpage_url: String,
    /// Link the user typed, kept only when it named exactly this one track.
    pub link: Option<String>,
    pub requested_by: String,
    pub ready: bool,
}

impl TrackDescriptor {
    pub fn from_record(record: TrackRecord, requested_by: impl Into<String>) -> Self {
        Self {
            asset_key: record.identity.asset_key(),
            identity: record.identity,
            title: record.title,
            duration: record.duration,
            webpage_url: record.webpage_url,
            link: None,
            requested_by: requested_by.into(),
            ready: false,
        }
    }

    pub fn with_link(mut self, link: Option<String>) -> Self {
        self.link = link;
        self
    }

    pub fn with_requester(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = requested_by.into();
        self
    }

    pub fn display_duration(&self) -> String {
        format_duration(self.duration)
    }
}

/// `m:ss`, or `h:mm:ss` past the hour. Unknown durations (live streams) show `live`.
pub fn format_duration(duration: Option<Duration>) -> String {
    let Some(duration) = duration else {
        return "live".to_string();
    };
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

/// One playlist row as returned by the playlist API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    pub title: String,
    pub artist: String,
}

impl PlaylistItem {
    pub fn search_query(&self) -> String {
        format!("{} - {}", self.title, self.artist)
    }
}

/// Shape of a user request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackRequest {
    Link(String),
    Search(String),
    Playlist(String),
}

impl TrackRequest {
    pub fn classify(input: &str) -> Self {
        let input = input.trim();
        if let Some(id) = spotify::parse_playlist_id(input) {
            return Self::Playlist(id);
        }
        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Link(input.to_string()),
            _ => Self::Search(input.to_string()),
        }
    }
}

/// Canonical link for a search hit.
pub fn watch_url(source_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", source_id)
}

/// Metadata extraction and search.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Returns every record the link expands to. Malformed records are skipped.
    async fn extract(&self, link: &str) -> Result<Vec<TrackRecord>, ResolutionError>;

    /// Returns up to `limit` source IDs, best match first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ResolutionError>;
}

/// Downloads raw audio for a track.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, track: &TrackDescriptor, dest: &Path) -> Result<(), PipelineError>;
}

/// Ordered playlist contents.
#[async_trait]
pub trait PlaylistApi: Send + Sync {
    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>, ExternalApiError>;
}
