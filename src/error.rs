//! Error taxonomy for the playback engine.
//!
//! Every failure in the engine is scoped to one request, one candidate or one
//! track. The enums below mirror those scopes so callers can isolate them:
//!
//! - [`ResolutionError`]: a candidate could not be turned into descriptors
//! - [`PipelineError`]: a descriptor could not be fetched or converted
//! - [`TransportError`]: the voice connection or stream failed
//! - [`ExternalApiError`]: the playlist API rejected us
//! - [`CacheError`]: the asset cache index could not be read or written
//!
//! The binary edge (`main`, chat handlers) wraps these in `anyhow`.

use std::path::PathBuf;

use crate::sources::AssetKey;

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("could not run metadata extractor: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("extractor failed for {target}: {message}")]
    Extractor { target: String, message: String },

    #[error("no results for {0:?}")]
    NoResults(String),

    #[error("playlist support is not configured")]
    PlaylistUnavailable,

    #[error(transparent)]
    Playlist(#[from] ExternalApiError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("download failed for {key}: {message}")]
    Fetch { key: AssetKey, message: String },

    #[error("conversion failed for {key}: {message}")]
    Convert { key: AssetKey, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("could not join voice channel: {0}")]
    Connect(String),

    #[error("could not leave voice channel: {0}")]
    Disconnect(String),

    #[error("stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExternalApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unrecognised playlist reference: {0}")]
    InvalidReference(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refusing to record {key}: converted file missing at {path}")]
    MissingAsset { key: AssetKey, path: PathBuf },
}

/// Failure of a `play` request before any candidate was queued.
#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
