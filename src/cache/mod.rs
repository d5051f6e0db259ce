//! # Cache Module
//!
//! Persistent asset cache shared by every guild.
//!
//! Maps a track identity to a converted, playable audio file and the metadata
//! needed to queue it without asking the extractor again. Two indexes are
//! kept:
//!
//! - **by asset key**: the canonical index, one entry per converted file
//! - **by link**: the exact string a user typed, for the fast path before any
//!   external call
//!
//! ## Coherence
//!
//! An entry exists only while its converted file exists. [`AssetCache::record`]
//! refuses to index a key whose file is missing, lookups drop entries whose
//! file disappeared, and [`AssetCache::open`] repairs the index on startup.
//!
//! ## Persistence
//!
//! The metadata index lives in `index.json` beside the audio files and is
//! rewritten (temp file + rename) after every `record`. Converted files are
//! never evicted.
//!
//! ```rust,ignore
//! let cache = AssetCache::open("./audio_cache").await?;
//! if let Some(track) = cache.lookup_by_link("https://youtu.be/dQw4w9WgXcQ") {
//!     println!("cached: {}", track.title);
//! }
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::CacheError,
    sources::{AssetKey, TrackDescriptor, TrackIdentity},
};

pub const INDEX_FILE: &str = "index.json";

/// Extension of converted files (Opus in an Ogg container).
pub const PLAYBACK_EXTENSION: &str = "ogg";

/// Metadata stored for one converted asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: TrackIdentity,
    pub asset_key: AssetKey,
    pub title: String,
    pub duration: Option<Duration>,
    pub webpage_url: String,
}

impl CacheEntry {
    fn into_descriptor(self, link: Option<String>) -> TrackDescriptor {
        TrackDescriptor {
            identity: self.identity,
            asset_key: self.asset_key,
            title: self.title,
            duration: self.duration,
            webpage_url: self.webpage_url,
            link,
            requested_by: String::new(),
            ready: true,
        }
    }
}

impl From<&TrackDescriptor> for CacheEntry {
    fn from(track: &TrackDescriptor) -> Self {
        Self {
            identity: track.identity.clone(),
            asset_key: track.asset_key.clone(),
            title: track.title.clone(),
            duration: track.duration,
            webpage_url: track.webpage_url.clone(),
        }
    }
}

/// On-disk form of the index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    entries: Vec<CacheEntry>,
    links: BTreeMap<String, AssetKey>,
}

pub struct AssetCache {
    dir: PathBuf,
    by_key: DashMap<AssetKey, CacheEntry>,
    by_link: DashMap<String, AssetKey>,
    // Serializes index rewrites; lookups never take it
    persist_lock: Mutex<()>,
}

impl AssetCache {
    /// Opens (or creates) the cache in `dir`, loading and repairing the index.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let cache = Self {
            dir,
            by_key: DashMap::new(),
            by_link: DashMap::new(),
            persist_lock: Mutex::new(()),
        };

        let index = cache.load_index().await;
        let mut dropped = 0;
        for entry in index.entries {
            if cache.audio_path(&entry.asset_key).exists() {
                cache.by_key.insert(entry.asset_key.clone(), entry);
            } else {
                dropped += 1;
            }
        }
        for (link, key) in index.links {
            if cache.by_key.contains_key(&key) {
                cache.by_link.insert(link, key);
            }
        }

        if dropped > 0 {
            warn!("🧹 Dropped {} cache entries whose audio file is gone", dropped);
            cache.persist().await?;
        }
        info!(
            "📁 Asset cache at {}: {} tracks, {} links",
            cache.dir.display(),
            cache.by_key.len(),
            cache.by_link.len()
        );

        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the converted file for `key`.
    pub fn audio_path(&self, key: &AssetKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, PLAYBACK_EXTENSION))
    }

    pub fn is_cached(&self, identity: &TrackIdentity) -> bool {
        self.lookup_identity(identity).is_some()
    }

    /// Exact-match lookup on the link a user typed.
    pub fn lookup_by_link(&self, link: &str) -> Option<TrackDescriptor> {
        let key = self.by_link.get(link).map(|k| k.clone())?;
        let entry = self.lookup_key(&key)?;
        debug!("⚡ Cache hit for link {}", link);
        Some(entry.into_descriptor(Some(link.to_string())))
    }

    pub fn lookup_by_identity(&self, identity: &TrackIdentity) -> Option<TrackDescriptor> {
        let entry = self.lookup_identity(identity)?;
        debug!("⚡ Cache hit for {}", entry.asset_key);
        Some(entry.into_descriptor(None))
    }

    /// Upserts `track` by asset key, and by its link when it carries one.
    ///
    /// The converted file must already be in place.
    pub async fn record(&self, track: &TrackDescriptor) -> Result<(), CacheError> {
        let path = self.audio_path(&track.asset_key);
        if !path.exists() {
            return Err(CacheError::MissingAsset {
                key: track.asset_key.clone(),
                path,
            });
        }

        self.by_key
            .insert(track.asset_key.clone(), CacheEntry::from(track));
        if let Some(link) = &track.link {
            self.by_link.insert(link.clone(), track.asset_key.clone());
        }

        debug!("💾 Recorded {} ({})", track.title, track.asset_key);
        self.persist().await
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    // An entry stored under the key but for another identity is a miss
    fn lookup_identity(&self, identity: &TrackIdentity) -> Option<CacheEntry> {
        self.lookup_key(&identity.asset_key())
            .filter(|entry| entry.identity == *identity)
    }

    fn lookup_key(&self, key: &AssetKey) -> Option<CacheEntry> {
        let entry = self.by_key.get(key).map(|e| e.clone())?;
        if self.audio_path(key).exists() {
            return Some(entry);
        }

        warn!("🧹 Audio file for {} vanished, dropping entry", key);
        self.by_key.remove(key);
        self.by_link.retain(|_, k| k != key);
        None
    }

    async fn load_index(&self) -> PersistedIndex {
        let path = self.dir.join(INDEX_FILE);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedIndex::default(),
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                return PersistedIndex::default();
            }
        };
        serde_json::from_slice(&content).unwrap_or_else(|e| {
            warn!("Corrupt cache index {}, starting empty: {}", path.display(), e);
            PersistedIndex::default()
        })
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;

        // Snapshot under the lock so the last rewrite contains every prior insert
        let mut entries: Vec<CacheEntry> = self.by_key.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.asset_key.cmp(&b.asset_key));
        let links: BTreeMap<String, AssetKey> = self
            .by_link
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let content = serde_json::to_vec_pretty(&PersistedIndex { entries, links })?;
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE)).await?;
        Ok(())
    }
}
