use async_process::Command;
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    cache::{AssetCache, PLAYBACK_EXTENSION},
    error::PipelineError,
    sources::{AssetKey, AudioFetcher, TrackDescriptor},
};

/// Converts raw downloaded audio into the playback format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(&self, key: &AssetKey, input: &Path, output: &Path) -> Result<(), PipelineError>;
}

/// Runs the bundled conversion script: `gen.sh` through bash, or `gen.bat`
/// on Windows. Both wrap the same ffmpeg invocation.
pub struct ScriptTranscoder {
    scripts_dir: PathBuf,
}

impl ScriptTranscoder {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    #[cfg(windows)]
    fn command(&self) -> Command {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(self.scripts_dir.join("gen.bat"));
        command
    }

    #[cfg(not(windows))]
    fn command(&self) -> Command {
        let mut command = Command::new("bash");
        command.arg(self.scripts_dir.join("gen.sh"));
        command
    }
}

#[async_trait]
impl Transcoder for ScriptTranscoder {
    async fn convert(&self, key: &AssetKey, input: &Path, output: &Path) -> Result<(), PipelineError> {
        debug!("🎛️ Converting {} -> {}", input.display(), output.display());

        let result = self.command().arg(input).arg(output).output().await?;
        if !result.status.success() {
            return Err(PipelineError::Convert {
                key: key.clone(),
                message: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.exists() {
            return Err(PipelineError::Convert {
                key: key.clone(),
                message: format!("no output at {}", output.display()),
            });
        }
        Ok(())
    }
}

/// Fetch, convert and record one track.
///
/// Scratch and partial files carry a per-run nonce and the final file only
/// appears through a rename, so a reader never sees a half-written asset.
/// Runs for the same asset key queue behind each other; the second one finds
/// the asset cached and returns without downloading.
pub struct DownloadPipeline {
    cache: Arc<AssetCache>,
    fetcher: Arc<dyn AudioFetcher>,
    transcoder: Arc<dyn Transcoder>,
    download_dir: PathBuf,
    in_flight: DashMap<AssetKey, Arc<Mutex<()>>>,
}

impl DownloadPipeline {
    pub fn new(
        cache: Arc<AssetCache>,
        fetcher: Arc<dyn AudioFetcher>,
        transcoder: Arc<dyn Transcoder>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            transcoder,
            download_dir: download_dir.into(),
            in_flight: DashMap::new(),
        }
    }

    pub async fn run(&self, track: &TrackDescriptor) -> Result<(), PipelineError> {
        let key = track.asset_key.clone();
        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.run_exclusive(track).await
        };

        // Only the map and this run hold the lock: nobody is waiting on it
        self.in_flight.remove_if(&key, |_, l| Arc::strong_count(l) == 2);
        result
    }

    async fn run_exclusive(&self, track: &TrackDescriptor) -> Result<(), PipelineError> {
        let key = &track.asset_key;
        if self.cache.is_cached(&track.identity) {
            debug!("⚡ {} already converted", key);
            // Still index the link this request came in with
            self.cache.record(track).await?;
            return Ok(());
        }

        fs::create_dir_all(&self.download_dir).await?;
        let nonce = fastrand::u64(..);
        let scratch = self.download_dir.join(format!("{}-{:016x}.m4a", key, nonce));
        let part = self
            .cache
            .dir()
            .join(format!("{}.{}.{:016x}.part", key, PLAYBACK_EXTENSION, nonce));

        let converted = self.fetch_and_convert(track, &scratch, &part).await;
        remove_quietly(&scratch).await;

        if let Err(e) = converted {
            remove_quietly(&part).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&part, self.cache.audio_path(key)).await {
            remove_quietly(&part).await;
            return Err(e.into());
        }

        self.cache.record(track).await?;
        info!("✅ Cached {} ({})", track.title, key);
        Ok(())
    }

    async fn fetch_and_convert(
        &self,
        track: &TrackDescriptor,
        scratch: &Path,
        part: &Path,
    ) -> Result<(), PipelineError> {
        self.fetcher.fetch(track, scratch).await?;
        self.transcoder.convert(&track.asset_key, scratch, part).await
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
