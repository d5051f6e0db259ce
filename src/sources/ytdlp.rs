use async_process::Command;
use async_trait::async_trait;
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{AudioFetcher, MetadataExtractor, TrackDescriptor, TrackIdentity, TrackRecord};
use crate::error::{PipelineError, ResolutionError};

/// Client for the yt-dlp command line tool.
///
/// Covers metadata extraction (`-j`), search (`--get-id ytsearchN:`) and raw
/// audio download (`-x --audio-format m4a`).
pub struct YtDlpClient {
    binary: String,
    // Caps concurrent yt-dlp processes to stay under upstream rate limits
    rate_limiter: Semaphore,
}

/// Subset of the `-j` JSON output we care about.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    extractor: String,
    title: String,
    duration: Option<f64>,
    webpage_url: String,
}

impl From<YtDlpInfo> for TrackRecord {
    fn from(info: YtDlpInfo) -> Self {
        Self {
            identity: TrackIdentity::new(info.id, info.extractor),
            title: info.title,
            duration: info
                .duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(Duration::from_secs_f64),
            webpage_url: info.webpage_url,
        }
    }
}

impl YtDlpClient {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            rate_limiter: Semaphore::new(max_concurrent.max(1)),
        }
    }

    /// Checks that the binary is installed and runnable.
    pub async fn verify(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("{} --version exited with {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parses newline-delimited JSON records lazily, skipping any line that does
/// not deserialize.
pub fn parse_records(stdout: &str) -> impl Iterator<Item = TrackRecord> + '_ {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<YtDlpInfo>(line) {
            Ok(info) => Some(TrackRecord::from(info)),
            Err(e) => {
                warn!("Skipping malformed yt-dlp record: {}", e);
                None
            }
        })
}

/// Parses `--get-id` output, one ID per line.
pub fn parse_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl MetadataExtractor for YtDlpClient {
    async fn extract(&self, link: &str) -> Result<Vec<TrackRecord>, ResolutionError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolutionError::Extractor {
                target: link.to_string(),
                message: e.to_string(),
            })?;

        debug!("📊 Extracting metadata for {}", link);

        let output = Command::new(&self.binary)
            .args(["--ignore-errors", "-q", "--no-warnings", "-j", link])
            .output()
            .await?;

        // --ignore-errors can exit non-zero with usable records on stdout
        let stdout = String::from_utf8_lossy(&output.stdout);
        let records: Vec<TrackRecord> = parse_records(&stdout).collect();

        if records.is_empty() && !output.status.success() {
            return Err(ResolutionError::Extractor {
                target: link.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("📊 {} record(s) for {}", records.len(), link);
        Ok(records)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ResolutionError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolutionError::Extractor {
                target: query.to_string(),
                message: e.to_string(),
            })?;

        info!("🔍 Searching: {}", query);

        let search = format!("ytsearch{}:{}", limit.max(1), query);
        let output = Command::new(&self.binary)
            .args(["--no-warnings", "--get-id", &search])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ResolutionError::Extractor {
                target: query.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_ids(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl AudioFetcher for YtDlpClient {
    async fn fetch(&self, track: &TrackDescriptor, dest: &Path) -> Result<(), PipelineError> {
        let fetch_error = |message: String| PipelineError::Fetch {
            key: track.asset_key.clone(),
            message,
        };

        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        info!("⬇️ Downloading {} ({})", track.title, track.asset_key);

        let output = Command::new(&self.binary)
            .arg("-q")
            .arg("--no-warnings")
            .arg("-o")
            .arg(dest)
            .args(["-x", "--audio-format", "m4a"])
            .arg(&track.webpage_url)
            .output()
            .await?;

        if !output.status.success() {
            return Err(fetch_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        if !dest.exists() {
            return Err(fetch_error(format!("no output at {}", dest.display())));
        }

        Ok(())
    }
}
