use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};

/// Config file read when `BOT_CONFIG_PATH` is not set. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub prefix: String,

    // Spotify (optional, playlists only)
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Paths
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
    pub scripts_dir: PathBuf,

    // Limits
    pub search_limit: usize,
    pub max_playlist_size: usize,
    pub max_concurrent_downloads: usize,
}

impl Config {
    /// Loads `.env`, the optional YAML file and the environment, in that
    /// order of precedence (environment wins), then creates the working
    /// directories.
    ///
    /// Environment keys use the `MUSICBOT_` prefix (`MUSICBOT_CACHE_DIR`,
    /// `MUSICBOT_PREFIX`, ...). `DISCORD_TOKEN`, `SPOTIFY_CLIENT_ID` and
    /// `SPOTIFY_CLIENT_SECRET` are also accepted unprefixed.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = env::var_os("BOT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let config = Self::from_sources(Some(&path))
            .with_context(|| format!("Could not load configuration ({})", path.display()))?;

        config.validate()?;

        for dir in [&config.cache_dir, &config.download_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }

        Ok(config)
    }

    fn from_sources(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let config = builder
            .add_source(::config::Environment::with_prefix("MUSICBOT").try_parsing(true))
            .set_override_option("discord_token", env::var("DISCORD_TOKEN").ok())?
            .set_override_option("spotify_client_id", env::var("SPOTIFY_CLIENT_ID").ok())?
            .set_override_option("spotify_client_secret", env::var("SPOTIFY_CLIENT_SECRET").ok())?
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Discord token and command prefix must be present
    /// - Search and playlist limits must be greater than 0
    /// - Spotify credentials come as a pair or not at all
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("Discord token is missing (set DISCORD_TOKEN or discord_token)");
        }

        if self.prefix.trim().is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }

        if self.search_limit == 0 {
            anyhow::bail!("Search limit must be greater than 0");
        }

        if self.max_playlist_size == 0 {
            anyhow::bail!("Max playlist size must be greater than 0");
        }

        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("Max concurrent downloads must be greater than 0");
        }

        let id = non_empty(&self.spotify_client_id);
        let secret = non_empty(&self.spotify_client_secret);
        if id.is_some() != secret.is_some() {
            anyhow::bail!("Spotify client ID and secret must be set together");
        }

        Ok(())
    }

    /// Client credentials when playlist support is configured.
    pub fn spotify_credentials(&self) -> Option<(&str, &str)> {
        Some((
            non_empty(&self.spotify_client_id)?,
            non_empty(&self.spotify_client_secret)?,
        ))
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Tokens and secrets are left out.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Prefix: {}\n  \
            Spotify playlists: {}\n  \
            Paths: cache={}, download={}, scripts={}\n  \
            Limits: {} search results, {} playlist tracks, {} concurrent downloads",
            self.prefix,
            if self.spotify_credentials().is_some() { "enabled" } else { "disabled" },
            self.cache_dir.display(),
            self.download_dir.display(),
            self.scripts_dir.display(),
            self.search_limit,
            self.max_playlist_size,
            self.max_concurrent_downloads,
        )
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Default configuration values.
///
/// Used as fallbacks for anything the file and environment leave out.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no default token - must be provided)
            discord_token: String::new(),
            prefix: "!".to_string(),

            spotify_client_id: None,
            spotify_client_secret: None,

            // Path defaults
            cache_dir: "./audio_cache".into(),
            download_dir: "./download".into(),
            scripts_dir: "./scripts".into(),

            // Limit defaults
            search_limit: 1,
            max_playlist_size: 100,
            max_concurrent_downloads: 4,
        }
    }
}
