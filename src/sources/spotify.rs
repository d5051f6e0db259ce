use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64_ENGINE, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{PlaylistApi, PlaylistItem};
use crate::error::ExternalApiError;

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";
const PAGE_SIZE: usize = 100;

/// Spotify Web API client for playlist expansion.
///
/// The client-credentials token is exchanged once in [`SpotifyClient::connect`]
/// and held for the lifetime of the process.
pub struct SpotifyClient {
    http: Client,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TracksPage {
    items: Vec<PlaylistEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    // null for removed or local-only tracks
    track: Option<SpotifyTrack>,
}

#[derive(Debug, Deserialize)]
struct SpotifyTrack {
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

impl SpotifyClient {
    /// Performs the client-credentials exchange.
    pub async fn connect(client_id: &str, client_secret: &str) -> Result<Self, ExternalApiError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let auth = B64_ENGINE.encode(format!("{}:{}", client_id, client_secret));
        let response = http
            .post(TOKEN_URL)
            .header("Authorization", format!("Basic {}", auth))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalApiError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        info!("🎧 Spotify token acquired");

        Ok(Self {
            http,
            access_token: token.access_token,
        })
    }
}

#[async_trait]
impl PlaylistApi for SpotifyClient {
    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistItem>, ExternalApiError> {
        let mut next = Some(format!(
            "{}/playlists/{}/tracks?limit={}&fields=items(track(name,artists(name))),next",
            API_BASE, playlist_id, PAGE_SIZE
        ));
        let mut items = Vec::new();

        while let Some(url) = next.take() {
            debug!("📄 Fetching playlist page {}", url);
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.access_token)
                .send()
                .await?;
            if let Some(e) = rejected_reference(response.status(), playlist_id) {
                return Err(e);
            }
            let page: TracksPage = response.error_for_status()?.json().await?;

            items.extend(page.items.into_iter().filter_map(|entry| {
                let track = entry.track?;
                match track.artists.into_iter().next() {
                    Some(artist) => Some(PlaylistItem {
                        title: track.name,
                        artist: artist.name,
                    }),
                    None => {
                        warn!("Skipping playlist track without artist: {}", track.name);
                        None
                    }
                }
            }));
            next = page.next;
        }

        info!("📄 Playlist {} has {} tracks", playlist_id, items.len());
        Ok(items)
    }
}

/// Spotify answers unknown or malformed playlist IDs with 404 / 400.
fn rejected_reference(status: StatusCode, playlist_id: &str) -> Option<ExternalApiError> {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST)
        .then(|| ExternalApiError::InvalidReference(playlist_id.to_string()))
}

/// Extracts the playlist ID from `spotify:playlist:<id>` or an
/// `open.spotify.com/playlist/<id>` URL.
pub fn parse_playlist_id(reference: &str) -> Option<String> {
    if let Some(id) = reference.strip_prefix("spotify:playlist:") {
        return valid_id(id);
    }

    let url = Url::parse(reference).ok()?;
    if url.host_str() != Some("open.spotify.com") {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    // Localised links look like /intl-de/playlist/<id>
    let mut segment = segments.next()?;
    if segment.starts_with("intl-") {
        segment = segments.next()?;
    }
    if segment != "playlist" {
        return None;
    }
    valid_id(segments.next()?)
}

fn valid_id(id: &str) -> Option<String> {
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_playlist_id() {
        assert_eq!(parse_playlist_id("spotify:playlist:abc123").as_deref(), Some("abc123"));
        assert_eq!(
            parse_playlist_id("https://open.spotify.com/playlist/abc123?si=xyz").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            parse_playlist_id("https://open.spotify.com/intl-de/playlist/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(parse_playlist_id("https://open.spotify.com/track/abc123"), None);
        assert_eq!(parse_playlist_id("spotify:playlist:"), None);
        assert_eq!(parse_playlist_id("https://www.youtube.com/playlist?list=PL1"), None);
        assert_eq!(parse_playlist_id("some search words"), None);
    }

    #[test]
    fn test_tracks_page_tolerates_missing_tracks() {
        let json = r#"{
            "items": [
                {"track": {"name": "Song", "artists": [{"name": "Band"}, {"name": "Guest"}]}},
                {"track": null},
                {"track": {"name": "Orphan", "artists": []}}
            ],
            "next": null
        }"#;
        let page: TracksPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.items[1].track.is_none());
        assert!(page.next.is_none());
    }

    #[test]
    fn test_unknown_playlist_is_an_invalid_reference() {
        assert!(matches!(
            rejected_reference(StatusCode::NOT_FOUND, "nope"),
            Some(ExternalApiError::InvalidReference(id)) if id == "nope"
        ));
        assert!(rejected_reference(StatusCode::BAD_REQUEST, "nope").is_some());
        assert!(rejected_reference(StatusCode::OK, "pl1").is_none());
        assert!(rejected_reference(StatusCode::TOO_MANY_REQUESTS, "pl1").is_none());
    }
}
