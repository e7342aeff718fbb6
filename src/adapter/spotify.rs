//! Platform A adapter (Spotify-class, spec.md §6). Grounded on the
//! teacher's `SpotifyProvider` in `api/spotify.rs`: same pagination-by-`next`
//! list call, same Basic-auth refresh header shape, same env-var base-URL
//! overrides for tests — rebuilt against the trimmed `Platform` trait and
//! the shared `TokenStore`/`PlatformError` types.

use super::{classify_status, Platform, PlatformError, Track};
use crate::tokens::TokenStore;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::sync::Arc;

pub struct SpotifyAdapter {
    client: Client,
    client_id: String,
    client_secret: String,
    tokens: Arc<TokenStore>,
}

impl SpotifyAdapter {
    pub fn new(client: Client, client_id: String, client_secret: String, tokens: Arc<TokenStore>) -> Self {
        Self {
            client,
            client_id,
            client_secret,
            tokens,
        }
    }

    fn auth_base() -> String {
        std::env::var("SPOTIFY_AUTH_BASE").unwrap_or_else(|_| "https://accounts.spotify.com".into())
    }

    fn api_base() -> String {
        std::env::var("SPOTIFY_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into())
    }

    async fn bearer(&self) -> Result<String, PlatformError> {
        let token_url = format!("{}/api/token", Self::auth_base());
        self.tokens
            .bearer(crate::models::Service::A, &token_url, &self.client_id, &self.client_secret)
            .await
            .map_err(PlatformError::AuthFailure)
    }

    fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
        resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl Platform for SpotifyAdapter {
    fn name(&self) -> &'static str {
        "spotify"
    }

    async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, PlatformError> {
        let mut out = Vec::new();
        let mut next = Some(format!(
            "{}/playlists/{}/tracks?fields=items(track(id,name)),next&limit=100",
            Self::api_base(),
            playlist_id
        ));
        while let Some(url) = next {
            let bearer = self.bearer().await?;
            let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(status, Self::retry_after_secs(&resp)));
            }
            let j: serde_json::Value = resp.json().await.map_err(|e| PlatformError::Transient(e.into()))?;
            if let Some(items) = j["items"].as_array() {
                for it in items {
                    let id = it["track"]["id"].as_str();
                    let name = it["track"]["name"].as_str();
                    if let (Some(id), Some(name)) = (id, name) {
                        out.push((id.to_string(), name.to_string()));
                    }
                }
            }
            next = j["next"].as_str().map(|s| s.to_string());
        }
        Ok(out)
    }

    async fn get_playlist_name(&self, playlist_id: &str) -> Result<String, PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists/{}?fields=name", Self::api_base(), playlist_id);
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, Self::retry_after_secs(&resp)));
        }
        let j: serde_json::Value = resp.json().await.map_err(|e| PlatformError::Transient(e.into()))?;
        j["name"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| PlatformError::Transient(anyhow::anyhow!("playlist response missing name")))
    }

    async fn search_track(&self, title: &str) -> Result<Option<String>, PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!(
            "{}/search?q={}&type=track&limit=1",
            Self::api_base(),
            urlencoding::encode(title)
        );
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, Self::retry_after_secs(&resp)));
        }
        let j: serde_json::Value = resp.json().await.map_err(|e| PlatformError::Transient(e.into()))?;
        Ok(j["tracks"]["items"][0]["id"].as_str().map(|s| s.to_string()))
    }

    async fn add_track(&self, playlist_id: &str, track_id: &str) -> Result<(), PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists/{}/tracks", Self::api_base(), playlist_id);
        let body = serde_json::json!({ "uris": [format!("spotify:track:{}", track_id)] });
        let resp = self.client.post(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_status(status, Self::retry_after_secs(&resp)))
    }

    async fn rename_playlist(&self, playlist_id: &str, new_name: &str) -> Result<(), PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists/{}", Self::api_base(), playlist_id);
        let body = serde_json::json!({ "name": new_name });
        let resp = self.client.put(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_status(status, Self::retry_after_secs(&resp)))
    }
}
