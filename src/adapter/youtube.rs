//! Platform B adapter (YouTube-class, spec.md §6). The request/response
//! shapes differ from platform A's (snippet-wrapped resources, `pageToken`
//! pagination, a dedicated `playlistItems` resource instead of a
//! sub-path), grounded on how the teacher's second full provider,
//! `TidalProvider` in `api/tidal.rs`, handles a JSON:API-style response
//! body distinct from Spotify's — same overall adapter shape, different
//! field extraction.

use super::{classify_status, Platform, PlatformError, Track};
use crate::tokens::TokenStore;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::sync::Arc;

pub struct YoutubeAdapter {
    client: Client,
    client_id: String,
    client_secret: String,
    tokens: Arc<TokenStore>,
}

impl YoutubeAdapter {
    pub fn new(client: Client, client_id: String, client_secret: String, tokens: Arc<TokenStore>) -> Self {
        Self {
            client,
            client_id,
            client_secret,
            tokens,
        }
    }

    fn auth_base() -> String {
        std::env::var("YOUTUBE_AUTH_BASE").unwrap_or_else(|_| "https://oauth2.googleapis.com".into())
    }

    fn api_base() -> String {
        std::env::var("YOUTUBE_API_BASE").unwrap_or_else(|_| "https://www.googleapis.com/youtube/v3".into())
    }

    async fn bearer(&self) -> Result<String, PlatformError> {
        let token_url = format!("{}/token", Self::auth_base());
        self.tokens
            .bearer(crate::models::Service::B, &token_url, &self.client_id, &self.client_secret)
            .await
            .map_err(PlatformError::AuthFailure)
    }

    fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
        resp.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok())
    }

    /// The playlist resource itself, needed both to read the cached title
    /// and to supply the `channelId`/`id` pair `playlists.update` requires.
    async fn fetch_playlist_snippet(&self, playlist_id: &str) -> Result<serde_json::Value, PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlists?part=snippet&id={}", Self::api_base(), playlist_id);
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, Self::retry_after_secs(&resp)));
        }
        resp.json().await.map_err(|e| PlatformError::Transient(e.into()))
    }
}

#[async_trait]
impl Platform for YoutubeAdapter {
    fn name(&self) -> &'static str {
        "youtube"
    }

    async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, PlatformError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let bearer = self.bearer().await?;
            let mut url = format!(
                "{}/playlistItems?part=snippet,contentDetails&playlistId={}&maxResults=50",
                Self::api_base(),
                playlist_id
            );
            if let Some(tok) = &page_token {
                url.push_str(&format!("&pageToken={}", tok));
            }
            let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(status, Self::retry_after_secs(&resp)));
            }
            let j: serde_json::Value = resp.json().await.map_err(|e| PlatformError::Transient(e.into()))?;
            if let Some(items) = j["items"].as_array() {
                for it in items {
                    let video_id = it["contentDetails"]["videoId"].as_str();
                    let title = it["snippet"]["title"].as_str();
                    if let (Some(id), Some(title)) = (video_id, title) {
                        out.push((id.to_string(), title.to_string()));
                    }
                }
            }
            page_token = j["nextPageToken"].as_str().map(|s| s.to_string());
            if page_token.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn get_playlist_name(&self, playlist_id: &str) -> Result<String, PlatformError> {
        let j = self.fetch_playlist_snippet(playlist_id).await?;
        j["items"][0]["snippet"]["title"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| PlatformError::Fatal(super::FatalKind::NotFound))
    }

    async fn search_track(&self, title: &str) -> Result<Option<String>, PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!(
            "{}/search?part=snippet&type=video&maxResults=1&q={}",
            Self::api_base(),
            urlencoding::encode(title)
        );
        let resp = self.client.get(&url).header(AUTHORIZATION, &bearer).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, Self::retry_after_secs(&resp)));
        }
        let j: serde_json::Value = resp.json().await.map_err(|e| PlatformError::Transient(e.into()))?;
        Ok(j["items"][0]["id"]["videoId"].as_str().map(|s| s.to_string()))
    }

    async fn add_track(&self, playlist_id: &str, track_id: &str) -> Result<(), PlatformError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/playlistItems?part=snippet", Self::api_base());
        let body = serde_json::json!({
            "snippet": {
                "playlistId": playlist_id,
                "resourceId": { "kind": "youtube#video", "videoId": track_id }
            }
        });
        let resp = self.client.post(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_status(status, Self::retry_after_secs(&resp)))
    }

    async fn rename_playlist(&self, playlist_id: &str, new_name: &str) -> Result<(), PlatformError> {
        let snippet = self.fetch_playlist_snippet(playlist_id).await?;
        let mut current_snippet = snippet["items"][0]["snippet"].clone();
        if current_snippet.is_null() {
            return Err(PlatformError::Fatal(super::FatalKind::NotFound));
        }
        current_snippet["title"] = serde_json::Value::String(new_name.to_string());

        let bearer = self.bearer().await?;
        let url = format!("{}/playlists?part=snippet", Self::api_base());
        let body = serde_json::json!({ "id": playlist_id, "snippet": current_snippet });
        let resp = self.client.put(&url).header(AUTHORIZATION, &bearer).json(&body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(classify_status(status, Self::retry_after_secs(&resp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Service, StoredToken};

    async fn adapter_with_valid_token(server: &mockito::ServerGuard) -> YoutubeAdapter {
        std::env::set_var("YOUTUBE_API_BASE", server.url());
        std::env::set_var("YOUTUBE_AUTH_BASE", server.url());
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::save_token(
                &conn,
                Service::B,
                &StoredToken {
                    access_token: "valid".into(),
                    refresh_token: Some("refresh".into()),
                    expiry: chrono::Utc::now().timestamp() + 3600,
                    scopes: "playlist".into(),
                },
            )
            .unwrap();
        }
        let tokens = TokenStore::new(db_path, Client::new(), 30);
        YoutubeAdapter::new(Client::new(), "id".into(), "secret".into(), tokens)
    }

    #[tokio::test]
    async fn list_tracks_follows_next_page_token() {
        let mut server = mockito::Server::new_async().await;
        let _m1 = server
            .mock("GET", mockito::Matcher::Regex(r"^/playlistItems\?part=snippet,contentDetails&playlistId=p1&maxResults=50$".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"contentDetails":{"videoId":"v1"},"snippet":{"title":"Song 1"}}],"nextPageToken":"abc"}"#)
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", mockito::Matcher::Regex(r"^/playlistItems.*pageToken=abc$".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"contentDetails":{"videoId":"v2"},"snippet":{"title":"Song 2"}}]}"#)
            .create_async()
            .await;
        let adapter = adapter_with_valid_token(&server).await;
        let tracks = adapter.list_tracks("p1").await.unwrap();
        assert_eq!(tracks, vec![("v1".to_string(), "Song 1".to_string()), ("v2".to_string(), "Song 2".to_string())]);
    }

    #[tokio::test]
    async fn search_track_returns_none_when_items_empty() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Regex(r"^/search.*".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[]}"#)
            .create_async()
            .await;
        let adapter = adapter_with_valid_token(&server).await;
        assert_eq!(adapter.search_track("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn add_track_maps_403_to_fatal_forbidden() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/playlistItems?part=snippet")
            .with_status(403)
            .create_async()
            .await;
        let adapter = adapter_with_valid_token(&server).await;
        let err = adapter.add_track("p1", "v1").await.unwrap_err();
        assert!(matches!(err, PlatformError::Fatal(super::super::FatalKind::Forbidden)));
    }
}
