//! C2 Token Store & Refresher (spec.md §4.2). Caches the access token for
//! each service in memory and refreshes it ahead of expiry, persisting the
//! new token back to sqlite. Grounded on the teacher's
//! `SpotifyProvider::ensure_token`/`refresh_token_internal` pair in
//! `api/spotify.rs`, generalized from one hardcoded provider to any
//! service behind the `Platform` trait.

use crate::models::{Service, StoredToken};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-service OAuth token cache, backed by the `oauth_tokens` table.
pub struct TokenStore {
    db_path: PathBuf,
    client: Client,
    refresh_margin_secs: i64,
    slots: [Mutex<Option<StoredToken>>; 2],
}

fn slot_index(service: Service) -> usize {
    match service {
        Service::A => 0,
        Service::B => 1,
    }
}

impl TokenStore {
    pub fn new(db_path: PathBuf, client: Client, refresh_margin_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            db_path,
            client,
            refresh_margin_secs,
            slots: [Mutex::new(None), Mutex::new(None)],
        })
    }

    async fn load_from_db(&self, service: Service) -> Result<Option<StoredToken>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<StoredToken>> {
            let conn = rusqlite::Connection::open(db_path)?;
            crate::db::load_token(&conn, service)
        })
        .await?
    }

    async fn persist_to_db(&self, service: Service, token: &StoredToken) -> Result<()> {
        let db_path = self.db_path.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = rusqlite::Connection::open(db_path)?;
            crate::db::save_token(&conn, service, &token)
        })
        .await?
    }

    /// Current bearer header value for `service`, refreshing first if the
    /// cached token is within `refresh_margin_secs` of expiry (spec.md §4.2
    /// "Refresh").
    pub async fn bearer(&self, service: Service, token_url: &str, client_id: &str, client_secret: &str) -> Result<String> {
        let mut slot = self.slots[slot_index(service)].lock().await;
        if slot.is_none() {
            *slot = self.load_from_db(service).await?;
        }
        let needs_refresh = match &*slot {
            Some(st) => chrono::Utc::now().timestamp() + self.refresh_margin_secs >= st.expiry,
            None => true,
        };
        if needs_refresh {
            let refresh_token = slot
                .as_ref()
                .and_then(|st| st.refresh_token.clone())
                .ok_or_else(|| anyhow!("no refresh token stored for service {}", service))?;
            debug!(service = %service, "refreshing oauth token");
            let refreshed = self
                .refresh(token_url, client_id, client_secret, &refresh_token)
                .await?;
            self.persist_to_db(service, &refreshed).await?;
            *slot = Some(refreshed);
        }
        let st = slot.as_ref().expect("token populated above");
        Ok(format!("Bearer {}", st.access_token))
    }

    /// Seed the store with a token obtained out-of-band (e.g. the initial
    /// OAuth authorization-code exchange, which is outside this crate's
    /// scope; spec.md §2 Non-goals).
    pub async fn seed(&self, service: Service, token: StoredToken) -> Result<()> {
        self.persist_to_db(service, &token).await?;
        *self.slots[slot_index(service)].lock().await = Some(token);
        Ok(())
    }

    async fn refresh(&self, token_url: &str, client_id: &str, client_secret: &str, refresh_token: &str) -> Result<StoredToken> {
        let auth_header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", client_id, client_secret))
        );
        let params = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        let resp = self
            .client
            .post(token_url)
            .header(AUTHORIZATION, auth_header)
            .form(&params)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("token refresh failed: {} - {}", status, body));
        }
        let j: serde_json::Value = resp.json().await?;
        let access_token = j["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("token response missing access_token"))?
            .to_string();
        let expires_in = j["expires_in"].as_i64().unwrap_or(3600);
        let scope = j["scope"].as_str().unwrap_or_default().to_string();
        // Many providers omit refresh_token on a refresh response, in which
        // case the existing one remains valid.
        let new_refresh = j["refresh_token"].as_str().map(|s| s.to_string()).or_else(|| Some(refresh_token.to_string()));
        Ok(StoredToken {
            access_token,
            refresh_token: new_refresh,
            expiry: chrono::Utc::now().timestamp() + expires_in,
            scopes: scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bearer_refreshes_when_token_near_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-access","expires_in":3600,"scope":"playlist"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sync.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            crate::db::run_migrations(&conn).unwrap();
            crate::db::save_token(
                &conn,
                Service::A,
                &StoredToken {
                    access_token: "stale".into(),
                    refresh_token: Some("refresh-tok".into()),
                    expiry: chrono::Utc::now().timestamp() - 5,
                    scopes: "playlist".into(),
                },
            )
            .unwrap();
        }

        let store = TokenStore::new(db_path, Client::new(), 30);
        let token_url = format!("{}/token", server.url());
        let bearer = store.bearer(Service::A, &token_url, "id", "secret").await.unwrap();
        assert_eq!(bearer, "Bearer new-access");
        mock.assert_async().await;
    }
}
