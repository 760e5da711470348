use anyhow::Context;
use serde::de::DeserializeOwned;

use chatline_types::api::{AuthResponse, LoginRequest};
use chatline_types::models::ChatMessage;
use chatline_types::{GroupId, UserId};

/// REST client for the history endpoints, used to backfill a view after
/// (re)joining.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Log in and return a client carrying the issued token.
    pub async fn login(
        base_url: impl Into<String>,
        username: &str,
        password: &str,
    ) -> anyhow::Result<(Self, AuthResponse)> {
        let base_url = base_url.into();
        let url = format!("{}/api/login", base_url.trim_end_matches('/'));
        let auth: AuthResponse = reqwest::Client::new()
            .post(url)
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .context("login request failed")?
            .error_for_status()
            .context("login rejected")?
            .json()
            .await
            .context("invalid login response")?;

        Ok((Self::new(base_url, auth.token.clone()), auth))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn direct_history(&self, friend_id: UserId) -> anyhow::Result<Vec<ChatMessage>> {
        self.get(&format!("/api/messages/{}", friend_id)).await
    }

    pub async fn group_history(&self, group_id: GroupId) -> anyhow::Result<Vec<ChatMessage>> {
        self.get(&format!("/api/groups/{}/messages", group_id)).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?
            .error_for_status()
            .with_context(|| format!("GET {} rejected", path))?
            .json()
            .await
            .with_context(|| format!("GET {} returned invalid JSON", path))
    }
}
