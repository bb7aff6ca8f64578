//! Authentication backend used to exchange a refresh token for new tokens.
//!
//! The refresh call goes straight to the backend on its own client: it is
//! never stamped by the interceptor and a 401 from it is a refresh failure,
//! not something to recover from.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RefreshError;
use crate::auth::TokenPair;

/// Raw refresh response, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshGrant {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl RefreshGrant {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    /// Turn the grant into the next token pair.
    ///
    /// A grant without a non-empty access token is unusable. A grant without
    /// a refresh token keeps `previous_refresh` (the server did not rotate it).
    pub fn into_pair(self, previous_refresh: &str) -> Result<TokenPair, RefreshError> {
        let access_token = self
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| RefreshError::InvalidResponse("missing accessToken".to_string()))?;
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| previous_refresh.to_string());
        Ok(TokenPair {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
        })
    }
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, RefreshError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

/// Refreshes against `POST <refresh_url>` with `{"refreshToken": ...}`.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    refresh_url: String,
}

impl HttpAuthBackend {
    pub fn new(refresh_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::from_client(client, refresh_url))
    }

    pub fn from_client(client: Client, refresh_url: impl Into<String>) -> Self {
        Self {
            client,
            refresh_url: refresh_url.into(),
        }
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, RefreshError> {
        let response = self
            .client
            .post(&self.refresh_url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshBody { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Refresh endpoint rejected token");
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| RefreshError::InvalidResponse(e.to_string()))
    }
}
