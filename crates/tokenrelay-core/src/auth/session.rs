use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{TokenPair, TokenStore};
use crate::storage::{KeyValueStore, USER_DATA_KEY};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub signed_in_at: DateTime<Utc>,
}

impl SessionUser {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            signed_in_at: Utc::now(),
        }
    }
}

/// Fields of the signed-in user that may change mid-session
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// A signed-in user and their tokens.
///
/// Tokens live in the shared `TokenStore` (hand `tokens()` to the API
/// client); the user profile is kept alongside them as JSON.
pub struct Session {
    tokens: TokenStore,
    durable: Arc<dyn KeyValueStore>,
    user: RwLock<Option<SessionUser>>,
}

impl Session {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tokens: TokenStore::new(Arc::clone(&durable)),
            durable,
            user: RwLock::new(None),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.user.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.get().access_token.is_some()
    }

    /// Load tokens and user from storage. Returns whether a session was found.
    pub async fn restore(&self) -> bool {
        self.tokens.load().await;

        let user = match self.durable.get(USER_DATA_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<SessionUser>(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable user data");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to load user data");
                None
            }
        };
        self.replace_user(user);
        self.is_authenticated()
    }

    pub async fn sign_in(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        user: Option<SessionUser>,
    ) {
        self.tokens.set(TokenPair::new(access_token, refresh_token));
        match user {
            Some(ref user) => {
                if let Err(e) = self.persist_user(user).await {
                    warn!(error = %e, "Failed to persist user data");
                }
                info!(user = %user.email, "Signed in");
            }
            None => {
                // Do not let a previous user's profile come back on restore
                if let Err(e) = self.durable.remove(USER_DATA_KEY).await {
                    warn!(error = %e, "Failed to remove user data");
                }
                info!("Signed in");
            }
        }
        self.replace_user(user);
    }

    pub async fn sign_out(&self) {
        self.tokens.clear();
        self.replace_user(None);
        if let Err(e) = self.durable.remove(USER_DATA_KEY).await {
            warn!(error = %e, "Failed to remove user data");
        }
        info!("Signed out");
    }

    pub async fn update_user(&self, update: UserUpdate) -> Result<SessionUser> {
        let mut user = self
            .user()
            .ok_or_else(|| anyhow::anyhow!("No user data available"))?;
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(name) = update.name {
            user.name = name;
        }
        self.persist_user(&user).await?;
        self.replace_user(Some(user.clone()));
        Ok(user)
    }

    async fn persist_user(&self, user: &SessionUser) -> Result<()> {
        let json = serde_json::to_string(user)?;
        self.durable
            .set(USER_DATA_KEY, &json)
            .await
            .context("Failed to store user data")
    }

    fn replace_user(&self, user: Option<SessionUser>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = user;
    }
}
