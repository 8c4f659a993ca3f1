//! Profile source client.
//!
//! Profiles live in the website's database; the chat server only mirrors
//! them. Responses are decoded leniently: every field is optional so a
//! partial profile still updates what it can.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::permissions::Permissions;
use crate::error::ProfileError;

/// Profile payload as returned by the profile source.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileRecord {
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub avatars: Option<Vec<String>>,
    pub stars: Option<i64>,
    pub level: Option<i64>,
    pub permissions: Option<PermissionRecord>,
    pub banned_until: Option<DateTime<Utc>>,
    pub joined: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub badges: Option<Vec<String>>,
    pub shadow_banned: Option<bool>,
    pub hiding: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionRecord {
    pub staff: bool,
    pub global_chat: bool,
    pub chat_control: bool,
}

impl PermissionRecord {
    pub fn to_permissions(&self) -> Permissions {
        let mut perms = Permissions::empty();
        perms.set(Permissions::STAFF, self.staff);
        perms.set(Permissions::GLOBAL_CHAT, self.global_chat);
        perms.set(Permissions::CHAT_CONTROL, self.chat_control);
        perms
    }
}

/// Looks up a profile by user id.
pub trait ProfileSource: Send + Sync {
    fn fetch(&self, uid: u64) -> BoxFuture<'_, Result<ProfileRecord, ProfileError>>;
}

/// HTTP profile source: `GET {base_url}/{uid}` returning a JSON profile.
#[derive(Clone)]
pub struct HttpProfileSource {
    client: Client,
    base_url: String,
}

impl HttpProfileSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProfileError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProfileError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_profile(&self, uid: u64) -> Result<ProfileRecord, ProfileError> {
        let url = format!("{}/{}", self.base_url, uid);
        debug!(%url, "fetching profile");

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProfileError::Timeout
            } else {
                ProfileError::Transport(e.to_string())
            }
        })?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(ProfileError::NotFound(uid)),
            s if !s.is_success() => return Err(ProfileError::Status(s.as_u16())),
            _ => {}
        }

        let body = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProfileError::Timeout
            } else {
                ProfileError::Transport(e.to_string())
            }
        })?;

        serde_json::from_slice::<ProfileRecord>(&body).map_err(|e| {
            warn!(uid, error = %e, "garbled profile response");
            ProfileError::Malformed(e.to_string())
        })
    }
}

impl ProfileSource for HttpProfileSource {
    fn fetch(&self, uid: u64) -> BoxFuture<'_, Result<ProfileRecord, ProfileError>> {
        Box::pin(self.fetch_profile(uid))
    }
}
