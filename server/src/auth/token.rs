use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::{debug, info};

/// A token and when it stops being valid.
#[derive(Debug, Clone)]
struct AuthData {
    key: String,
    expires: DateTime<Utc>,
}

impl AuthData {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }
}

/// Issues short-lived per-identity tokens the chat endpoint checks on bind.
///
/// A token is generated lazily and only replaced once it has expired, so
/// asking twice within its lifetime returns the same token.
#[derive(Debug)]
pub struct TokenAuthority {
    tokens: Mutex<HashMap<String, AuthData>>,
    lifetime: Duration,
}

impl TokenAuthority {
    pub fn new(lifetime: std::time::Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            lifetime: Duration::from_std(lifetime).unwrap_or_else(|_| Duration::minutes(5)),
        }
    }

    pub fn issue_or_get(&self, identity: &str) -> String {
        self.issue_or_get_at(identity, Utc::now())
    }

    /// Blank identities get a random token that is never stored.
    pub fn issue_or_get_at(&self, identity: &str, now: DateTime<Utc>) -> String {
        let identity = identity.trim();
        if identity.is_empty() {
            return generate_token();
        }

        let mut tokens = self.lock();
        match tokens.get(identity) {
            Some(data) if !data.is_expired(now) => data.key.clone(),
            _ => {
                let key = generate_token();
                tokens.insert(
                    identity.to_string(),
                    AuthData {
                        key: key.clone(),
                        expires: now + self.lifetime,
                    },
                );
                debug!(%identity, "issued auth token");
                key
            }
        }
    }

    pub fn validate(&self, identity: &str, token: &str) -> bool {
        self.validate_at(identity, token, Utc::now())
    }

    pub fn validate_at(&self, identity: &str, token: &str, now: DateTime<Utc>) -> bool {
        let identity = identity.trim();
        if identity.is_empty() || token.is_empty() {
            return false;
        }
        self.lock()
            .get(identity)
            .is_some_and(|data| !data.is_expired(now) && constant_time_eq(&data.key, token))
    }

    pub fn reconcile(&self, active: &HashSet<String>) {
        self.reconcile_at(active, Utc::now());
    }

    /// Evict tokens that are expired and belong to no active identity, then
    /// make sure every active identity has a usable token.
    pub fn reconcile_at(&self, active: &HashSet<String>, now: DateTime<Utc>) {
        let evicted = {
            let mut tokens = self.lock();
            let before = tokens.len();
            tokens.retain(|identity, data| !data.is_expired(now) || active.contains(identity));
            before - tokens.len()
        };
        if evicted > 0 {
            info!(evicted, "evicted expired auth tokens");
        }
        for identity in active {
            self.issue_or_get_at(identity, now);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AuthData>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 32 random bytes, URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
