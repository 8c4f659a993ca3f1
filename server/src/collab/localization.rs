//! System message rendering.
//!
//! The hub never formats user-visible system text itself; it asks a
//! [`Localizer`] and falls back to the built-in English strings when the
//! localizer has nothing for the requested key.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::engine::user::UserSnapshot;

/// Keys for every system message the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemKey {
    Welcome,
    Join,
    Leave,
    SpamWarning,
    SpamBlocked,
    Evicted,
    RoomCreated,
}

impl SystemKey {
    /// Stable name used in strings files and as the frame `subtype`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemKey::Welcome => "welcome",
            SystemKey::Join => "join",
            SystemKey::Leave => "leave",
            SystemKey::SpamWarning => "warning",
            SystemKey::SpamBlocked => "blocked",
            SystemKey::Evicted => "evicted",
            SystemKey::RoomCreated => "roomCreated",
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            SystemKey::Welcome => "Welcome to chat, {user}!",
            SystemKey::Join => "{user} has entered the chat",
            SystemKey::Leave => "{user} has left the chat",
            SystemKey::SpamWarning => "{user}, please slow down or you will be blocked",
            SystemKey::SpamBlocked => "{user} has been blocked from chat for spamming",
            SystemKey::Evicted => "{user}, you connected from somewhere else",
            SystemKey::RoomCreated => "{user} created a new room",
        }
    }
}

/// Renders a system message about `subject` for `recipient`.
pub trait Localizer: Send + Sync {
    /// `None` means "no translation", not an error.
    fn render(&self, key: SystemKey, subject: &UserSnapshot, recipient: &UserSnapshot) -> Option<String>;
}

/// Localizer with no translations; everything falls back to the defaults.
#[derive(Debug, Default, Clone)]
pub struct DefaultLocalizer;

impl Localizer for DefaultLocalizer {
    fn render(&self, _key: SystemKey, _subject: &UserSnapshot, _recipient: &UserSnapshot) -> Option<String> {
        None
    }
}

/// Per-language templates loaded from TOML:
///
/// ```toml
/// [de]
/// welcome = "Willkommen im Chat, {user}!"
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(transparent)]
pub struct TableLocalizer {
    languages: HashMap<String, HashMap<String, String>>,
}

impl TableLocalizer {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load a strings file; any failure yields an empty table.
    pub fn load_or_empty(path: &str) -> Self {
        if !Path::new(path).exists() {
            info!(%path, "no localization file, using default strings");
            return Self::default();
        }
        match std::fs::read_to_string(path).map(|text| Self::from_toml(&text)) {
            Ok(Ok(table)) => table,
            Ok(Err(e)) => {
                warn!(%path, error = %e, "failed to parse localization file");
                Self::default()
            }
            Err(e) => {
                warn!(%path, error = %e, "failed to read localization file");
                Self::default()
            }
        }
    }
}

impl Localizer for TableLocalizer {
    fn render(&self, key: SystemKey, subject: &UserSnapshot, recipient: &UserSnapshot) -> Option<String> {
        self.languages
            .get(&recipient.language)
            .and_then(|strings| strings.get(key.as_str()))
            .map(|template| fill(template, subject))
    }
}

fn fill(template: &str, subject: &UserSnapshot) -> String {
    template.replace("{user}", &subject.username)
}

/// Render through `localizer`, falling back to the built-in string.
pub fn render_system(
    localizer: &dyn Localizer,
    key: SystemKey,
    subject: &UserSnapshot,
    recipient: &UserSnapshot,
) -> String {
    localizer
        .render(key, subject, recipient)
        .unwrap_or_else(|| fill(key.default_template(), subject))
}
