//! Per-identity presence, session history and the anti-spam score.
//!
//! Every time-dependent operation has an `_at(now)` form; the plain form uses
//! the wall clock. The hub always calls the `_at` forms with the timestamp of
//! the event being processed so one event sees one consistent "now".

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::message::Message;
use super::permissions::{DEFAULT_MEMBER, Permissions};
use super::similarity::normalized_edit_distance;
use crate::collab::profile::ProfileRecord;
use crate::config::SpamSection;
use crate::error::ProfileError;

/// Joins older than this no longer count toward join spam.
const JOIN_SPAM_WINDOW_SECS: f64 = 120.0;
/// Points a join contributes the instant it happens.
const JOIN_SPAM_POINTS: f64 = 30.0;

const MESSAGE_BASE_POINTS: f64 = 5.0;
/// Posting again within this many seconds adds rate pressure.
const RATE_WINDOW_SECS: f64 = 5.0;
const RATE_POINTS: f64 = 20.0;
const RATE_EXPONENT: f64 = 1.2;
const BLANK_LINE_POINTS: f64 = 5.0;
/// Own messages older than this are ignored for similarity.
const SIMILARITY_WINDOW_MINUTES: f64 = 10.0;

pub const MAX_SPAM_SCORE: f64 = 1000.0;
/// Floor for the escalation counter; a first block always lasts one step.
pub const MIN_GLOBAL_SPAM_SCORE: i64 = 1;
const GLOBAL_SPAM_DRIFT: i64 = 2;

const MAX_SESSIONS: usize = 100;
/// An identity counts as active if it sent an active ping this recently.
const ACTIVE_PING_WINDOW_SECS: i64 = 60;

/// Outcome of a spam score update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpamSignal {
    None,
    Warning,
    Blocked,
}

/// One open-to-close presence interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub entered: DateTime<Utc>,
    /// `None` while the session is still open.
    pub left: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.left.is_none()
    }
}

/// Profile fields mirrored from the external profile source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub username: String,
    pub avatar: String,
    pub stars: i64,
    pub level: i64,
    pub badges: Vec<String>,
    pub language: String,
    pub joined: Option<DateTime<Utc>>,
    pub permissions: Permissions,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            username: String::new(),
            avatar: String::new(),
            stars: 0,
            level: 0,
            badges: Vec::new(),
            language: "en".into(),
            joined: None,
            permissions: DEFAULT_MEMBER,
        }
    }
}

/// Immutable copy of the public parts of a profile, captured at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub uid: u64,
    pub username: String,
    pub avatar: String,
    pub stars: i64,
    pub level: i64,
    pub badges: Vec<String>,
    pub language: String,
}

impl UserSnapshot {
    /// Snapshot for messages authored by the server or a module.
    pub fn system(name: &str) -> Self {
        Self {
            uid: 0,
            username: name.to_string(),
            avatar: String::new(),
            stars: 0,
            level: 0,
            badges: Vec::new(),
            language: "en".into(),
        }
    }
}

/// A registered chat participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub uid: u64,
    pub profile: Profile,
    pub profile_loaded_at: Option<DateTime<Utc>>,
    pub banned_until: Option<DateTime<Utc>>,
    pub shadow_banned: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    /// Suppresses join/leave notices and user-list presence.
    pub hiding: bool,
    sessions: VecDeque<Session>,
    joins: Vec<DateTime<Utc>>,
    spam_score: f64,
    global_spam_score: i64,
    last_spam_decay: DateTime<Utc>,
    last_global_drift: DateTime<Utc>,
    last_block: Option<DateTime<Utc>>,
    last_post: Option<DateTime<Utc>>,
    last_ping: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(uid: u64, now: DateTime<Utc>) -> Self {
        Self {
            uid,
            global_spam_score: MIN_GLOBAL_SPAM_SCORE,
            last_spam_decay: now,
            last_global_drift: now,
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            uid: self.uid,
            username: self.profile.username.clone(),
            avatar: self.profile.avatar.clone(),
            stars: self.profile.stars,
            level: self.profile.level,
            badges: self.profile.badges.clone(),
            language: self.profile.language.clone(),
        }
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Open a new session, force-closing any session still open.
    pub fn enter_chat_at(&mut self, session_id: u64, now: DateTime<Utc>) -> u64 {
        for session in self.sessions.iter_mut().filter(|s| s.is_open()) {
            session.left = Some(now);
        }
        self.sessions.push_back(Session {
            id: session_id,
            entered: now,
            left: None,
        });
        while self.sessions.len() > MAX_SESSIONS {
            self.sessions.pop_front();
        }

        let cutoff = now - window(JOIN_SPAM_WINDOW_SECS);
        self.joins.retain(|t| *t >= cutoff);
        self.joins.push(now);
        self.last_ping = Some(now);
        session_id
    }

    /// Close the named session if it is still open.
    pub fn leave_chat_at(&mut self, session_id: u64, now: DateTime<Utc>) {
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_open())
        {
            session.left = Some(now);
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_open()).count()
    }

    pub fn max_session_id(&self) -> Option<u64> {
        self.sessions.iter().map(|s| s.id).max()
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Only active pings count as liveness; passive polls are ignored.
    pub fn ping_at(&mut self, active: bool, now: DateTime<Utc>) {
        if active {
            self.last_ping = Some(now);
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.open_session_count() > 0
            && self
                .last_ping
                .is_some_and(|t| now - t < Duration::seconds(ACTIVE_PING_WINDOW_SECS))
    }

    pub fn last_post(&self) -> Option<DateTime<Utc>> {
        self.last_post
    }

    pub fn mark_posted(&mut self, now: DateTime<Utc>) {
        self.last_post = Some(now);
    }

    // ── Moderation state ────────────────────────────────────────────

    /// A visible ban. Shadow bans are never reported to the identity.
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        !self.shadow_banned && self.banned_until.is_some_and(|t| t > now)
    }

    pub fn is_shadow_banned(&self, now: DateTime<Utc>) -> bool {
        self.shadow_banned && self.banned_until.is_some_and(|t| t > now)
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|t| t > now)
    }

    pub fn block_seconds_left(&self, now: DateTime<Utc>) -> i64 {
        self.blocked_until
            .map(|t| (t - now).num_seconds().max(0))
            .unwrap_or(0)
    }

    pub fn permissions(&self) -> Permissions {
        self.profile.permissions
    }

    // ── Spam model ──────────────────────────────────────────────────

    pub fn spam_score(&self) -> f64 {
        self.spam_score
    }

    pub fn global_spam_score(&self) -> i64 {
        self.global_spam_score
    }

    /// Decaying penalty for recent joins: each join within the window adds
    /// `30 * (1 - age / 2min)`.
    pub fn join_spam_score_at(&self, now: DateTime<Utc>) -> f64 {
        self.joins
            .iter()
            .map(|t| {
                let age = seconds_between(*t, now);
                (JOIN_SPAM_POINTS * (1.0 - age / JOIN_SPAM_WINDOW_SECS)).max(0.0)
            })
            .sum()
    }

    /// Penalty for posting `text` now, given the recent global message buffer.
    pub fn message_spam_score_at<'a, I>(&self, recent: I, text: &str, now: DateTime<Utc>) -> f64
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut points = MESSAGE_BASE_POINTS;

        if let Some(last) = self.last_post {
            let since = seconds_between(last, now);
            let max_penalty = (RATE_WINDOW_SECS - since) / RATE_WINDOW_SECS;
            if max_penalty > 0.0 {
                points += RATE_POINTS * max_penalty.powf(RATE_EXPONENT);
            }
        }

        points += text.chars().count() as f64 / 100.0;
        points += BLANK_LINE_POINTS * text.lines().filter(|l| l.trim().is_empty()).count() as f64;

        let window_start = now - window(SIMILARITY_WINDOW_MINUTES * 60.0);
        for prior in recent.into_iter().filter(|m| {
            m.sender.uid == self.uid && m.spammable && m.posted_at >= window_start && m.posted_at <= now
        }) {
            let minutes_ago = seconds_between(prior.posted_at, now) / 60.0;
            let recency = (1.0 - minutes_ago / SIMILARITY_WINDOW_MINUTES).max(0.0);
            let similarity = 1.0 - normalized_edit_distance(text, &prior.text);
            // Near-duplicates regardless of age, then fast repeats regardless of content.
            points += 6.0 * recency.powf(0.1) * similarity.powi(6);
            points += 2.0 * similarity * recency.powi(8);
        }

        points
    }

    /// Decay the score, add `points`, and escalate to a block when the
    /// threshold is reached. No-op while blocked.
    pub fn update_spam_at(&mut self, points: f64, config: &SpamSection, now: DateTime<Utc>) -> SpamSignal {
        if self.is_blocked(now) {
            return SpamSignal::None;
        }

        let elapsed = seconds_between(self.last_spam_decay, now);
        self.spam_score = (self.spam_score - config.decay_per_second * elapsed).clamp(0.0, MAX_SPAM_SCORE);
        self.last_spam_decay = now;

        let day = Duration::hours(24);
        let calm = self.last_block.is_none_or(|t| now - t >= day);
        if calm && now - self.last_global_drift >= day {
            self.global_spam_score = (self.global_spam_score - GLOBAL_SPAM_DRIFT).max(MIN_GLOBAL_SPAM_SCORE);
            self.last_global_drift = now;
        }

        self.spam_score = (self.spam_score + points).clamp(0.0, MAX_SPAM_SCORE);

        if self.spam_score >= config.block_threshold {
            self.spam_score = 0.0;
            let block_secs = self.global_spam_score * config.block_seconds_per_point;
            self.blocked_until = Some(now + Duration::seconds(block_secs));
            self.global_spam_score += 1;
            self.last_block = Some(now);
            return SpamSignal::Blocked;
        }
        if self.spam_score > config.warning_threshold {
            return SpamSignal::Warning;
        }
        SpamSignal::None
    }

    // ── Profile ─────────────────────────────────────────────────────

    pub fn has_profile(&self) -> bool {
        self.profile_loaded_at.is_some()
    }

    /// Apply the result of a profile fetch. Failures leave the cached
    /// profile untouched and are handed back to the caller.
    pub fn apply_profile_at(
        &mut self,
        fetched: Result<ProfileRecord, ProfileError>,
        now: DateTime<Utc>,
    ) -> Result<(), ProfileError> {
        let record = match fetched {
            Ok(record) => record,
            Err(e) => {
                warn!(uid = self.uid, error = %e, "profile refresh failed, keeping cached profile");
                return Err(e);
            }
        };

        let profile = &mut self.profile;
        if let Some(username) = record.username {
            profile.username = username;
        }
        if let Some(avatar) = record.avatar.or_else(|| record.avatars.and_then(|a| a.into_iter().next())) {
            profile.avatar = avatar;
        }
        if let Some(stars) = record.stars {
            profile.stars = stars;
        }
        if let Some(level) = record.level {
            profile.level = level;
        }
        if let Some(badges) = record.badges {
            profile.badges = badges;
        }
        if let Some(language) = record.language {
            profile.language = language;
        }
        if record.joined.is_some() {
            profile.joined = record.joined;
        }
        if let Some(perms) = record.permissions {
            profile.permissions = perms.to_permissions();
        }
        self.banned_until = record.banned_until;
        if let Some(shadow) = record.shadow_banned {
            self.shadow_banned = shadow;
        }
        if let Some(hiding) = record.hiding {
            self.hiding = hiding;
        }
        self.profile_loaded_at = Some(now);
        Ok(())
    }
}

fn window(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0) as i64)
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    ((later - earlier).num_milliseconds() as f64 / 1000.0).max(0.0)
}
