use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ids::IdCounters;
use crate::error::RoomError;

const ROOM_PREFIX: &str = "room-";

/// Ephemeral private room shared by two or more identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmRoom {
    pub name: String,
    pub creator: u64,
    pub members: BTreeSet<u64>,
    pub created: DateTime<Utc>,
    pub last_message: DateTime<Utc>,
}

impl PmRoom {
    pub fn is_expired(&self, idle_expiry: Duration, now: DateTime<Utc>) -> bool {
        self.members.len() < 2 || now - self.last_message > idle_expiry
    }
}

pub fn room_name(id: u64) -> String {
    format!("{ROOM_PREFIX}{id}")
}

/// Next free room counter given every room name seen so far.
pub fn find_next_id<'a, I>(names: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|n| n.strip_prefix(ROOM_PREFIX)?.parse::<u64>().ok())
        .max()
        .map_or(1, |max| max + 1)
}

/// What the registry needs to know about the would-be creator and members.
pub struct RoomRequest<'a, F>
where
    F: Fn(u64) -> bool,
{
    pub creator: u64,
    pub members: &'a [u64],
    /// Creator is banned or blocked.
    pub creator_restricted: bool,
    pub is_known: F,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, PmRoom>,
    #[serde(skip)]
    idle_expiry: Option<Duration>,
}

impl RoomRegistry {
    pub fn new(idle_expiry: Duration) -> Self {
        Self {
            rooms: BTreeMap::new(),
            idle_expiry: Some(idle_expiry),
        }
    }

    /// Restore persisted rooms, keeping the configured expiry.
    pub fn restore(&mut self, persisted: RoomRegistry) {
        self.rooms = persisted.rooms;
    }

    fn expiry(&self) -> Duration {
        self.idle_expiry.unwrap_or_else(|| Duration::hours(24))
    }

    /// Create a room for `creator` plus the requested members.
    pub fn create_room<F>(
        &mut self,
        request: RoomRequest<'_, F>,
        ids: &IdCounters,
        now: DateTime<Utc>,
    ) -> Result<PmRoom, RoomError>
    where
        F: Fn(u64) -> bool,
    {
        if request.creator_restricted {
            return Err(RoomError::CreatorRestricted);
        }

        let mut members: BTreeSet<u64> = request.members.iter().copied().collect();
        members.insert(request.creator);
        if members.len() < 2 {
            return Err(RoomError::TooFewMembers);
        }
        if let Some(unknown) = members.iter().find(|uid| !(request.is_known)(**uid)) {
            return Err(RoomError::UnknownMember(*unknown));
        }

        self.sweep(now);
        if let Some(existing) = self.rooms.values().find(|r| r.members == members) {
            return Err(RoomError::DuplicateRoom(existing.name.clone()));
        }

        let name = room_name(ids.next_room_id());
        let room = PmRoom {
            name: name.clone(),
            creator: request.creator,
            members,
            created: now,
            last_message: now,
        };
        info!(room = %name, creator = request.creator, members = room.members.len(), "room created");
        self.rooms.insert(name, room.clone());
        Ok(room)
    }

    pub fn touch(&mut self, name: &str, now: DateTime<Utc>) {
        if let Some(room) = self.rooms.get_mut(name) {
            room.last_message = now;
        }
    }

    /// Drop rooms idle past their expiry. Returns the dropped names.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expiry = self.expiry();
        let expired: Vec<String> = self
            .rooms
            .values()
            .filter(|r| r.is_expired(expiry, now))
            .map(|r| r.name.clone())
            .collect();
        for name in &expired {
            self.rooms.remove(name);
            info!(room = %name, "room expired");
        }
        expired
    }

    /// Remove `uid` from the room; the room is deleted once fewer than two
    /// members remain. Returns the room as it was before removal.
    pub fn leave(&mut self, name: &str, uid: u64) -> Result<PmRoom, RoomError> {
        let room = self
            .rooms
            .get_mut(name)
            .ok_or_else(|| RoomError::NoSuchRoom(name.to_string()))?;
        let before = room.clone();
        if !room.members.remove(&uid) {
            return Err(RoomError::NotMember(name.to_string()));
        }
        if room.members.len() < 2 {
            self.rooms.remove(name);
            info!(room = %name, "room closed, too few members");
        }
        Ok(before)
    }

    pub fn get(&self, name: &str) -> Option<&PmRoom> {
        self.rooms.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    pub fn is_member(&self, name: &str, uid: u64) -> bool {
        self.rooms.get(name).is_some_and(|r| r.members.contains(&uid))
    }

    pub fn rooms_for(&self, uid: u64) -> impl Iterator<Item = &PmRoom> {
        self.rooms.values().filter(move |r| r.members.contains(&uid))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rooms.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(creator: u64, members: &[u64]) -> RoomRequest<'_, impl Fn(u64) -> bool> {
        RoomRequest {
            creator,
            members,
            creator_restricted: false,
            is_known: |uid: u64| uid < 100,
        }
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Duration::hours(24))
    }

    #[test]
    fn test_create_room_includes_creator() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        let room = rooms.create_room(request(1, &[2, 3]), &ids, Utc::now()).unwrap();
        assert_eq!(room.name, "room-1");
        assert_eq!(room.members, BTreeSet::from([1, 2, 3]));
        assert!(rooms.is_member("room-1", 1));
    }

    #[test]
    fn test_single_member_rejected() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        assert_eq!(
            rooms.create_room(request(1, &[]), &ids, Utc::now()),
            Err(RoomError::TooFewMembers)
        );
        // Listing only yourself is still one member
        assert_eq!(
            rooms.create_room(request(1, &[1, 1]), &ids, Utc::now()),
            Err(RoomError::TooFewMembers)
        );
    }

    #[test]
    fn test_duplicate_member_set_rejected() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        rooms.create_room(request(1, &[2, 3]), &ids, Utc::now()).unwrap();
        assert_eq!(
            rooms.create_room(request(3, &[2, 1]), &ids, Utc::now()),
            Err(RoomError::DuplicateRoom("room-1".into()))
        );
        assert!(rooms.create_room(request(3, &[2]), &ids, Utc::now()).is_ok());
    }

    #[test]
    fn test_unknown_member_rejected() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        assert_eq!(
            rooms.create_room(request(1, &[500]), &ids, Utc::now()),
            Err(RoomError::UnknownMember(500))
        );
    }

    #[test]
    fn test_restricted_creator_rejected() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        let mut req = request(1, &[2]);
        req.creator_restricted = true;
        assert_eq!(
            rooms.create_room(req, &ids, Utc::now()),
            Err(RoomError::CreatorRestricted)
        );
        // Failed creations don't consume names
        assert_eq!(ids.next_room_id(), 1);
    }

    #[test]
    fn test_room_destroyed_below_two_members() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        rooms.create_room(request(1, &[2, 3]), &ids, Utc::now()).unwrap();
        rooms.leave("room-1", 3).unwrap();
        assert!(rooms.contains("room-1"));
        rooms.leave("room-1", 2).unwrap();
        assert!(!rooms.contains("room-1"));
        assert_eq!(
            rooms.leave("room-1", 1),
            Err(RoomError::NoSuchRoom("room-1".into()))
        );
    }

    #[test]
    fn test_leave_by_non_member() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        rooms.create_room(request(1, &[2]), &ids, Utc::now()).unwrap();
        assert_eq!(
            rooms.leave("room-1", 9),
            Err(RoomError::NotMember("room-1".into()))
        );
    }

    #[test]
    fn test_sweep_drops_idle_rooms_and_touch_keeps_alive() {
        let ids = IdCounters::new();
        let mut rooms = registry();
        let start = Utc::now();
        rooms.create_room(request(1, &[2]), &ids, start).unwrap();
        rooms.create_room(request(1, &[3]), &ids, start).unwrap();

        rooms.touch("room-2", start + Duration::hours(20));
        let dropped = rooms.sweep(start + Duration::hours(25));
        assert_eq!(dropped, vec!["room-1".to_string()]);
        assert!(rooms.contains("room-2"));
    }

    #[test]
    fn test_find_next_id_scans_names() {
        assert_eq!(find_next_id(["room-3", "room-12", "garbage", "room-x"]), 13);
        assert_eq!(find_next_id(std::iter::empty::<&str>()), 1);
    }
}
