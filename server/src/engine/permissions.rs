use std::collections::HashSet;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

bitflags! {
    /// Permission bits granted by the external profile source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const STAFF         = 1 << 0;
        const GLOBAL_CHAT   = 1 << 1;
        const CHAT_CONTROL  = 1 << 2;
    }
}

/// Permissions assumed for a profile that doesn't say otherwise.
pub const DEFAULT_MEMBER: Permissions = Permissions::GLOBAL_CHAT;

/// Decides which tags an identity may see and post to.
///
/// A tag is either one of the configured global tags or a room name. Staff
/// tags are global tags that only staff may post to.
#[derive(Debug, Clone)]
pub struct TagPolicy {
    global: HashSet<String>,
    staff: HashSet<String>,
}

impl TagPolicy {
    pub fn new<I, J>(global: I, staff: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        Self {
            global: global.into_iter().collect(),
            staff: staff.into_iter().collect(),
        }
    }

    pub fn is_global(&self, tag: &str) -> bool {
        self.global.contains(tag)
    }

    pub fn global_tags(&self) -> impl Iterator<Item = &str> {
        self.global.iter().map(String::as_str)
    }

    /// Visibility is global tags plus rooms the identity belongs to.
    pub fn can_see(&self, tag: &str, is_room_member: bool) -> bool {
        self.is_global(tag) || is_room_member
    }

    pub fn check_post(
        &self,
        tag: &str,
        permissions: Permissions,
        is_room_member: bool,
    ) -> Result<(), ChatError> {
        if is_room_member {
            return Ok(());
        }
        if !self.is_global(tag) {
            return Err(ChatError::TagDenied(tag.to_string()));
        }
        if self.staff.contains(tag) {
            return if permissions.contains(Permissions::STAFF) {
                Ok(())
            } else {
                Err(ChatError::TagDenied(tag.to_string()))
            };
        }
        if permissions.intersects(Permissions::GLOBAL_CHAT | Permissions::STAFF) {
            Ok(())
        } else {
            Err(ChatError::TagDenied(tag.to_string()))
        }
    }
}
