//! Path layout of the remote tree and path validation.
//!
//! ```text
//! userRooms/{userId}/{roomId}      chat metadata per user
//! rooms_group/{roomId}             group / community record
//! messages/{roomId}/{msgId}        message records
//! presence/{userId}                {isOnline, last_changed}
//! typing/{roomId}/{userId}         bool
//! activeRoom/{userId}              roomId | null
//! following/{userId}/{targetId}    true
//! followers/{targetId}/{userId}    true
//! posts/{postId}                   post record
//! reactions/{postId}/{emoji}/{userId}   true
//! ```

use parley_shared::constants::FORBIDDEN_KEY_CHARS;
use parley_shared::{MsgId, RoomId, UserId};

use crate::error::{RemoteError, Result};

pub const USER_ROOMS: &str = "userRooms";
pub const GROUP_ROOMS: &str = "rooms_group";
pub const MESSAGES: &str = "messages";
pub const PRESENCE: &str = "presence";
pub const TYPING: &str = "typing";
pub const ACTIVE_ROOM: &str = "activeRoom";
pub const FOLLOWING: &str = "following";
pub const FOLLOWERS: &str = "followers";
pub const POSTS: &str = "posts";
pub const REACTIONS: &str = "reactions";

pub fn user_rooms(user: &UserId) -> String {
    format!("{USER_ROOMS}/{user}")
}

pub fn user_room(user: &UserId, room: &RoomId) -> String {
    format!("{USER_ROOMS}/{user}/{room}")
}

pub fn group_room(room: &RoomId) -> String {
    format!("{GROUP_ROOMS}/{room}")
}

pub fn messages(room: &RoomId) -> String {
    format!("{MESSAGES}/{room}")
}

pub fn message(room: &RoomId, msg: &MsgId) -> String {
    format!("{MESSAGES}/{room}/{msg}")
}

pub fn presence(user: &UserId) -> String {
    format!("{PRESENCE}/{user}")
}

pub fn typing_room(room: &RoomId) -> String {
    format!("{TYPING}/{room}")
}

pub fn typing(room: &RoomId, user: &UserId) -> String {
    format!("{TYPING}/{room}/{user}")
}

pub fn active_room(user: &UserId) -> String {
    format!("{ACTIVE_ROOM}/{user}")
}

pub fn following(user: &UserId, target: &UserId) -> String {
    format!("{FOLLOWING}/{user}/{target}")
}

pub fn follower(target: &UserId, user: &UserId) -> String {
    format!("{FOLLOWERS}/{target}/{user}")
}

pub fn post(post_id: &str) -> String {
    format!("{POSTS}/{post_id}")
}

pub fn reaction(post_id: &str, emoji: &str, user: &UserId) -> String {
    format!("{REACTIONS}/{post_id}/{emoji}/{user}")
}

/// Join two paths; either side may be the root (`""`).
pub fn join(base: &str, rel: &str) -> String {
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{rel}"),
    }
}

/// Whether `key` can be used as a single path segment.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(FORBIDDEN_KEY_CHARS)
}

/// Split a path into validated segments. The empty path is the root.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('/')
        .map(|seg| {
            if seg.is_empty() || seg.contains(&FORBIDDEN_KEY_CHARS[1..]) {
                Err(RemoteError::InvalidPath(path.to_string()))
            } else {
                Ok(seg)
            }
        })
        .collect()
}

/// `true` if `ancestor` equals `path` or is one of its parents.
pub fn is_ancestor_or_self(ancestor: &[String], path: &[String]) -> bool {
    ancestor.len() <= path.len() && ancestor.iter().zip(path).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_layout() {
        let alice = UserId::from("alice");
        let room = RoomId::from("alicebob");
        assert_eq!(user_room(&alice, &room), "userRooms/alice/alicebob");
        assert_eq!(message(&room, &MsgId::from("m1")), "messages/alicebob/m1");
        assert_eq!(active_room(&alice), "activeRoom/alice");
    }

    #[test]
    fn rejects_empty_and_forbidden_segments() {
        assert!(segments("a//b").is_err());
        assert!(segments("a/b.c").is_err());
        assert!(segments("a/$b").is_err());
        assert_eq!(segments("a/b").unwrap(), vec!["a", "b"]);
        assert!(segments("").unwrap().is_empty());
    }

    #[test]
    fn key_validation() {
        assert!(is_valid_key("👍"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("a/b"));
        assert!(!is_valid_key("a.b"));
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("", "a/b"), "a/b");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a", "b"), "a/b");
    }
}
