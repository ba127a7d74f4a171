use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MSG_ID_RANDOM_LEN;

/// Account id assigned by the auth provider. Opaque to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Room id of the 1:1 room between `a` and `b`: the two ids sorted and
    /// concatenated, so both sides derive the same value.
    pub fn private(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}", lo.0, hi.0))
    }

    /// Decode the other member of a 1:1 room from its id.
    ///
    /// Returns `None` when the id does not encode `me` as one of its two
    /// halves (group and community ids never do).
    pub fn peer_of(&self, me: &UserId) -> Option<UserId> {
        let candidates = [
            self.0.strip_prefix(me.as_str()),
            self.0.strip_suffix(me.as_str()),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter(|rest| !rest.is_empty())
            .map(UserId::from)
            .find(|peer| RoomId::private(me, peer) == *self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client-generated message id. Stable across send retries and ordered by
/// creation time: 12 hex digits of epoch milliseconds followed by a random
/// suffix, so the remote store's key ordering follows send order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MsgId(pub String);

impl MsgId {
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let millis = at.timestamp_millis().max(0) as u64;
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{millis:012x}{}", &random[..MSG_ID_RANDOM_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MsgId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn private_room_id_is_order_independent() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert_eq!(RoomId::private(&alice, &bob), RoomId::private(&bob, &alice));
        assert_eq!(RoomId::private(&alice, &bob).as_str(), "alicebob");
    }

    #[test]
    fn peer_is_decoded_from_either_end() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let room = RoomId::private(&alice, &bob);

        assert_eq!(room.peer_of(&alice), Some(bob.clone()));
        assert_eq!(room.peer_of(&bob), Some(alice));
    }

    #[test]
    fn group_room_has_no_peer() {
        let room = RoomId::from("-Ngroup42");
        assert_eq!(room.peer_of(&UserId::from("alice")), None);
    }

    #[test]
    fn message_ids_sort_by_creation_time() {
        let early = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let late = Utc.timestamp_millis_opt(1_700_000_000_001).unwrap();

        let a = MsgId::generate_at(early);
        let b = MsgId::generate_at(late);
        assert!(a < b);
        assert_eq!(a.as_str().len(), 12 + MSG_ID_RANDOM_LEN);
    }
}
