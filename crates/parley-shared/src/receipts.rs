//! Delivered/read receipt state machine.
//!
//! Receipts only ever grow: a peer is recorded at most once per kind, and a
//! read receipt implies a delivered one. The aggregate status of a message is
//! the supremum over its recipients:
//!
//! - `read` iff every member other than the sender has a read receipt,
//! - else `delivered` iff every such member has a delivered receipt,
//! - else `sent`.

use std::collections::BTreeSet;

use crate::model::{MessageStatus, ReceiptEntry, Receipts};
use crate::protocol::MessageRecord;
use crate::types::UserId;

impl Receipts {
    pub fn has_delivered(&self, user: &UserId) -> bool {
        self.delivered.delivered_to.iter().any(|r| &r.user_id == user)
    }

    pub fn has_read(&self, user: &UserId) -> bool {
        self.read.read_by.iter().any(|r| &r.user_id == user)
    }

    /// Record a delivered receipt. Returns `false` if `user` already had one.
    pub fn record_delivered(&mut self, user: &UserId, at: i64) -> bool {
        if self.has_delivered(user) {
            return false;
        }
        self.delivered.delivered_to.push(ReceiptEntry {
            user_id: user.clone(),
            timestamp: at,
        });
        true
    }

    /// Record a read receipt (and the implied delivered receipt). Returns
    /// `false` if nothing changed.
    pub fn record_read(&mut self, user: &UserId, at: i64) -> bool {
        let delivered = self.record_delivered(user, at);
        if self.has_read(user) {
            return delivered;
        }
        self.read.read_by.push(ReceiptEntry {
            user_id: user.clone(),
            timestamp: at,
        });
        true
    }

    /// Aggregate status for a message sent by `sender` to `members`.
    pub fn aggregate(&self, sender: &UserId, members: &BTreeSet<UserId>) -> MessageStatus {
        let mut recipients = members.iter().filter(|m| *m != sender);
        if recipients.clone().all(|m| self.has_read(m)) {
            MessageStatus::Read
        } else if recipients.all(|m| self.has_delivered(m)) {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }
}

impl MessageRecord {
    /// Apply a delivered receipt for `user` and recompute the status.
    /// The sender never receipts its own message.
    pub fn apply_delivered(&mut self, user: &UserId, at: i64, members: &BTreeSet<UserId>) -> bool {
        if user == &self.sender || !self.receipts.record_delivered(user, at) {
            return false;
        }
        self.refresh_status(members);
        true
    }

    /// Apply a read receipt for `user` and recompute the status.
    pub fn apply_read(&mut self, user: &UserId, at: i64, members: &BTreeSet<UserId>) -> bool {
        if user == &self.sender || !self.receipts.record_read(user, at) {
            return false;
        }
        self.refresh_status(members);
        true
    }

    pub fn refresh_status(&mut self, members: &BTreeSet<UserId>) {
        let status = self.receipts.aggregate(&self.sender, members);
        self.receipts.delivered.status = status >= MessageStatus::Delivered;
        self.receipts.read.status = status == MessageStatus::Read;
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MsgId, RoomId};

    fn ids(list: &[&str]) -> BTreeSet<UserId> {
        list.iter().map(|s| UserId::from(*s)).collect()
    }

    fn record() -> MessageRecord {
        MessageRecord::new(
            MsgId::from("m1"),
            RoomId::from("g1"),
            UserId::from("alice"),
            "ct".into(),
            1,
        )
    }

    #[test]
    fn status_follows_the_slowest_recipient() {
        let members = ids(&["alice", "bob", "carol"]);
        let mut msg = record();
        assert_eq!(msg.status, MessageStatus::Sent);

        assert!(msg.apply_delivered(&UserId::from("bob"), 2, &members));
        assert_eq!(msg.status, MessageStatus::Sent);

        assert!(msg.apply_delivered(&UserId::from("carol"), 3, &members));
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert!(msg.receipts.delivered.status);

        assert!(msg.apply_read(&UserId::from("bob"), 4, &members));
        assert_eq!(msg.status, MessageStatus::Delivered);

        assert!(msg.apply_read(&UserId::from("carol"), 5, &members));
        assert_eq!(msg.status, MessageStatus::Read);
        assert!(msg.receipts.read.status);
    }

    #[test]
    fn receipts_are_idempotent_per_peer() {
        let members = ids(&["alice", "bob"]);
        let mut once = record();
        once.apply_delivered(&UserId::from("bob"), 2, &members);
        once.apply_read(&UserId::from("bob"), 3, &members);

        let mut twice = once.clone();
        assert!(!twice.apply_delivered(&UserId::from("bob"), 9, &members));
        assert!(!twice.apply_read(&UserId::from("bob"), 9, &members));
        assert_eq!(once, twice);
    }

    #[test]
    fn read_implies_delivered() {
        let members = ids(&["alice", "bob"]);
        let mut msg = record();
        assert!(msg.apply_read(&UserId::from("bob"), 2, &members));
        assert!(msg.receipts.has_delivered(&UserId::from("bob")));
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[test]
    fn sender_receipts_are_ignored() {
        let members = ids(&["alice", "bob"]);
        let mut msg = record();
        assert!(!msg.apply_read(&UserId::from("alice"), 2, &members));
        assert_eq!(msg.status, MessageStatus::Sent);
        assert!(msg.receipts.read.read_by.is_empty());
    }

    #[test]
    fn status_matches_receipt_sets_for_every_combination() {
        let recipients = ["bob", "carol", "dave"];
        let members = ids(&["alice", "bob", "carol", "dave"]);

        // Each recipient is in one of three states: none, delivered, read.
        for combo in 0..27u32 {
            let mut msg = record();
            let mut states = Vec::new();
            let mut c = combo;
            for peer in recipients {
                let state = c % 3;
                c /= 3;
                match state {
                    1 => {
                        msg.apply_delivered(&UserId::from(peer), 1, &members);
                    }
                    2 => {
                        msg.apply_read(&UserId::from(peer), 1, &members);
                    }
                    _ => {}
                }
                states.push(state);
            }

            let expected = if states.iter().all(|s| *s == 2) {
                MessageStatus::Read
            } else if states.iter().all(|s| *s >= 1) {
                MessageStatus::Delivered
            } else {
                MessageStatus::Sent
            };
            assert_eq!(msg.status, expected, "combo {combo}");
        }
    }
}
