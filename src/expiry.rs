//! The expirer lists (§4.C, §4.E): one ordered set per [`crate::tcp_sm::ExpirerClass`], always
//! sorted by `update_time` ascending so the sweep in [`ExpirerList::drain_expired`] can stop at
//! the first entry that has not yet timed out rather than walking every session in the table.
//!
//! Jool links each session into a doubly-linked list and moves it to the tail on every refresh;
//! a `BTreeSet<(Instant, Key<Tag>)>` gives the same "always sorted,
//! re-link in better than linear time" property for free, and removes the "insertion preserves
//! list order" case (`Fate::TimerSlow`, §4.C) entirely: there is no tail to append to, reinsertion
//! always lands the entry back in time order no matter what its previous position was.

use std::collections::BTreeSet;

use crate::arena::Key;
use crate::time::{Duration, Instant};

/// An ordered-by-time set of session keys belonging to one [`crate::tcp_sm::ExpirerClass`].
#[derive(Debug)]
pub struct ExpirerList<Tag> {
    entries: BTreeSet<(Instant, Key<Tag>)>,
}

impl<Tag> Default for ExpirerList<Tag> {
    fn default() -> Self {
        ExpirerList {
            entries: BTreeSet::new(),
        }
    }
}

impl<Tag> ExpirerList<Tag> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, time: Instant, key: Key<Tag>) {
        self.entries.insert((time, key));
    }

    pub fn remove(&mut self, time: Instant, key: Key<Tag>) {
        self.entries.remove(&(time, key));
    }

    /// Move `key` from `old_time` to `new_time`, same as a `remove` followed by an `insert` but
    /// named for the common call site (§4.C "re-arm").
    pub fn relink(&mut self, old_time: Instant, new_time: Instant, key: Key<Tag>) {
        self.entries.remove(&(old_time, key));
        self.entries.insert((new_time, key));
    }

    /// Remove and return every entry whose `update_time + ttl <= now`, stopping at the first
    /// entry that is not yet due since the set is kept in time order.
    pub fn drain_expired(&mut self, now: Instant, ttl: Duration) -> Vec<Key<Tag>> {
        let mut expired = Vec::new();
        while let Some(&(time, key)) = self.entries.iter().next() {
            if time + ttl > now {
                break;
            }
            self.entries.remove(&(time, key));
            expired.push(key);
        }
        expired
    }
}
