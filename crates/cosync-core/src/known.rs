//! Known state: a compact summary of how much of a value a peer holds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{SessionId, ValueId};

/// Header flag plus per-session transaction counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: ValueId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    /// Nothing known about `id`.
    pub fn empty(id: ValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.values().all(|&n| n == 0)
    }

    /// Transaction count for one session (0 if absent).
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge monotonically: header is OR-ed, counts take the max.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(*session).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
    }

    /// Non-mutating [`combine_with`](Self::combine_with).
    pub fn combined(&self, other: &KnownState) -> KnownState {
        let mut out = self.clone();
        out.combine_with(other);
        out
    }

    /// True when everything in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &KnownState) -> bool {
        if self.header && !other.header {
            return false;
        }
        self.sessions
            .iter()
            .all(|(session, &count)| count <= other.count(session))
    }

    /// Sessions where `self` has more than `other`, with `other`'s count.
    pub fn ahead_of(&self, other: &KnownState) -> Vec<(SessionId, u32)> {
        self.sessions
            .iter()
            .filter_map(|(session, &count)| {
                let theirs = other.count(session);
                (count > theirs).then_some((*session, theirs))
            })
            .collect()
    }
}
