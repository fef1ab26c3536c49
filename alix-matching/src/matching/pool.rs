use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use alix_shared::{AppError, AppResult, ErrorCode};

use super::compat::{MatchFilters, Profile};

#[derive(Debug, Clone)]
pub struct WaitEntry {
    pub user_id: Uuid,
    pub filters: MatchFilters,
    pub profile: Profile,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO pool of users waiting for a match.
///
/// A user appears at most once. Removal only touches the entry map and
/// leaves the order slot behind; scans drop stale slots lazily, so
/// enqueue and remove stay O(1) while dequeue walks from the oldest
/// slot. Every enqueue stamps the entry and its slot with a fresh
/// sequence number; a slot is live only while its stamp matches the
/// entry's, so a user who cancels and comes back cannot inherit their
/// old place in line.
#[derive(Debug, Default)]
pub struct WaitPool {
    entries: HashMap<Uuid, (u64, WaitEntry)>,
    order: VecDeque<(u64, Uuid)>,
    next_seq: u64,
}

impl WaitPool {
    pub fn enqueue(&mut self, entry: WaitEntry) -> AppResult<()> {
        if self.entries.contains_key(&entry.user_id) {
            return Err(AppError::new(
                ErrorCode::AlreadyWaiting,
                "user is already waiting for a match",
            ));
        }
        let seq = self.bump_seq();
        self.order.push_back((seq, entry.user_id));
        self.entries.insert(entry.user_id, (seq, entry));
        Ok(())
    }

    /// Replace the filters and profile of a waiting user without losing
    /// their place in line. Returns false if the user is not waiting.
    pub fn refresh(&mut self, user_id: Uuid, filters: MatchFilters, profile: Profile) -> bool {
        match self.entries.get_mut(&user_id) {
            Some((_, entry)) => {
                entry.filters = filters;
                entry.profile = profile;
                true
            }
            None => false,
        }
    }

    /// Remove and return the oldest entry satisfying `pred`, preserving
    /// the relative order of everything that was skipped.
    pub fn dequeue_oldest<F>(&mut self, mut pred: F) -> Option<WaitEntry>
    where
        F: FnMut(&WaitEntry) -> bool,
    {
        let mut idx = 0;
        while idx < self.order.len() {
            let (seq, user_id) = self.order[idx];
            match self.entries.get(&user_id) {
                Some((live, entry)) if *live == seq => {
                    if pred(entry) {
                        self.order.remove(idx);
                        return self.entries.remove(&user_id).map(|(_, e)| e);
                    }
                    idx += 1;
                }
                // Slot from before a remove, prune, or re-enqueue: drop
                // it and retry this index.
                _ => {
                    self.order.remove(idx);
                }
            }
        }
        None
    }

    /// Put a dequeued entry back at the head of the line. Used when a
    /// match falls apart after its peer was already taken out.
    pub fn requeue_front(&mut self, entry: WaitEntry) {
        let seq = self.bump_seq();
        self.order.push_front((seq, entry.user_id));
        self.entries.insert(entry.user_id, (seq, entry));
    }

    pub fn remove(&mut self, user_id: Uuid) -> Option<WaitEntry> {
        self.entries.remove(&user_id).map(|(_, entry)| entry)
    }

    /// Remove and return every entry enqueued before `cutoff`.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> Vec<WaitEntry> {
        let expired: Vec<Uuid> = self
            .entries
            .values()
            .filter(|(_, e)| e.enqueued_at <= cutoff)
            .map(|(_, e)| e.user_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(_, entry)| entry))
            .collect()
    }

    /// 1-based place in line, counting only live slots. 1 means next up.
    pub fn position(&self, user_id: Uuid) -> Option<usize> {
        let live = self.entries.get(&user_id)?.0;
        let ahead = self
            .order
            .iter()
            .take_while(|(seq, id)| *id != user_id || *seq != live)
            .filter(|(seq, id)| matches!(self.entries.get(id), Some((s, _)) if s == seq))
            .count();
        Some(ahead + 1)
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.entries.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}
