use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

/// FIFO of waitlisted registrations for one event, keyed by arrival seq.
///
/// Every entry is eligible for any open court, so the head is always the
/// next registration to be seated, no matter which court frees up.
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    by_seq: BTreeMap<u64, Ulid>,
    seq_of: HashMap<Ulid, u64>,
}

impl WaitlistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Callers enqueue once, at creation, in seq order.
    pub fn enqueue(&mut self, seq: u64, registration_id: Ulid) {
        debug_assert!(
            self.by_seq.last_key_value().is_none_or(|(last, _)| *last < seq),
            "waitlist enqueue out of arrival order"
        );
        self.by_seq.insert(seq, registration_id);
        self.seq_of.insert(registration_id, seq);
    }

    pub fn peek_eligible(&self) -> Option<Ulid> {
        self.by_seq.first_key_value().map(|(_, id)| *id)
    }

    /// Remove a specific entry. Returns false if it was not queued.
    pub fn dequeue(&mut self, registration_id: Ulid) -> bool {
        match self.seq_of.remove(&registration_id) {
            Some(seq) => {
                self.by_seq.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, registration_id: Ulid) -> bool {
        self.seq_of.contains_key(&registration_id)
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    /// Entries head first.
    pub fn iter(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.by_seq.values().copied()
    }
}
