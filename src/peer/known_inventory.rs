//! Bounded set of inventory a peer is known to have.
//!
//! Eviction follows insertion order: once full, adding a new identifier drops
//! the single oldest-inserted one. Looking an entry up does not refresh it.
//! The cache has no locking of its own; each session wraps it in a mutex.

use crate::peer::wire::InvVect;
use std::collections::{HashSet, VecDeque};

/// Default number of identifiers remembered per peer
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct KnownInventory {
    members: HashSet<InvVect>,
    order: VecDeque<InvVect>,
    capacity: usize,
}

impl KnownInventory {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn exists(&self, inv: &InvVect) -> bool {
        self.members.contains(inv)
    }

    /// Record `inv`, evicting the oldest entry when at capacity.
    /// Adding an identifier that is already present is a no-op.
    pub fn add(&mut self, inv: InvVect) {
        if self.capacity == 0 || self.members.contains(&inv) {
            return;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }

        self.order.push_back(inv);
        self.members.insert(inv);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for KnownInventory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
