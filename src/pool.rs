//! Fixed-capacity store of allocatable addresses.
//!
//! The pool is a stack: [`Pool::get`] hands out the most recently added
//! entry. Populating it from a range in ascending order therefore means the
//! highest address is offered first.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// An address waiting to be handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub address: Ipv4Addr,
    /// When the entry entered the pool.
    pub acquired_at: DateTime<Utc>,
    /// Whether this server owns the address (as opposed to one borrowed
    /// from a peer). Kept for expiry bookkeeping, not read by the core.
    pub owned: bool,
}

impl PoolEntry {
    /// An address owned by this server, acquired now.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            acquired_at: Utc::now(),
            owned: true,
        }
    }
}

/// Capacity-bounded LIFO store of [`PoolEntry`] values.
#[derive(Debug)]
pub struct Pool {
    entries: Vec<PoolEntry>,
    capacity: usize,
}

impl Pool {
    /// Creates an empty pool with room for `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Creates a pool holding every address in `low..=high`, added in
    /// ascending order.
    ///
    /// Addresses that do not fit in `capacity` are dropped; the count of
    /// dropped addresses is returned alongside the pool.
    pub fn from_range(low: u32, high: u32, capacity: usize) -> (Self, usize) {
        let mut pool = Self::new(capacity);
        let mut dropped = 0;
        for address in low..=high {
            if pool.add(PoolEntry::new(Ipv4Addr::from(address))).is_err() {
                dropped += 1;
            }
        }
        (pool, dropped)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolFull`] without touching the pool when it already
    /// holds `capacity` entries.
    pub fn add(&mut self, entry: PoolEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(Error::PoolFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Pops the most recently added entry.
    pub fn get(&mut self) -> Option<PoolEntry> {
        self.entries.pop()
    }

    /// Changes the capacity, discarding the newest entries beyond it.
    pub fn resize(&mut self, capacity: usize) {
        self.entries.truncate(capacity);
        if capacity > self.entries.capacity() {
            self.entries.reserve_exact(capacity - self.entries.len());
        } else {
            self.entries.shrink_to(capacity);
        }
        self.capacity = capacity;
    }

    /// Returns true if `address` is currently free in the pool.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.entries.iter().any(|entry| entry.address == address)
    }

    /// Removes a specific free address, keeping the order of the others.
    pub fn take(&mut self, address: Ipv4Addr) -> Option<PoolEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.address == address)?;
        Some(self.entries.remove(index))
    }

    /// Iterates the free addresses, oldest first.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.entries.iter().map(|entry| entry.address)
    }
}
