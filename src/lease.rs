//! Leases handed to clients and the table of addresses currently out.
//!
//! A [`DhcpLease`] is built per reply from the configuration and one
//! address; it knows how to write itself as options. [`Bindings`] remembers
//! which client holds which address so that REQUEST can be checked and
//! RELEASE/DECLINE can hand addresses back to the pool:
//!
//! - DISCOVER records an `Offered` binding that lapses after
//!   [`OFFER_TIMEOUT_SECONDS`]
//! - ACK turns it into a `Leased` binding that lapses with the lease
//! - DECLINE quarantines the address for [`DECLINE_QUARANTINE_SECONDS`]
//!
//! Lapsed bindings and served quarantines are collected by
//! [`Bindings::reclaim_expired`], which the server calls before handling
//! each datagram. Nothing here runs on a timer.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::options::{OptionCode, OptionWriter, address_list};

/// How long an OFFER reserves its address (60 seconds).
pub const OFFER_TIMEOUT_SECONDS: i64 = 60;

/// How long a declined address stays out of the pool (1 hour).
pub const DECLINE_QUARANTINE_SECONDS: i64 = 3600;

/// Netmask for a prefix length, host order. `prefix_len` must be 1..=32.
pub fn netmask_from_prefix_len(prefix_len: u8) -> u32 {
    u32::MAX - (1u32 << (32 - u32::from(prefix_len))) + 1
}

/// Configuration handed to one client along with an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub address: Ipv4Addr,
    pub routers: Vec<Ipv4Addr>,
    pub nameservers: Vec<Ipv4Addr>,
    /// Lease duration in seconds; 0 omits the lease time option.
    pub lease_time: u32,
    /// Subnet prefix length; 0 omits the netmask option.
    pub prefix_len: u8,
}

impl DhcpLease {
    /// Writes the lease options followed by End.
    ///
    /// Order is fixed: netmask, routers, lease time, nameservers. Options
    /// whose value is empty or zero are skipped.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::InvalidOption`](crate::Error::InvalidOption) from
    /// the writer; the reply must then be dropped.
    pub fn write_options(&self, writer: &mut OptionWriter<'_>, cursor: &mut usize) -> Result<()> {
        if self.prefix_len > 0 {
            let netmask = netmask_from_prefix_len(self.prefix_len);
            writer.insert(
                cursor,
                OptionCode::SubnetMask as u8,
                &netmask.to_be_bytes(),
            )?;
        }

        if !self.routers.is_empty() {
            writer.insert(
                cursor,
                OptionCode::Router as u8,
                &address_list(&self.routers),
            )?;
        }

        if self.lease_time > 0 {
            writer.insert(
                cursor,
                OptionCode::LeaseTime as u8,
                &self.lease_time.to_be_bytes(),
            )?;
        }

        if !self.nameservers.is_empty() {
            writer.insert(
                cursor,
                OptionCode::DnsServer as u8,
                &address_list(&self.nameservers),
            )?;
        }

        writer.end(cursor)
    }
}

/// Where an outstanding address is in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Sent in an OFFER, waiting for REQUEST.
    Offered,
    /// Acknowledged.
    Leased,
}

/// An address this server has handed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub address: Ipv4Addr,
    pub hardware_address: [u8; 16],
    pub state: BindingState,
    /// `None` for leases without a duration.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Binding {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Outstanding bindings indexed by address and by client.
#[derive(Debug, Default)]
pub struct Bindings {
    by_address: HashMap<Ipv4Addr, Binding>,
    by_client: HashMap<[u8; 16], Ipv4Addr>,
    declined: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses currently bound.
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn get(&self, address: Ipv4Addr) -> Option<&Binding> {
        self.by_address.get(&address)
    }

    /// The binding held by a client, if any.
    pub fn for_client(&self, hardware_address: &[u8; 16]) -> Option<&Binding> {
        self.by_client
            .get(hardware_address)
            .and_then(|address| self.by_address.get(address))
    }

    /// Returns true if the address is bound to this exact client.
    pub fn is_bound_to(&self, address: Ipv4Addr, hardware_address: &[u8; 16]) -> bool {
        self.by_address
            .get(&address)
            .is_some_and(|binding| &binding.hardware_address == hardware_address)
    }

    pub fn is_declined(&self, address: Ipv4Addr) -> bool {
        self.declined.contains_key(&address)
    }

    /// Records an OFFER.
    ///
    /// Any other address the client held is unbound and returned.
    pub fn offer(
        &mut self,
        address: Ipv4Addr,
        hardware_address: [u8; 16],
        now: DateTime<Utc>,
    ) -> Option<Ipv4Addr> {
        let expires_at = now + TimeDelta::seconds(OFFER_TIMEOUT_SECONDS);
        self.bind(address, hardware_address, BindingState::Offered, Some(expires_at))
    }

    /// Records an ACK for `lease_time` seconds (0 = no expiry).
    ///
    /// Any other address the client held is unbound and returned.
    pub fn lease(
        &mut self,
        address: Ipv4Addr,
        hardware_address: [u8; 16],
        lease_time: u32,
        now: DateTime<Utc>,
    ) -> Option<Ipv4Addr> {
        let expires_at = (lease_time > 0).then(|| now + TimeDelta::seconds(i64::from(lease_time)));
        self.bind(address, hardware_address, BindingState::Leased, expires_at)
    }

    fn bind(
        &mut self,
        address: Ipv4Addr,
        hardware_address: [u8; 16],
        state: BindingState,
        expires_at: Option<DateTime<Utc>>,
    ) -> Option<Ipv4Addr> {
        let previous = self
            .by_client
            .insert(hardware_address, address)
            .filter(|previous| *previous != address);
        if let Some(previous) = previous {
            self.by_address.remove(&previous);
        }

        self.by_address.insert(
            address,
            Binding {
                address,
                hardware_address,
                state,
                expires_at,
            },
        );
        previous
    }

    /// Removes the binding if it belongs to this client.
    pub fn release(&mut self, address: Ipv4Addr, hardware_address: &[u8; 16]) -> Option<Binding> {
        if !self.is_bound_to(address, hardware_address) {
            return None;
        }
        self.by_client.remove(hardware_address);
        self.by_address.remove(&address)
    }

    /// Unbinds the address and quarantines it.
    ///
    /// Returns false if the address is not bound to this client.
    pub fn decline(
        &mut self,
        address: Ipv4Addr,
        hardware_address: &[u8; 16],
        now: DateTime<Utc>,
    ) -> bool {
        if self.release(address, hardware_address).is_none() {
            return false;
        }
        self.declined.insert(address, now);
        true
    }

    /// Drops lapsed bindings and finished quarantines.
    ///
    /// Returns the addresses that are free again, in ascending order.
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Vec<Ipv4Addr> {
        let mut reclaimed: Vec<Ipv4Addr> = self
            .by_address
            .values()
            .filter(|binding| binding.is_expired(now))
            .map(|binding| binding.address)
            .collect();

        for address in &reclaimed {
            if let Some(binding) = self.by_address.remove(address) {
                self.by_client.remove(&binding.hardware_address);
            }
        }

        let quarantine = TimeDelta::seconds(DECLINE_QUARANTINE_SECONDS);
        self.declined.retain(|address, declined_at| {
            if now.signed_duration_since(*declined_at) >= quarantine {
                reclaimed.push(*address);
                false
            } else {
                true
            }
        });

        reclaimed.sort();
        reclaimed
    }

    /// Iterates the current bindings in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.by_address.values()
    }
}
