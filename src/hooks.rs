//! Call points for cluster coordination.
//!
//! Several servers sharing a segment may coordinate which of them owns
//! which addresses. The server core does not implement that; it only calls
//! out when it runs dry and when it commits a lease. Addresses obtained from
//! peers come back in through
//! [`ServerContext::replenish`](crate::server::ServerContext::replenish).

use std::net::Ipv4Addr;

/// Hooks invoked by the protocol handler.
///
/// Both methods run inline on the receive path and must not block.
pub trait ClusterHooks {
    /// A DISCOVER found the pool empty. No reply was sent.
    fn on_pool_exhausted(&mut self) {}

    /// An address was acknowledged to a client for `duration` seconds.
    fn publish_lease(
        &mut self,
        _address: Ipv4Addr,
        _hardware_address: &[u8; 16],
        _duration: u32,
    ) {
    }
}

/// Hooks that do nothing; used by a standalone server.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ClusterHooks for NoopHooks {}
