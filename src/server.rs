use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::hooks::{ClusterHooks, NoopHooks};
use crate::lease::{BindingState, Bindings, DECLINE_QUARANTINE_SECONDS, DhcpLease};
use crate::options::MessageType;
use crate::packet::{DHCP_MESSAGE_SIZE, DhcpMessage};
use crate::pool::{Pool, PoolEntry};
use crate::transmit::{self, BROADCAST_DESTINATION, Transport};

/// UDP port servers listen on.
pub const DHCP_SERVER_PORT: u16 = 67;

/// What became of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A reply of this type was sent.
    Replied(MessageType),
    /// A reply of this type was built but the transport refused it.
    SendFailed(MessageType),
    /// A reply of this type could not be encoded; nothing was sent.
    BuildFailed(MessageType),
    /// Processed, no reply is due (RELEASE, DECLINE).
    Handled,
    /// DISCOVER with an empty pool; the client will retry.
    Deferred,
    /// Valid message that needs nothing from this server.
    Ignored,
    /// Not a DHCP message.
    Dropped,
}

/// Everything the protocol handler owns.
///
/// One context serves one socket. Datagrams are handled strictly one after
/// another, so nothing in here is shared or locked.
pub struct ServerContext<H = NoopHooks> {
    config: ServerConfig,
    pool: Pool,
    bindings: Bindings,
    hooks: H,
    reply_to: SocketAddrV4,
}

impl ServerContext<NoopHooks> {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, NoopHooks)
    }
}

impl<H: ClusterHooks> ServerContext<H> {
    /// Creates a context with the pool filled from the configured range.
    pub fn with_hooks(config: ServerConfig, hooks: H) -> Self {
        let (pool, dropped) =
            Pool::from_range(config.range_low, config.range_high, config.pool_capacity);
        if dropped > 0 {
            warn!(
                "{} addresses of the range do not fit in pool capacity {}",
                dropped, config.pool_capacity
            );
        }

        info!(
            "IP pool: {} - {} ({} addresses)",
            Ipv4Addr::from(config.range_low),
            Ipv4Addr::from(config.range_high),
            pool.len()
        );

        Self {
            config,
            pool,
            bindings: Bindings::new(),
            hooks,
            reply_to: BROADCAST_DESTINATION,
        }
    }

    /// Sends replies to `destination` instead of the broadcast address.
    pub fn with_reply_destination(mut self, destination: SocketAddrV4) -> Self {
        self.reply_to = destination;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Adds externally obtained addresses to the pool.
    ///
    /// Addresses already free, bound or quarantined are skipped. Returns how
    /// many were added; stops at the first one that does not fit.
    pub fn replenish<I>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let mut added = 0;
        for address in addresses {
            if self.pool.contains(address)
                || self.bindings.get(address).is_some()
                || self.bindings.is_declined(address)
            {
                debug!("Not replenishing {}, already known", address);
                continue;
            }

            match self.pool.add(PoolEntry::new(address)) {
                Ok(()) => added += 1,
                Err(error) => {
                    warn!("Stopped replenishing at {}: {}", address, error);
                    break;
                }
            }
        }
        added
    }

    /// Handles one received datagram, replying through `transport`.
    pub fn handle_datagram<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        bytes: &[u8],
        source: SocketAddr,
    ) -> Disposition {
        self.handle_datagram_at(transport, bytes, source, Utc::now())
    }

    /// Same as [`handle_datagram`](Self::handle_datagram) with an explicit
    /// clock reading.
    pub fn handle_datagram_at<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        bytes: &[u8],
        source: SocketAddr,
        now: DateTime<Utc>,
    ) -> Disposition {
        self.reclaim_expired(now);

        let message = match DhcpMessage::decode(bytes, source, self.config.server_ip) {
            Ok(message) => message,
            Err(error) => {
                debug!("Dropping datagram from {}: {}", source, error);
                return Disposition::Dropped;
            }
        };

        let mac = message.format_mac();
        let Some(message_type) = message.message_type() else {
            match message.raw_message_type {
                Some(raw) => warn!("Unknown message type {} from {} ({})", raw, mac, source),
                None => warn!("Message without a type from {} ({})", mac, source),
            }
            return Disposition::Ignored;
        };

        info!("{} from {} ({})", message_type, mac, source);

        match message_type {
            MessageType::Discover => self.handle_discover(transport, &message, now),
            MessageType::Request => self.handle_request(transport, &message, now),
            MessageType::Release => self.handle_release(&message),
            MessageType::Decline => self.handle_decline(&message, now),
            MessageType::Inform => self.handle_inform(transport, &message),
            MessageType::Offer | MessageType::Ack | MessageType::Nak => {
                warn!("Ignoring {} message from {}", message_type, mac);
                Disposition::Ignored
            }
        }
    }

    fn handle_discover<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        message: &DhcpMessage<'_>,
        now: DateTime<Utc>,
    ) -> Disposition {
        let mac = message.format_mac();

        let existing = self
            .bindings
            .for_client(&message.chaddr)
            .map(|binding| (binding.address, binding.state));

        let offered_ip = match existing {
            Some((address, BindingState::Leased)) => address,
            Some((address, BindingState::Offered)) => {
                self.bindings.offer(address, message.chaddr, now);
                address
            }
            None => match self.pool.get() {
                Some(entry) => {
                    self.bindings.offer(entry.address, message.chaddr, now);
                    entry.address
                }
                None => {
                    warn!("Pool exhausted, cannot offer IP to {}", mac);
                    self.hooks.on_pool_exhausted();
                    return Disposition::Deferred;
                }
            },
        };

        let lease = self.config.lease_for(offered_ip);
        let disposition = self.reply(transport, MessageType::Offer, message, Some(&lease));
        if disposition == Disposition::Replied(MessageType::Offer) {
            info!("OFFER {} to {}", offered_ip, mac);
        }
        disposition
    }

    fn handle_request<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        message: &DhcpMessage<'_>,
        now: DateTime<Utc>,
    ) -> Disposition {
        let mac = message.format_mac();

        if let Some(server_id) = message.server_identifier()
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            return Disposition::Ignored;
        }

        let requested_ip = message
            .requested_ip()
            .or((message.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(message.ciaddr));

        let Some(requested_ip) = requested_ip else {
            return self.send_nak(transport, message, "No IP address in REQUEST");
        };

        if self.bindings.is_declined(requested_ip) {
            return self.send_nak(transport, message, "Requested IP is quarantined");
        }

        // The range only bounds addresses not already held or free here;
        // replenished ones may lie outside it.
        if !self.bindings.is_bound_to(requested_ip, &message.chaddr)
            && self.pool.take(requested_ip).is_none()
        {
            let reason = if !self.config.in_range(requested_ip) {
                "Requested IP not in range"
            } else if self.bindings.get(requested_ip).is_some() {
                "Requested IP is bound to another client"
            } else {
                "Requested IP is not available"
            };
            return self.send_nak(transport, message, reason);
        }

        let lease_time = self.config.lease_time;
        if let Some(previous) = self
            .bindings
            .lease(requested_ip, message.chaddr, lease_time, now)
        {
            self.return_to_pool(previous);
        }

        let lease = self.config.lease_for(requested_ip);
        let disposition = self.reply(transport, MessageType::Ack, message, Some(&lease));
        if disposition == Disposition::Replied(MessageType::Ack) {
            info!("ACK {} to {} (lease: {} seconds)", requested_ip, mac, lease_time);
            self.hooks
                .publish_lease(requested_ip, &message.chaddr, lease_time);
        }
        disposition
    }

    fn handle_release(&mut self, message: &DhcpMessage<'_>) -> Disposition {
        let mac = message.format_mac();

        if message.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", mac);
            return Disposition::Ignored;
        }

        if self.bindings.release(message.ciaddr, &message.chaddr).is_none() {
            warn!(
                "RELEASE from {} for {} ignored - IP not bound to this client",
                mac, message.ciaddr
            );
            return Disposition::Ignored;
        }

        self.return_to_pool(message.ciaddr);
        info!("RELEASE from {} for {}", mac, message.ciaddr);
        Disposition::Handled
    }

    fn handle_decline(&mut self, message: &DhcpMessage<'_>, now: DateTime<Utc>) -> Disposition {
        let mac = message.format_mac();

        let Some(declined_ip) = message.requested_ip() else {
            warn!("DECLINE from {} without a requested IP", mac);
            return Disposition::Ignored;
        };

        if self.bindings.decline(declined_ip, &message.chaddr, now) {
            warn!(
                "DECLINE from {} for {} - quarantined for {} seconds",
                mac, declined_ip, DECLINE_QUARANTINE_SECONDS
            );
            Disposition::Handled
        } else {
            warn!(
                "DECLINE from {} for {} rejected - IP not associated with this client",
                mac, declined_ip
            );
            Disposition::Ignored
        }
    }

    fn handle_inform<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        message: &DhcpMessage<'_>,
    ) -> Disposition {
        let lease = self.config.inform_lease();
        let disposition = self.reply(transport, MessageType::Ack, message, Some(&lease));
        if disposition == Disposition::Replied(MessageType::Ack) {
            info!("INFORM response to {}", message.format_mac());
        }
        disposition
    }

    fn send_nak<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        message: &DhcpMessage<'_>,
        reason: &str,
    ) -> Disposition {
        warn!("NAK to {}: {}", message.format_mac(), reason);
        self.reply(transport, MessageType::Nak, message, None)
    }

    fn reply<T: Transport + ?Sized>(
        &self,
        transport: &T,
        message_type: MessageType,
        message: &DhcpMessage<'_>,
        lease: Option<&DhcpLease>,
    ) -> Disposition {
        match transmit::send(transport, message_type, message, lease, self.reply_to) {
            Ok(_) => Disposition::Replied(message_type),
            Err(error @ Error::Io(_)) => {
                error!(
                    "Failed to send {} to {}: {}",
                    message_type,
                    message.format_mac(),
                    error
                );
                Disposition::SendFailed(message_type)
            }
            Err(error) => {
                error!(
                    "Failed to build {} for {}: {}",
                    message_type,
                    message.format_mac(),
                    error
                );
                Disposition::BuildFailed(message_type)
            }
        }
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        for address in self.bindings.reclaim_expired(now) {
            debug!("Reclaiming {}", address);
            self.return_to_pool(address);
        }
    }

    fn return_to_pool(&mut self, address: Ipv4Addr) {
        if self.pool.contains(address) {
            return;
        }
        if let Err(error) = self.pool.add(PoolEntry::new(address)) {
            warn!("Cannot return {} to the pool: {}", address, error);
        }
    }
}

/// A [`ServerContext`] bound to UDP port 67.
///
/// Datagrams are received through tokio and handled inline, one at a time.
/// Replies leave through a duplicate of the same socket, which never blocks.
pub struct DhcpServer<H = NoopHooks> {
    context: ServerContext<H>,
    socket: UdpSocket,
    transmit: Socket,
}

impl DhcpServer<NoopHooks> {
    /// Binds `0.0.0.0:67`. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_context(ServerContext::new(config))
    }
}

impl<H: ClusterHooks> DhcpServer<H> {
    pub fn with_context(context: ServerContext<H>) -> Result<Self> {
        let socket = Self::create_socket(context.config())?;

        info!(
            "DHCP server starting on {}:{}",
            context.config().server_ip,
            DHCP_SERVER_PORT
        );

        Self::from_socket(context, socket)
    }

    /// Wraps an already bound, non-blocking socket.
    pub fn from_socket(context: ServerContext<H>, socket: Socket) -> Result<Self> {
        let transmit = socket
            .try_clone()
            .map_err(|error| Error::Socket(format!("Failed to duplicate socket: {}", error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(Self {
            context,
            socket,
            transmit,
        })
    }

    fn create_socket(config: &ServerConfig) -> Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.interface {
            #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
            socket
                .bind_device(Some(interface.as_bytes()))
                .map_err(|error| {
                    Error::Socket(format!("Failed to bind to interface {}: {}", interface, error))
                })?;

            #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
            warn!(
                "interface ({}) is only supported on Linux and will be ignored",
                interface
            );
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        Ok(socket)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn context(&self) -> &ServerContext<H> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ServerContext<H> {
        &mut self.context
    }

    /// Waits for one datagram and handles it.
    ///
    /// # Errors
    ///
    /// Only receive errors are returned. Anything wrong with the datagram
    /// or with sending the reply is reported through the [`Disposition`].
    pub async fn serve_one(&mut self) -> Result<Disposition> {
        let mut buffer = [0u8; DHCP_MESSAGE_SIZE];
        let (size, source) = self.socket.recv_from(&mut buffer).await?;
        Ok(self
            .context
            .handle_datagram(&self.transmit, &buffer[..size], source))
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("DHCP server ready and listening");

        loop {
            if let Err(error) = self.serve_one().await {
                error!("Error receiving packet: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::OFFER_TIMEOUT_SECONDS;
    use crate::options::OptionCode;
    use crate::packet::{BOOTREPLY, BOOTREQUEST, DHCP_MAGIC_COOKIE, HLEN_ETHERNET, HTYPE_ETHERNET};
    use chrono::TimeDelta;
    use std::cell::RefCell;
    use std::io;

    const MAC_A: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
    const MAC_B: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const POOL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[derive(Default)]
    struct RecordingTransport {
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn count(&self) -> usize {
            self.sent.borrow().len()
        }

        fn last(&self) -> Vec<u8> {
            self.sent.borrow().last().cloned().unwrap()
        }
    }

    impl Transport for RecordingTransport {
        fn send_datagram(&self, payload: &[u8], _destination: SocketAddrV4) -> io::Result<usize> {
            self.sent.borrow_mut().push(payload.to_vec());
            Ok(payload.len())
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn send_datagram(&self, _payload: &[u8], _destination: SocketAddrV4) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "send buffer full"))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        exhausted: usize,
        published: Vec<(Ipv4Addr, [u8; 16], u32)>,
    }

    impl ClusterHooks for RecordingHooks {
        fn on_pool_exhausted(&mut self) {
            self.exhausted += 1;
        }

        fn publish_lease(&mut self, address: Ipv4Addr, hardware_address: &[u8; 16], duration: u32) {
            self.published.push((address, *hardware_address, duration));
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            server_ip: SERVER_IP,
            routers: vec![SERVER_IP],
            nameservers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            range_low: u32::from(POOL_IP),
            range_high: u32::from(POOL_IP),
            lease_time: 3600,
            prefix_len: 24,
            interface: None,
            pool_capacity: 1,
        }
    }

    fn test_context() -> ServerContext<RecordingHooks> {
        ServerContext::with_hooks(test_config(), RecordingHooks::default())
    }

    fn source() -> SocketAddr {
        "0.0.0.0:68".parse().unwrap()
    }

    fn chaddr(mac: [u8; 6]) -> [u8; 16] {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        chaddr
    }

    fn create_dhcp_packet(
        message_type: MessageType,
        mac: [u8; 6],
        xid: u32,
        options: &[(u8, &[u8])],
    ) -> Vec<u8> {
        create_raw_packet(Some(message_type as u8), mac, xid, options)
    }

    fn create_raw_packet(
        message_type: Option<u8>,
        mac: [u8; 6],
        xid: u32,
        options: &[(u8, &[u8])],
    ) -> Vec<u8> {
        let mut packet = vec![0u8; 300];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&mac);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        let mut index = 240;
        if let Some(message_type) = message_type {
            packet[index..index + 3].copy_from_slice(&[
                OptionCode::MessageType as u8,
                1,
                message_type,
            ]);
            index += 3;
        }

        for (code, data) in options {
            packet[index] = *code;
            packet[index + 1] = data.len() as u8;
            packet[index + 2..index + 2 + data.len()].copy_from_slice(data);
            index += 2 + data.len();
        }

        packet[index] = OptionCode::End as u8;
        packet
    }

    fn create_packet_with_ciaddr(
        message_type: MessageType,
        mac: [u8; 6],
        ciaddr: Ipv4Addr,
        options: &[(u8, &[u8])],
    ) -> Vec<u8> {
        let mut packet = create_dhcp_packet(message_type, mac, 0x5678, options);
        packet[12..16].copy_from_slice(&ciaddr.octets());
        packet
    }

    fn request_packet(mac: [u8; 6], address: Ipv4Addr, server_id: Ipv4Addr) -> Vec<u8> {
        create_dhcp_packet(
            MessageType::Request,
            mac,
            0x5678,
            &[
                (OptionCode::RequestedIpAddress as u8, &address.octets()),
                (OptionCode::ServerIdentifier as u8, &server_id.octets()),
            ],
        )
    }

    fn options_of(payload: &[u8]) -> Vec<(u8, Vec<u8>)> {
        crate::packet::iterate_options(payload, payload.len())
            .map(|option| (option.code, option.data.to_vec()))
            .collect()
    }

    fn decode(payload: &[u8]) -> DhcpMessage<'_> {
        DhcpMessage::decode(payload, source(), SERVER_IP).unwrap()
    }

    fn lease_address(context: &mut ServerContext<RecordingHooks>, transport: &RecordingTransport) {
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 0x1234, &[]);
        context.handle_datagram(transport, &discover, source());
        let request = request_packet(MAC_A, POOL_IP, SERVER_IP);
        assert_eq!(
            context.handle_datagram(transport, &request, source()),
            Disposition::Replied(MessageType::Ack)
        );
    }

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(BROADCAST_DESTINATION.port(), 68);
        assert_eq!(*BROADCAST_DESTINATION.ip(), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_discover_offers_pool_address() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 0x0000_1234, &[]);

        let disposition = context.handle_datagram(&transport, &discover, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Offer));
        let payload = transport.last();
        let offer = decode(&payload);
        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, 0x0000_1234);
        assert_eq!(offer.htype, HTYPE_ETHERNET);
        assert_eq!(offer.hlen, HLEN_ETHERNET);
        assert_eq!(offer.chaddr, chaddr(MAC_A));
        assert_eq!(offer.yiaddr, POOL_IP);
        assert_eq!(offer.siaddr, SERVER_IP);
        assert_eq!(
            options_of(&payload),
            vec![
                (53, vec![2]),
                (54, SERVER_IP.octets().to_vec()),
                (1, vec![255, 255, 255, 0]),
                (3, SERVER_IP.octets().to_vec()),
                (51, 3600u32.to_be_bytes().to_vec()),
                (6, vec![8, 8, 8, 8]),
            ]
        );

        assert!(context.pool().is_empty());
        let binding = context.bindings().for_client(&chaddr(MAC_A)).unwrap();
        assert_eq!(binding.address, POOL_IP);
        assert_eq!(binding.state, BindingState::Offered);
    }

    #[test]
    fn test_discover_same_client_reoffers() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);

        context.handle_datagram(&transport, &discover, source());
        let disposition = context.handle_datagram(&transport, &discover, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Offer));
        assert_eq!(decode(&transport.last()).yiaddr, POOL_IP);
        assert_eq!(context.hooks().exhausted, 0);
    }

    #[test]
    fn test_discover_pool_exhausted_defers() {
        let mut context = test_context();
        let transport = RecordingTransport::default();

        let first = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        context.handle_datagram(&transport, &first, source());

        let second = create_dhcp_packet(MessageType::Discover, MAC_B, 2, &[]);
        let disposition = context.handle_datagram(&transport, &second, source());

        assert_eq!(disposition, Disposition::Deferred);
        assert_eq!(transport.count(), 1);
        assert_eq!(context.hooks().exhausted, 1);
    }

    #[test]
    fn test_request_for_other_server_ignored() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let request = request_packet(MAC_A, POOL_IP, Ipv4Addr::new(10, 0, 0, 9));

        let disposition = context.handle_datagram(&transport, &request, source());

        assert_eq!(disposition, Disposition::Ignored);
        assert_eq!(transport.count(), 0);
        assert_eq!(context.pool().len(), 1);
        assert!(context.bindings().is_empty());
    }

    #[test]
    fn test_request_after_offer_acks() {
        let mut context = test_context();
        let transport = RecordingTransport::default();

        lease_address(&mut context, &transport);

        let ack = transport.last();
        assert_eq!(decode(&ack).message_type(), Some(MessageType::Ack));
        assert_eq!(decode(&ack).yiaddr, POOL_IP);
        let binding = context.bindings().get(POOL_IP).unwrap();
        assert_eq!(binding.state, BindingState::Leased);
        assert_eq!(
            context.hooks().published,
            vec![(POOL_IP, chaddr(MAC_A), 3600)]
        );
    }

    #[test]
    fn test_request_free_address_without_offer() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let request = create_dhcp_packet(
            MessageType::Request,
            MAC_A,
            7,
            &[(OptionCode::RequestedIpAddress as u8, &POOL_IP.octets())],
        );

        let disposition = context.handle_datagram(&transport, &request, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Ack));
        assert!(context.pool().is_empty());
    }

    #[test]
    fn test_request_bound_to_other_client_naks() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        context.handle_datagram(&transport, &discover, source());

        let request = request_packet(MAC_B, POOL_IP, SERVER_IP);
        let disposition = context.handle_datagram(&transport, &request, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Nak));
        let payload = transport.last();
        let nak = decode(&payload);
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(options_of(&payload), vec![(53, vec![6])]);
        assert!(context.bindings().is_bound_to(POOL_IP, &chaddr(MAC_A)));
        assert!(context.hooks().published.is_empty());
    }

    #[test]
    fn test_request_out_of_range_naks() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let request = request_packet(MAC_A, Ipv4Addr::new(10, 0, 0, 99), SERVER_IP);

        let disposition = context.handle_datagram(&transport, &request, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Nak));
        assert_eq!(context.pool().len(), 1);
    }

    #[test]
    fn test_request_without_address_naks() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let request = create_dhcp_packet(MessageType::Request, MAC_A, 1, &[]);

        let disposition = context.handle_datagram(&transport, &request, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Nak));
    }

    #[test]
    fn test_request_renewal_with_ciaddr() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);

        let renew = create_packet_with_ciaddr(MessageType::Request, MAC_A, POOL_IP, &[]);
        let disposition = context.handle_datagram(&transport, &renew, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Ack));
        assert_eq!(context.hooks().published.len(), 2);
    }

    #[test]
    fn test_release_returns_address_once() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);
        assert!(context.pool().is_empty());

        let release = create_packet_with_ciaddr(MessageType::Release, MAC_A, POOL_IP, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &release, source()),
            Disposition::Handled
        );
        assert_eq!(context.pool().len(), 1);

        assert_eq!(
            context.handle_datagram(&transport, &release, source()),
            Disposition::Ignored
        );
        assert_eq!(context.pool().len(), 1);
        assert_eq!(transport.count(), 2);
    }

    #[test]
    fn test_release_by_other_client_ignored() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);

        let release = create_packet_with_ciaddr(MessageType::Release, MAC_B, POOL_IP, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &release, source()),
            Disposition::Ignored
        );
        assert!(context.pool().is_empty());
        assert!(context.bindings().is_bound_to(POOL_IP, &chaddr(MAC_A)));
    }

    #[test]
    fn test_decline_quarantines_address() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);
        let now = Utc::now();

        let decline = create_dhcp_packet(
            MessageType::Decline,
            MAC_A,
            9,
            &[(OptionCode::RequestedIpAddress as u8, &POOL_IP.octets())],
        );
        assert_eq!(
            context.handle_datagram_at(&transport, &decline, source(), now),
            Disposition::Handled
        );
        assert!(context.pool().is_empty());
        assert!(context.bindings().is_declined(POOL_IP));

        let request = request_packet(MAC_B, POOL_IP, SERVER_IP);
        assert_eq!(
            context.handle_datagram_at(&transport, &request, source(), now),
            Disposition::Replied(MessageType::Nak)
        );

        let later = now + TimeDelta::seconds(DECLINE_QUARANTINE_SECONDS);
        assert_eq!(
            context.handle_datagram_at(&transport, &request, source(), later),
            Disposition::Replied(MessageType::Ack)
        );
    }

    #[test]
    fn test_decline_by_other_client_ignored() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);

        let decline = create_dhcp_packet(
            MessageType::Decline,
            MAC_B,
            9,
            &[(OptionCode::RequestedIpAddress as u8, &POOL_IP.octets())],
        );
        assert_eq!(
            context.handle_datagram(&transport, &decline, source()),
            Disposition::Ignored
        );
        assert!(!context.bindings().is_declined(POOL_IP));
    }

    #[test]
    fn test_inform_does_not_consume_pool() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let inform = create_packet_with_ciaddr(
            MessageType::Inform,
            MAC_A,
            Ipv4Addr::new(10, 0, 0, 77),
            &[],
        );

        let disposition = context.handle_datagram(&transport, &inform, source());

        assert_eq!(disposition, Disposition::Replied(MessageType::Ack));
        assert_eq!(context.pool().len(), 1);
        let payload = transport.last();
        assert_eq!(decode(&payload).yiaddr, Ipv4Addr::UNSPECIFIED);
        let codes: Vec<u8> = options_of(&payload).into_iter().map(|(code, _)| code).collect();
        assert_eq!(codes, vec![53, 54, 1, 3, 6]);
    }

    #[test]
    fn test_unknown_message_type_ignored() {
        let mut context = test_context();
        let transport = RecordingTransport::default();

        let unknown = create_raw_packet(Some(42), MAC_A, 1, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &unknown, source()),
            Disposition::Ignored
        );

        let untyped = create_raw_packet(None, MAC_A, 1, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &untyped, source()),
            Disposition::Ignored
        );
        assert_eq!(transport.count(), 0);
        assert_eq!(context.pool().len(), 1);
    }

    #[test]
    fn test_server_message_types_ignored() {
        let mut context = test_context();
        let transport = RecordingTransport::default();

        for message_type in [MessageType::Offer, MessageType::Ack, MessageType::Nak] {
            let packet = create_dhcp_packet(message_type, MAC_A, 1, &[]);
            assert_eq!(
                context.handle_datagram(&transport, &packet, source()),
                Disposition::Ignored
            );
        }
        assert_eq!(transport.count(), 0);
    }

    #[test]
    fn test_malformed_datagram_dropped() {
        let mut context = test_context();
        let transport = RecordingTransport::default();

        assert_eq!(
            context.handle_datagram(&transport, &[0u8; 100], source()),
            Disposition::Dropped
        );

        let mut bad_cookie = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        bad_cookie[236] = 0;
        assert_eq!(
            context.handle_datagram(&transport, &bad_cookie, source()),
            Disposition::Dropped
        );
        assert_eq!(context.pool().len(), 1);
    }

    #[test]
    fn test_send_failure_does_not_stop_serving() {
        let mut context = test_context();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);

        assert_eq!(
            context.handle_datagram(&FailingTransport, &discover, source()),
            Disposition::SendFailed(MessageType::Offer)
        );

        let transport = RecordingTransport::default();
        assert_eq!(
            context.handle_datagram(&transport, &discover, source()),
            Disposition::Replied(MessageType::Offer)
        );
        assert_eq!(decode(&transport.last()).yiaddr, POOL_IP);
    }

    #[test]
    fn test_expired_offer_is_reclaimed() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let now = Utc::now();

        let first = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        context.handle_datagram_at(&transport, &first, source(), now);

        let second = create_dhcp_packet(MessageType::Discover, MAC_B, 2, &[]);
        let later = now + TimeDelta::seconds(OFFER_TIMEOUT_SECONDS);
        assert_eq!(
            context.handle_datagram_at(&transport, &second, source(), later),
            Disposition::Replied(MessageType::Offer)
        );
        assert!(context.bindings().is_bound_to(POOL_IP, &chaddr(MAC_B)));
        assert!(context.bindings().for_client(&chaddr(MAC_A)).is_none());
    }

    #[test]
    fn test_replenish_skips_known_addresses() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        context.handle_datagram(&transport, &discover, source());

        let added = context.replenish([
            POOL_IP,
            Ipv4Addr::new(10, 0, 0, 20),
            Ipv4Addr::new(10, 0, 0, 21),
        ]);

        assert_eq!(added, 1);
        assert!(context.pool().contains(Ipv4Addr::new(10, 0, 0, 20)));
        assert!(!context.pool().contains(POOL_IP));
    }

    #[test]
    fn test_pool_capacity_smaller_than_range() {
        let config = ServerConfig {
            range_low: u32::from(Ipv4Addr::new(10, 0, 0, 5)),
            range_high: u32::from(Ipv4Addr::new(10, 0, 0, 7)),
            pool_capacity: 2,
            ..test_config()
        };
        let context = ServerContext::new(config);

        assert_eq!(context.pool().len(), 2);
        assert!(!context.pool().contains(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_replenished_address_outside_range_is_acked() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        lease_address(&mut context, &transport);

        let outside = Ipv4Addr::new(10, 0, 1, 50);
        assert!(!context.config().in_range(outside));
        assert_eq!(context.replenish([outside]), 1);

        let discover = create_dhcp_packet(MessageType::Discover, MAC_B, 2, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &discover, source()),
            Disposition::Replied(MessageType::Offer)
        );
        assert_eq!(decode(&transport.last()).yiaddr, outside);

        let request = request_packet(MAC_B, outside, SERVER_IP);
        assert_eq!(
            context.handle_datagram(&transport, &request, source()),
            Disposition::Replied(MessageType::Ack)
        );
        assert_eq!(decode(&transport.last()).yiaddr, outside);
        assert!(context.bindings().is_bound_to(outside, &chaddr(MAC_B)));

        let renew = create_packet_with_ciaddr(MessageType::Request, MAC_B, outside, &[]);
        assert_eq!(
            context.handle_datagram(&transport, &renew, source()),
            Disposition::Replied(MessageType::Ack)
        );
    }

    #[test]
    fn test_request_outside_range_not_held_naks() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let outside = Ipv4Addr::new(10, 0, 1, 50);

        let request = request_packet(MAC_A, outside, SERVER_IP);
        assert_eq!(
            context.handle_datagram(&transport, &request, source()),
            Disposition::Replied(MessageType::Nak)
        );
        assert!(context.bindings().is_empty());
    }

    #[test]
    fn test_failed_ack_is_not_published() {
        let mut context = test_context();
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);
        context.handle_datagram(&transport, &discover, source());

        let request = request_packet(MAC_A, POOL_IP, SERVER_IP);
        assert_eq!(
            context.handle_datagram(&FailingTransport, &request, source()),
            Disposition::SendFailed(MessageType::Ack)
        );
        assert!(context.hooks().published.is_empty());

        assert_eq!(
            context.handle_datagram(&transport, &request, source()),
            Disposition::Replied(MessageType::Ack)
        );
        assert_eq!(
            context.hooks().published,
            vec![(POOL_IP, chaddr(MAC_A), 3600)]
        );
    }

    #[test]
    fn test_unencodable_reply_is_build_failure() {
        let config = ServerConfig {
            routers: vec![SERVER_IP; 40],
            nameservers: vec![Ipv4Addr::new(8, 8, 8, 8); 40],
            ..test_config()
        };
        let mut context = ServerContext::new(config);
        let transport = RecordingTransport::default();
        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 1, &[]);

        assert_eq!(
            context.handle_datagram(&transport, &discover, source()),
            Disposition::BuildFailed(MessageType::Offer)
        );
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn test_serve_one_over_loopback() {
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let client_addr = match client.local_addr().unwrap() {
            SocketAddr::V4(address) => address,
            SocketAddr::V6(_) => unreachable!(),
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into())
            .unwrap();

        let context = ServerContext::new(test_config()).with_reply_destination(client_addr);
        let mut server = DhcpServer::from_socket(context, socket).unwrap();
        let server_addr = server.local_addr().unwrap();

        let discover = create_dhcp_packet(MessageType::Discover, MAC_A, 0x1234, &[]);
        client.send_to(&discover, server_addr).unwrap();

        let disposition = server.serve_one().await.unwrap();
        assert_eq!(disposition, Disposition::Replied(MessageType::Offer));

        let mut buffer = [0u8; DHCP_MESSAGE_SIZE];
        let (len, _) = client.recv_from(&mut buffer).unwrap();
        let offer = decode(&buffer[..len]);
        assert_eq!(offer.xid, 0x1234);
        assert_eq!(offer.yiaddr, POOL_IP);
        assert!(server.context().pool().is_empty());
    }
}
