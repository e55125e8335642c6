//! Reply serialization and sending.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::Result;
use crate::lease::DhcpLease;
use crate::options::{MessageType, OptionCode, OptionWriter};
use crate::packet::{
    DHCP_MESSAGE_SIZE, DHCP_MIN_PACKET_SIZE, DHCP_OPTIONS_OFFSET, DhcpMessage, prepare_reply,
    set_yiaddr,
};

/// UDP port clients listen on.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Where replies go unless overridden: the limited broadcast address.
pub const BROADCAST_DESTINATION: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT);

/// Something a datagram can be sent through without blocking.
pub trait Transport {
    fn send_datagram(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<usize>;
}

impl Transport for socket2::Socket {
    fn send_datagram(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<usize> {
        self.send_to(payload, &SocketAddr::V4(destination).into())
    }
}

impl Transport for std::net::UdpSocket {
    fn send_datagram(&self, payload: &[u8], destination: SocketAddrV4) -> io::Result<usize> {
        self.send_to(payload, destination)
    }
}

/// Builds the reply to `request` in `reply` and returns its length.
///
/// Option 53 always comes first. OFFER and ACK with a lease then carry the
/// server identifier and the lease options, everything else ends right
/// after the message type. The length is never below the 300-byte BOOTP
/// minimum; the tail is zero padding.
///
/// # Errors
///
/// Any [`Error::InvalidOption`](crate::Error::InvalidOption) from writing
/// the options. The buffer content is then unspecified.
pub fn build_reply(
    reply: &mut [u8; DHCP_MESSAGE_SIZE],
    message_type: MessageType,
    request: &DhcpMessage<'_>,
    lease: Option<&DhcpLease>,
) -> Result<usize> {
    prepare_reply(reply, request);

    let lease = lease.filter(|_| matches!(message_type, MessageType::Offer | MessageType::Ack));
    if let Some(lease) = lease {
        set_yiaddr(reply, lease.address);
    }

    let mut cursor = DHCP_OPTIONS_OFFSET;
    let mut writer = OptionWriter::new(reply, DHCP_MESSAGE_SIZE, DHCP_OPTIONS_OFFSET);
    writer.insert(
        &mut cursor,
        OptionCode::MessageType as u8,
        &[message_type as u8],
    )?;

    match lease {
        Some(lease) => {
            writer.insert(
                &mut cursor,
                OptionCode::ServerIdentifier as u8,
                &request.server_id.octets(),
            )?;
            lease.write_options(&mut writer, &mut cursor)?;
        }
        None => writer.end(&mut cursor)?,
    }

    Ok(cursor.max(DHCP_MIN_PACKET_SIZE))
}

/// Builds a reply and sends it to `destination`.
///
/// Returns the number of bytes handed to the transport.
///
/// # Errors
///
/// [`Error::Io`](crate::Error::Io) if the transport refused the datagram,
/// anything else if the reply could not be built.
pub fn send<T: Transport + ?Sized>(
    transport: &T,
    message_type: MessageType,
    request: &DhcpMessage<'_>,
    lease: Option<&DhcpLease>,
    destination: SocketAddrV4,
) -> Result<usize> {
    let mut reply = [0u8; DHCP_MESSAGE_SIZE];
    let len = build_reply(&mut reply, message_type, request, lease)?;
    let sent = transport.send_datagram(&reply[..len], destination)?;
    Ok(sent)
}
