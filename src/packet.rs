//! DHCP message decoding and reply header construction per RFC 2131.
//!
//! A DHCP message consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. [`DhcpMessage`] is a checked,
//! borrowed view over a received datagram; [`prepare_reply`] lays down the
//! header of the answer in a fixed 576-byte buffer.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol

use std::iter::FusedIterator;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, is_single_byte};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Size of every message buffer, received or sent.
///
/// 576 bytes is the minimum datagram size all hosts must accept per RFC 791.
pub const DHCP_MESSAGE_SIZE: usize = 576;

/// Minimum DHCP packet size per RFC 2131 §2.
///
/// Replies are zero padded to this length for BOOTP relay agents.
pub const DHCP_MIN_PACKET_SIZE: usize = 300;

const OP_OFFSET: usize = 0;
const HTYPE_OFFSET: usize = 1;
const HLEN_OFFSET: usize = 2;
const HOPS_OFFSET: usize = 3;
const XID_OFFSET: usize = 4;
const SECS_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 10;
const CIADDR_OFFSET: usize = 12;
const YIADDR_OFFSET: usize = 16;
const SIADDR_OFFSET: usize = 20;
const GIADDR_OFFSET: usize = 24;
const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
const MAGIC_COOKIE_OFFSET: usize = 236;

/// Offset of the first option, right after the magic cookie.
pub const DHCP_OPTIONS_OFFSET: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Size of the fixed header portion including magic cookie.
pub const DHCP_FIXED_HEADER_SIZE: usize = DHCP_OPTIONS_OFFSET;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// Hardware address length for Ethernet (6 bytes).
pub const HLEN_ETHERNET: u8 = 6;

/// Walks the option area of `bytes` up to `end`.
///
/// The walk starts at the first option after the magic cookie and stops at
/// the End option, or as soon as the next option would start at or past
/// `end`. An option whose declared length runs past `end` is never yielded.
/// `end` is clamped to `bytes.len()`. Calling this again restarts the walk.
pub fn iterate_options(bytes: &[u8], end: usize) -> Options<'_> {
    Options {
        bytes,
        end: end.min(bytes.len()),
        cursor: DHCP_OPTIONS_OFFSET,
    }
}

/// Lazy iterator over the options of a message.
///
/// Created by [`iterate_options`] or [`DhcpMessage::options`].
#[derive(Debug, Clone)]
pub struct Options<'a> {
    bytes: &'a [u8],
    end: usize,
    cursor: usize,
}

impl<'a> Iterator for Options<'a> {
    type Item = DhcpOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor >= self.end {
                return None;
            }

            let code = self.bytes[self.cursor];
            if code == OptionCode::End as u8 {
                self.cursor = self.end;
                return None;
            }

            if is_single_byte(code) {
                self.cursor += 1;
                continue;
            }

            let length_at = self.cursor + 1;
            if length_at >= self.end {
                self.cursor = self.end;
                return None;
            }

            let length = self.bytes[length_at] as usize;
            let data_start = self.cursor + 2;
            let next = data_start + length;
            if next >= self.end {
                self.cursor = self.end;
                return None;
            }

            self.cursor = next;
            return Some(DhcpOption::new(code, &self.bytes[data_start..next]));
        }
    }
}

impl FusedIterator for Options<'_> {}

/// A received DHCP message.
///
/// Header fields are decoded eagerly, options are walked on demand. The
/// view also carries where the datagram came from and the address of this
/// server, which is what replies use as their server identifier.
#[derive(Debug, Clone)]
pub struct DhcpMessage<'a> {
    bytes: &'a [u8],

    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hardware address length. [`HLEN_ETHERNET`] (6) for Ethernet.
    pub hlen: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 (0x8000) = broadcast flag.
    pub flags: u16,

    /// Client IP address (set by client in RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address.
    pub yiaddr: Ipv4Addr,

    /// Server IP address.
    pub siaddr: Ipv4Addr,

    /// Gateway IP address - set by relay agents.
    pub giaddr: Ipv4Addr,

    /// Client hardware address (MAC for Ethernet), all 16 bytes.
    pub chaddr: [u8; 16],

    /// Raw value of option 53, if a well-formed one was present.
    pub raw_message_type: Option<u8>,

    /// Transport address the datagram was received from.
    pub source: SocketAddr,

    /// This server's own address, used as the server identifier.
    pub server_id: Ipv4Addr,
}

impl<'a> DhcpMessage<'a> {
    /// Decodes a datagram into a message view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if the datagram is shorter than
    /// 240 bytes or the magic cookie is not 99.130.83.99. No option is
    /// looked at before both checks pass.
    pub fn decode(bytes: &'a [u8], source: SocketAddr, server_id: Ipv4Addr) -> Result<Self> {
        if bytes.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                bytes.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if bytes[MAGIC_COOKIE_OFFSET..DHCP_OPTIONS_OFFSET] != DHCP_MAGIC_COOKIE {
            return Err(Error::MalformedPacket("Invalid magic cookie".to_string()));
        }

        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr.copy_from_slice(&bytes[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE]);

        let raw_message_type = iterate_options(bytes, bytes.len())
            .filter(|option| option.code == OptionCode::MessageType as u8 && option.is_valid())
            .last()
            .map(|option| option.data[0]);

        Ok(Self {
            bytes,
            op: bytes[OP_OFFSET],
            htype: bytes[HTYPE_OFFSET],
            hlen: bytes[HLEN_OFFSET],
            hops: bytes[HOPS_OFFSET],
            xid: read_u32(bytes, XID_OFFSET),
            secs: read_u16(bytes, SECS_OFFSET),
            flags: read_u16(bytes, FLAGS_OFFSET),
            ciaddr: read_ipv4(bytes, CIADDR_OFFSET),
            yiaddr: read_ipv4(bytes, YIADDR_OFFSET),
            siaddr: read_ipv4(bytes, SIADDR_OFFSET),
            giaddr: read_ipv4(bytes, GIADDR_OFFSET),
            chaddr,
            raw_message_type,
            source,
            server_id,
        })
    }

    /// The raw datagram.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Restartable walk over this message's options.
    pub fn options(&self) -> Options<'a> {
        iterate_options(self.bytes, self.bytes.len())
    }

    /// Returns the DHCP message type (Option 53) if it is a known one.
    pub fn message_type(&self) -> Option<MessageType> {
        self.raw_message_type
            .and_then(|value| MessageType::try_from(value).ok())
    }

    /// Finds the last option with `code` that satisfies the rule table.
    pub fn find_option(&self, code: u8) -> Option<DhcpOption<'a>> {
        self.options()
            .filter(|option| option.code == code && option.is_valid())
            .last()
    }

    /// Returns the requested IP address (Option 50) if present.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find_option(OptionCode::RequestedIpAddress as u8)
            .and_then(|option| option.as_ipv4())
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients include this in REQUEST to indicate which server's
    /// offer they are accepting.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find_option(OptionCode::ServerIdentifier as u8)
            .and_then(|option| option.as_ipv4())
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// Formats the client hardware address as a colon-separated string.
    ///
    /// For Ethernet, returns format like "aa:bb:cc:dd:ee:ff".
    pub fn format_mac(&self) -> String {
        format_hardware_address(&self.chaddr, self.hlen)
    }
}

/// Formats the first `hlen` bytes of a hardware address.
pub fn format_hardware_address(chaddr: &[u8; 16], hlen: u8) -> String {
    use std::fmt::Write;
    let len = (hlen as usize).min(chaddr.len());
    let mut result = String::with_capacity(len * 3);
    for (index, byte) in chaddr[..len].iter().enumerate() {
        if index > 0 {
            result.push(':');
        }
        let _ = write!(result, "{:02x}", byte);
    }
    result
}

/// Writes the header of a reply to `request` into `reply`.
///
/// The buffer is zeroed first. `xid`, `htype`, `hlen`, `flags`, `giaddr`
/// and the 16-byte `chaddr` are copied from the request, `op` is flipped
/// (a request with op 2 gets 1, anything else gets [`BOOTREPLY`]), `siaddr`
/// is this server's address and the magic cookie is written. Options start
/// at [`DHCP_OPTIONS_OFFSET`].
pub fn prepare_reply(reply: &mut [u8; DHCP_MESSAGE_SIZE], request: &DhcpMessage<'_>) {
    reply.fill(0);

    let source = request.as_bytes();
    reply[OP_OFFSET] = if request.op == BOOTREPLY {
        BOOTREQUEST
    } else {
        BOOTREPLY
    };
    reply[HTYPE_OFFSET] = request.htype;
    reply[HLEN_OFFSET] = request.hlen;
    reply[XID_OFFSET..XID_OFFSET + 4].copy_from_slice(&source[XID_OFFSET..XID_OFFSET + 4]);
    reply[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&request.flags.to_be_bytes());
    reply[SIADDR_OFFSET..SIADDR_OFFSET + 4].copy_from_slice(&request.server_id.octets());
    reply[GIADDR_OFFSET..GIADDR_OFFSET + 4].copy_from_slice(&request.giaddr.octets());
    reply[CHADDR_OFFSET..CHADDR_OFFSET + CHADDR_SIZE].copy_from_slice(&request.chaddr);
    reply[MAGIC_COOKIE_OFFSET..DHCP_OPTIONS_OFFSET].copy_from_slice(&DHCP_MAGIC_COOKIE);
}

/// Writes the header of a client message into `message`.
///
/// The buffer is zeroed first. The hardware type is Ethernet, `chaddr`
/// fills the first six bytes of the hardware address and the magic cookie
/// is written. Options start at [`DHCP_OPTIONS_OFFSET`].
pub fn prepare_request(
    message: &mut [u8; DHCP_MESSAGE_SIZE],
    op: u8,
    xid: u32,
    chaddr: [u8; 6],
    siaddr: Ipv4Addr,
) {
    message.fill(0);

    message[OP_OFFSET] = op;
    message[HTYPE_OFFSET] = HTYPE_ETHERNET;
    message[HLEN_OFFSET] = HLEN_ETHERNET;
    message[XID_OFFSET..XID_OFFSET + 4].copy_from_slice(&xid.to_be_bytes());
    message[SIADDR_OFFSET..SIADDR_OFFSET + 4].copy_from_slice(&siaddr.octets());
    message[CHADDR_OFFSET..CHADDR_OFFSET + chaddr.len()].copy_from_slice(&chaddr);
    message[MAGIC_COOKIE_OFFSET..DHCP_OPTIONS_OFFSET].copy_from_slice(&DHCP_MAGIC_COOKIE);
}

/// Sets `yiaddr` in a reply buffer.
pub fn set_yiaddr(reply: &mut [u8; DHCP_MESSAGE_SIZE], address: Ipv4Addr) {
    reply[YIADDR_OFFSET..YIADDR_OFFSET + 4].copy_from_slice(&address.octets());
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_ipv4(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    )
}
