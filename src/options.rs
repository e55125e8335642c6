//! DHCP options as defined in RFC 2132.
//!
//! DHCP uses options to convey configuration parameters between servers and clients.
//! Each option has a code (1 byte), length (1 byte), and variable-length data;
//! Pad (0) and End (255) are single bytes.
//!
//! The legal shape of every option is described once, by [`LengthRule::for_code`].
//! The reply builder ([`OptionWriter`]) refuses to write anything that breaks
//! the rule, and the decode side ([`DhcpOption::is_valid`]) uses the same table
//! to decide which received options may be trusted.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3442: Classless Static Route Option
//! - RFC 4039: Rapid Commit Option

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Largest payload a single option can carry (1-byte length field).
pub const MAX_OPTION_DATA: usize = 255;

/// Maximum number of IP addresses in Router (3) or DNS Server (6) options.
///
/// With 4 bytes per IPv4 address and 255 bytes of payload, that's 63 addresses.
pub const MAX_ADDRESSES_PER_OPTION: usize = MAX_OPTION_DATA / 4;

/// DHCP option codes handled by the server core.
///
/// Other codes are still walked and validated through [`LengthRule`], they
/// just have no name here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Used for alignment.
    Pad = 0,
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// DNS server addresses (RFC 2132 §3.8).
    DnsServer = 6,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Rapid commit (RFC 4039).
    RapidCommit = 80,
    /// End of options marker.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            80 => Ok(Self::RapidCommit),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Length constraint attached to an option code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// No data at all (Pad, End, Rapid Commit).
    Empty,
    /// Exactly this many bytes.
    Exactly(usize),
    /// A multiple of `unit` bytes; zero only if `allow_empty`.
    MultipleOf { unit: usize, allow_empty: bool },
    /// At least this many bytes, no multiple constraint.
    AtLeast(usize),
    /// Codes without a registered shape.
    Unconstrained,
}

impl LengthRule {
    /// Looks up the rule for an option code.
    pub const fn for_code(code: u8) -> Self {
        match code {
            // Pad, End, Rapid Commit
            0x00 | 0xFF | 0x50 => Self::Empty,

            // IP Forwarding, Non-Local Source Routing, Default TTL, All Subnets
            // Local, Mask Discovery, Mask Supplier, Router Discovery, Trailer
            // Encapsulation, Ethernet Encapsulation, TCP TTL, Keepalive Garbage,
            // NetBIOS Node Type, Option Overload, DHCP Message Type
            0x13 | 0x14 | 0x17 | 0x1B | 0x1D | 0x1E | 0x1F | 0x22 | 0x24 | 0x25 | 0x27
            | 0x2E | 0x34 | 0x35 => Self::Exactly(1),

            // Boot File Size, Max Reassembly Size, Interface MTU, Max DHCP Message Size
            0x0D | 0x16 | 0x1A | 0x39 => Self::Exactly(2),

            // Subnet Mask, Time Offset, Swap Server, PMTU Aging Timeout, Broadcast
            // Address, Router Solicitation Address, ARP Cache Timeout, TCP
            // Keepalive Interval, Requested IP, Lease Time, Server Identifier,
            // Renewal (T1), Rebinding (T2)
            0x01 | 0x02 | 0x10 | 0x18 | 0x1C | 0x20 | 0x23 | 0x26 | 0x32 | 0x33 | 0x36
            | 0x3A | 0x3B => Self::Exactly(4),

            // Address lists: Routers, Time/Name/DNS/Log/Cookie/LPR/Impress/RLP
            // servers, NIS, NTP, NetBIOS NS/DD, X font/display, NIS+, SMTP, POP3,
            // NNTP, WWW, Finger, IRC, StreetTalk, STDA
            0x03..=0x0B
            | 0x29
            | 0x2A
            | 0x2C
            | 0x2D
            | 0x30
            | 0x31
            | 0x41
            | 0x45..=0x4C => Self::MultipleOf {
                unit: 4,
                allow_empty: false,
            },

            // Mobile IP Home Agent may legitimately be empty
            0x44 => Self::MultipleOf {
                unit: 4,
                allow_empty: true,
            },

            // Policy Filter, Static Routes
            0x15 | 0x21 => Self::MultipleOf {
                unit: 8,
                allow_empty: false,
            },

            // PMTU Plateau Table
            0x19 => Self::MultipleOf {
                unit: 2,
                allow_empty: false,
            },

            // Hostname, Merit Dump, Domain Name, Root Path, Extensions Path, NIS
            // Domain, Vendor Specific, NetBIOS Scope, Parameter Request List,
            // Message, Class Identifier, Client Identifier, NIS+ Domain, TFTP
            // Server, Boot Filename, LDAP, PCode, TCode, SIP Servers
            0x0C | 0x0E | 0x0F | 0x11 | 0x12 | 0x28 | 0x2B | 0x2F | 0x37 | 0x38 | 0x3C
            | 0x3D | 0x40 | 0x42 | 0x43 | 0x4F | 0x64 | 0x65 | 0x78 => Self::AtLeast(1),

            // Classless Static Routes: smallest entry is a /0 width byte plus router
            0x79 => Self::AtLeast(5),

            _ => Self::Unconstrained,
        }
    }

    /// Returns true if `len` bytes of data satisfy this rule.
    pub const fn permits(self, len: usize) -> bool {
        match self {
            Self::Empty => len == 0,
            Self::Exactly(expected) => len == expected,
            Self::MultipleOf { unit, allow_empty } => {
                (allow_empty || len > 0) && len.is_multiple_of(unit)
            }
            Self::AtLeast(minimum) => len >= minimum,
            Self::Unconstrained => true,
        }
    }
}

impl fmt::Display for LengthRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "no data"),
            Self::Exactly(expected) => write!(f, "exactly {} bytes", expected),
            Self::MultipleOf {
                unit,
                allow_empty: true,
            } => write!(f, "a multiple of {} bytes", unit),
            Self::MultipleOf {
                unit,
                allow_empty: false,
            } => write!(f, "a non-zero multiple of {} bytes", unit),
            Self::AtLeast(minimum) => write!(f, "at least {} bytes", minimum),
            Self::Unconstrained => write!(f, "any length"),
        }
    }
}

/// Returns true for the two codes encoded as a single byte.
pub const fn is_single_byte(code: u8) -> bool {
    code == OptionCode::Pad as u8 || code == OptionCode::End as u8
}

/// One option as it appears in a received message.
///
/// Borrowed from the datagram; nothing is copied while walking options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpOption<'a> {
    pub code: u8,
    pub data: &'a [u8],
}

impl<'a> DhcpOption<'a> {
    pub fn new(code: u8, data: &'a [u8]) -> Self {
        Self { code, data }
    }

    /// Declared length of the option data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Checks the option against the shared rule table.
    pub fn is_valid(&self) -> bool {
        LengthRule::for_code(self.code).permits(self.data.len())
    }

    /// Interprets a 4-byte option as an IPv4 address.
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.data.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Interprets a 4-byte option as a big-endian integer.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Appends options to a reply buffer, enforcing [`LengthRule`].
///
/// The writer tracks how many bytes of the buffer are in use. Every
/// [`insert`](Self::insert) is given the caller's cursor, and a cursor that
/// does not match the tracked offset is refused, so two parts of the code can
/// never interleave writes into the same reply.
#[derive(Debug)]
pub struct OptionWriter<'b> {
    buffer: &'b mut [u8],
    capacity: usize,
    written: usize,
}

impl<'b> OptionWriter<'b> {
    /// Creates a writer whose first option goes at `start`.
    ///
    /// `capacity` is clamped to the buffer length.
    pub fn new(buffer: &'b mut [u8], capacity: usize, start: usize) -> Self {
        let capacity = capacity.min(buffer.len());
        Self {
            buffer,
            capacity,
            written: start,
        }
    }

    /// Number of bytes of the buffer in use (header plus options so far).
    pub fn written(&self) -> usize {
        self.written
    }

    /// Writes one option at `cursor` and advances it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] and leaves the buffer untouched if
    /// the cursor is not at the tracked offset, the option does not fit in
    /// the capacity, the data is longer than 255 bytes, or the data length
    /// breaks the code's [`LengthRule`].
    pub fn insert(&mut self, cursor: &mut usize, code: u8, data: &[u8]) -> Result<()> {
        if *cursor != self.written {
            return Err(Error::invalid_option(
                code,
                format!(
                    "write at offset {} but {} bytes already written",
                    cursor, self.written
                ),
            ));
        }

        if data.len() > MAX_OPTION_DATA {
            return Err(Error::invalid_option(
                code,
                format!("{} bytes of data exceeds {}", data.len(), MAX_OPTION_DATA),
            ));
        }

        let rule = LengthRule::for_code(code);
        if !rule.permits(data.len()) {
            return Err(Error::invalid_option(
                code,
                format!("expected {}, got {} bytes", rule, data.len()),
            ));
        }

        let encoded_len = if is_single_byte(code) {
            1
        } else {
            2 + data.len()
        };

        if *cursor + encoded_len > self.capacity {
            return Err(Error::invalid_option(
                code,
                format!(
                    "{} bytes at offset {} overflow capacity {}",
                    encoded_len, cursor, self.capacity
                ),
            ));
        }

        let start = *cursor;
        self.buffer[start] = code;
        if !is_single_byte(code) {
            self.buffer[start + 1] = data.len() as u8;
            self.buffer[start + 2..start + encoded_len].copy_from_slice(data);
        }

        *cursor += encoded_len;
        self.written = *cursor;
        Ok(())
    }

    /// Writes the End option.
    pub fn end(&mut self, cursor: &mut usize) -> Result<()> {
        self.insert(cursor, OptionCode::End as u8, &[])
    }
}

/// Flattens a list of addresses into option data (4 bytes each).
pub fn address_list(addresses: &[Ipv4Addr]) -> Vec<u8> {
    addresses.iter().flat_map(|address| address.octets()).collect()
}
