//! Traffic generator for putting a DHCP server under load.
//!
//! Two stresses are available:
//!
//! - `invalid-length` floods DISCOVERs whose router option claims more
//!   bytes than the datagram holds
//! - `request-all` sends one REQUEST for every address in a range

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dhcpd::options::{OptionCode, OptionWriter};
use dhcpd::packet::{
    BOOTREPLY, BOOTREQUEST, DHCP_MESSAGE_SIZE, DHCP_OPTIONS_OFFSET, prepare_request,
};
use dhcpd::server::DHCP_SERVER_PORT;
use dhcpd::transmit::{DHCP_CLIENT_PORT, Transport};
use dhcpd::{Error, MessageType, Result};

/// Claimed length of the truncated router option.
const OVERSIZED_ROUTER_LEN: u8 = 252;

#[derive(Parser)]
#[command(name = "dhcpstress")]
#[command(author, version, about = "Sends stress traffic at a DHCP server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Network interface to send from (Linux only).
    #[arg(long)]
    interface: Option<String>,

    /// Destination of every datagram.
    #[arg(long, default_value = "255.255.255.255:67")]
    remote: SocketAddrV4,

    /// Address to bind before sending.
    #[arg(long, default_value = "0.0.0.0:68")]
    local: SocketAddrV4,

    /// Pause between datagrams, in milliseconds.
    #[arg(long, default_value_t = 0)]
    sleep: u64,

    /// Seed for transaction IDs; defaults to the current time.
    #[arg(long)]
    seed: Option<u32>,

    /// BOOTP op code to send; derived from the ports when omitted.
    #[arg(long = "type")]
    op: Option<u8>,

    /// Stop after this many datagrams.
    #[arg(long)]
    count: Option<u64>,

    #[command(subcommand)]
    stress: Stress,
}

#[derive(Subcommand)]
enum Stress {
    /// DISCOVERs whose router option runs past the end of the datagram.
    InvalidLength,
    /// One REQUEST naming SERVER for every address from LOW to HIGH.
    RequestAll {
        server: Ipv4Addr,
        low: Ipv4Addr,
        high: Ipv4Addr,
    },
}

/// How datagrams are addressed and paced.
struct Pacing {
    remote: SocketAddrV4,
    op: u8,
    pause: Duration,
    limit: Option<u64>,
}

impl Pacing {
    fn allows(&self, attempts: u64) -> bool {
        self.limit.is_none_or(|limit| attempts < limit)
    }

    fn wait(&self) {
        if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
    }
}

/// Op code a peer on `local` would use when talking to `remote`.
fn default_op(local: SocketAddrV4, remote: SocketAddrV4) -> u8 {
    if local.port() == DHCP_SERVER_PORT && remote.port() == DHCP_CLIENT_PORT {
        BOOTREPLY
    } else {
        BOOTREQUEST
    }
}

/// Next transaction ID in the flood sequence.
fn next_xid(previous: u32, index: u32) -> u32 {
    ((previous ^ 16_777_619) >> (index % 8)) | (index % 65_535)
}

fn hardware_address(value: u32) -> [u8; 6] {
    let [a, b, c, d] = value.to_be_bytes();
    [a, b, c, d, 0, 0]
}

/// Writes a DISCOVER whose router option claims 252 bytes while only the
/// End option follows. Returns the datagram length.
fn invalid_length_message(message: &mut [u8; DHCP_MESSAGE_SIZE], op: u8, xid: u32) -> usize {
    prepare_request(message, op, xid, hardware_address(xid), Ipv4Addr::UNSPECIFIED);

    // Written by hand; OptionWriter refuses an option without its data.
    let options = [
        OptionCode::MessageType as u8,
        1,
        MessageType::Discover as u8,
        OptionCode::Router as u8,
        OVERSIZED_ROUTER_LEN,
        OptionCode::End as u8,
    ];
    message[DHCP_OPTIONS_OFFSET..DHCP_OPTIONS_OFFSET + options.len()].copy_from_slice(&options);
    DHCP_OPTIONS_OFFSET + options.len()
}

/// Writes a REQUEST for `address` naming `server`. Returns the datagram
/// length.
fn request_message(
    message: &mut [u8; DHCP_MESSAGE_SIZE],
    op: u8,
    server: Ipv4Addr,
    address: Ipv4Addr,
) -> Result<usize> {
    let xid = u32::from(address);
    prepare_request(message, op, xid, hardware_address(xid), server);

    let mut cursor = DHCP_OPTIONS_OFFSET;
    let mut writer = OptionWriter::new(message, DHCP_MESSAGE_SIZE, DHCP_OPTIONS_OFFSET);
    writer.insert(
        &mut cursor,
        OptionCode::MessageType as u8,
        &[MessageType::Request as u8],
    )?;
    writer.insert(
        &mut cursor,
        OptionCode::RequestedIpAddress as u8,
        &address.octets(),
    )?;
    writer.end(&mut cursor)?;
    Ok(cursor)
}

/// Floods invalid-length DISCOVERs. Returns how many were accepted by the
/// transport.
fn flood_invalid_length<T: Transport + ?Sized>(transport: &T, pacing: &Pacing, seed: u32) -> u64 {
    let mut message = [0u8; DHCP_MESSAGE_SIZE];
    let mut xid = seed;
    let mut attempts = 0u64;
    let mut sent = 0u64;

    while pacing.allows(attempts) {
        xid = next_xid(xid, attempts as u32);
        let len = invalid_length_message(&mut message, pacing.op, xid);

        match transport.send_datagram(&message[..len], pacing.remote) {
            Ok(_) => sent += 1,
            Err(error) => debug!("Dropped datagram {:#010x}: {}", xid, error),
        }

        attempts += 1;
        pacing.wait();
    }

    sent
}

/// Sends one REQUEST per address in `[low, high]`. Returns how many were
/// accepted by the transport.
fn request_all<T: Transport + ?Sized>(
    transport: &T,
    pacing: &Pacing,
    server: Ipv4Addr,
    low: Ipv4Addr,
    high: Ipv4Addr,
) -> Result<u64> {
    if low > high {
        return Err(Error::InvalidConfig {
            field: "high".to_string(),
            reason: format!("{} is below {}", high, low),
        });
    }

    let mut message = [0u8; DHCP_MESSAGE_SIZE];
    let mut sent = 0u64;

    for (attempts, value) in (u32::from(low)..=u32::from(high)).enumerate() {
        if !pacing.allows(attempts as u64) {
            break;
        }

        let address = Ipv4Addr::from(value);
        let len = request_message(&mut message, pacing.op, server, address)?;
        debug!("Request IP address {}", address);

        match transport.send_datagram(&message[..len], pacing.remote) {
            Ok(_) => sent += 1,
            Err(error) => warn!("Failed to send REQUEST for {}: {}", address, error),
        }

        pacing.wait();
    }

    Ok(sent)
}

fn create_socket(
    local: SocketAddrV4,
    interface: Option<&str>,
    nonblocking: bool,
) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(nonblocking)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    if let Some(interface) = interface {
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

    socket
        .bind(&SocketAddr::V4(local).into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", local, error)))?;

    Ok(socket)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let pacing = Pacing {
        remote: cli.remote,
        op: cli.op.unwrap_or_else(|| default_op(cli.local, cli.remote)),
        pause: Duration::from_millis(cli.sleep),
        limit: cli.count,
    };

    let flooding = matches!(cli.stress, Stress::InvalidLength);
    let socket = create_socket(cli.local, cli.interface.as_deref(), flooding)?;

    let sent = match cli.stress {
        Stress::InvalidLength => {
            let seed = cli.seed.unwrap_or_else(|| chrono::Utc::now().timestamp() as u32);
            info!("Flooding {} with invalid-length DISCOVERs, seed {}", pacing.remote, seed);
            flood_invalid_length(&socket, &pacing, seed)
        }
        Stress::RequestAll { server, low, high } => {
            info!("Requesting {} - {} from {} via {}", low, high, server, pacing.remote);
            request_all(&socket, &pacing, server, low, high)?
        }
    };

    info!("Sent {} datagrams", sent);
    Ok(())
}
