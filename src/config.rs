//! Server configuration.
//!
//! [`ConfigFile`] is what lives on disk: JSON with addresses as plain
//! strings, so that a typo is reported against the field it is in rather
//! than as a generic parse failure. [`ServerConfig`] is the validated form
//! the server runs with, built once through `TryFrom<&ConfigFile>`.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::lease::DhcpLease;
use crate::options::{MAX_ADDRESSES_PER_OPTION, OptionWriter};
use crate::packet::{DHCP_MESSAGE_SIZE, DHCP_OPTIONS_OFFSET};

/// Largest address range accepted, one /16.
pub const MAX_RANGE_SIZE: u64 = 65_536;

/// Bytes of options an OFFER or ACK carries ahead of the lease: message
/// type (3) and server identifier (6).
const REPLY_PREAMBLE_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server_ip: String,
    pub range_low: String,
    pub range_high: String,
    pub routers: Vec<String>,
    pub nameservers: Vec<String>,
    pub lease_time: u32,
    pub prefix_len: u8,
    pub interface: Option<String>,
    /// Defaults to the number of addresses in the range.
    pub pool_capacity: Option<usize>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            server_ip: "192.168.1.1".to_string(),
            range_low: "192.168.1.100".to_string(),
            range_high: "192.168.1.200".to_string(),
            routers: vec!["192.168.1.1".to_string()],
            nameservers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            lease_time: 86400,
            prefix_len: 24,
            interface: None,
            pool_capacity: None,
        }
    }
}

impl ConfigFile {
    /// Reads the file at `path`, or writes the defaults there if it does not
    /// exist yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ConfigFile = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = ConfigFile::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Validated, immutable server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address this server is bound to, sent as the server identifier.
    pub server_ip: Ipv4Addr,
    pub routers: Vec<Ipv4Addr>,
    pub nameservers: Vec<Ipv4Addr>,
    /// Inclusive range bounds, host order.
    pub range_low: u32,
    pub range_high: u32,
    pub lease_time: u32,
    pub prefix_len: u8,
    pub interface: Option<String>,
    pub pool_capacity: usize,
}

impl ServerConfig {
    /// Returns true if `address` lies within `[range_low, range_high]`.
    pub fn in_range(&self, address: Ipv4Addr) -> bool {
        (self.range_low..=self.range_high).contains(&u32::from(address))
    }

    /// Number of addresses in the range.
    pub fn range_size(&self) -> u64 {
        u64::from(self.range_high) - u64::from(self.range_low) + 1
    }

    /// The lease handed out together with `address`.
    pub fn lease_for(&self, address: Ipv4Addr) -> DhcpLease {
        DhcpLease {
            address,
            routers: self.routers.clone(),
            nameservers: self.nameservers.clone(),
            lease_time: self.lease_time,
            prefix_len: self.prefix_len,
        }
    }

    /// Configuration-only reply content for INFORM: no address, no lease
    /// time.
    pub fn inform_lease(&self) -> DhcpLease {
        DhcpLease {
            lease_time: 0,
            ..self.lease_for(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn parse_address(field: &str, literal: &str) -> Result<Ipv4Addr> {
    literal.trim().parse::<Ipv4Addr>().map_err(|_| {
        Error::invalid_config(
            field,
            format!("'{}' is not a dotted-decimal IPv4 address", literal),
        )
    })
}

fn parse_address_list(field: &str, literals: &[String]) -> Result<Vec<Ipv4Addr>> {
    if literals.len() > MAX_ADDRESSES_PER_OPTION {
        return Err(Error::invalid_config(
            field,
            format!(
                "{} addresses given, at most {} fit in one option",
                literals.len(),
                MAX_ADDRESSES_PER_OPTION
            ),
        ));
    }

    literals
        .iter()
        .enumerate()
        .map(|(index, literal)| parse_address(&format!("{}[{}]", field, index), literal))
        .collect()
}

/// Writes `lease` into a scratch reply to see whether it fits.
fn check_reply_fits(lease: &DhcpLease) -> Result<()> {
    let mut scratch = [0u8; DHCP_MESSAGE_SIZE];
    let mut cursor = DHCP_OPTIONS_OFFSET + REPLY_PREAMBLE_LEN;
    let mut writer = OptionWriter::new(&mut scratch, DHCP_MESSAGE_SIZE, cursor);
    lease.write_options(&mut writer, &mut cursor)
}

impl TryFrom<&ConfigFile> for ServerConfig {
    type Error = Error;

    fn try_from(file: &ConfigFile) -> Result<Self> {
        let server_ip = parse_address("server_ip", &file.server_ip)?;
        if server_ip.is_unspecified() || server_ip.is_broadcast() || server_ip.is_multicast() {
            return Err(Error::invalid_config(
                "server_ip",
                format!("{} cannot identify a server", server_ip),
            ));
        }

        let range_low = u32::from(parse_address("range_low", &file.range_low)?);
        let range_high = u32::from(parse_address("range_high", &file.range_high)?);
        if range_low > range_high {
            return Err(Error::invalid_config(
                "range_high",
                "must be greater than or equal to range_low",
            ));
        }

        let range_size = u64::from(range_high) - u64::from(range_low) + 1;
        if range_size > MAX_RANGE_SIZE {
            return Err(Error::invalid_config(
                "range_high",
                format!(
                    "range holds {} addresses, at most {} allowed",
                    range_size, MAX_RANGE_SIZE
                ),
            ));
        }

        if (range_low..=range_high).contains(&u32::from(server_ip)) {
            return Err(Error::invalid_config(
                "server_ip",
                "must not be within the address range",
            ));
        }

        let routers = parse_address_list("routers", &file.routers)?;
        let nameservers = parse_address_list("nameservers", &file.nameservers)?;

        if file.prefix_len > 32 {
            return Err(Error::invalid_config(
                "prefix_len",
                format!("{} is not between 0 and 32", file.prefix_len),
            ));
        }

        let largest_lease = DhcpLease {
            address: Ipv4Addr::UNSPECIFIED,
            routers: routers.clone(),
            nameservers: nameservers.clone(),
            lease_time: file.lease_time,
            prefix_len: file.prefix_len,
        };
        if let Err(error) = check_reply_fits(&largest_lease) {
            return Err(Error::invalid_config(
                "nameservers",
                format!(
                    "{} routers and {} nameservers do not fit in a {}-byte reply ({})",
                    routers.len(),
                    nameservers.len(),
                    DHCP_MESSAGE_SIZE,
                    error
                ),
            ));
        }

        let pool_capacity = match file.pool_capacity {
            Some(0) => {
                return Err(Error::invalid_config(
                    "pool_capacity",
                    "must be greater than 0",
                ));
            }
            Some(capacity) => capacity,
            None => range_size as usize,
        };

        if let Some(interface) = &file.interface
            && interface.trim().is_empty()
        {
            return Err(Error::invalid_config("interface", "must not be empty"));
        }

        Ok(Self {
            server_ip,
            routers,
            nameservers,
            range_low,
            range_high,
            lease_time: file.lease_time,
            prefix_len: file.prefix_len,
            interface: file.interface.clone(),
            pool_capacity,
        })
    }
}
