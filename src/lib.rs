//! # dhcpd
//!
//! A single-socket DHCPv4 server core (RFC 2131 / RFC 2132).
//!
//! ## Features
//!
//! - Byte-exact message codec with a lazy, bounds-checked option walk
//! - One option length rule table shared by decoding and reply building
//! - Capacity-bounded LIFO address pool
//! - DISCOVER, REQUEST, RELEASE, DECLINE and INFORM handling with
//!   multi-server coexistence (REQUESTs naming another server are ignored)
//! - Call points for cluster coordination ([`ClusterHooks`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpd::{ConfigFile, DhcpServer, ServerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> dhcpd::Result<()> {
//!     let file = ConfigFile::load_or_create("config.json")?;
//!     let config = ServerConfig::try_from(&file)?;
//!     let mut server = DhcpServer::new(config)?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpMessage`] - decoded view of a received datagram
//! - [`OptionWriter`] - reply option builder enforcing [`LengthRule`]
//! - [`Pool`] - free addresses
//! - [`Bindings`] - addresses offered or leased to clients
//! - [`ServerContext`] - per-datagram protocol handling
//! - [`DhcpServer`] - the context bound to UDP port 67

pub mod config;
pub mod error;
pub mod hooks;
pub mod lease;
pub mod options;
pub mod packet;
pub mod pool;
pub mod server;
pub mod transmit;

pub use config::{ConfigFile, ServerConfig};
pub use error::{Error, Result};
pub use hooks::{ClusterHooks, NoopHooks};
pub use lease::{Binding, BindingState, Bindings, DhcpLease};
pub use options::{DhcpOption, LengthRule, MessageType, OptionWriter};
pub use packet::{DhcpMessage, iterate_options};
pub use pool::{Pool, PoolEntry};
pub use server::{DhcpServer, Disposition, ServerContext};
pub use transmit::Transport;
