use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpd::{ConfigFile, DhcpServer, Result, ServerConfig};

#[derive(Parser)]
#[command(name = "dhcpd")]
#[command(author, version, about = "A single-socket DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings that take precedence over the config file.
#[derive(Args)]
struct Overrides {
    /// Router address; repeat for several.
    #[arg(long = "router", global = true)]
    routers: Vec<String>,

    /// Nameserver address; repeat for several.
    #[arg(long = "nameserver", global = true)]
    nameservers: Vec<String>,

    /// Inclusive address range.
    #[arg(long, num_args = 2, value_names = ["LOW", "HIGH"], global = true)]
    range: Option<Vec<String>>,

    /// Lease duration in seconds.
    #[arg(long, global = true)]
    lease_time: Option<u32>,

    #[arg(long, global = true)]
    prefix_len: Option<u8>,

    /// Address of this server, sent as the server identifier.
    #[arg(long, global = true)]
    server_ip: Option<Ipv4Addr>,

    /// Network interface to bind to (Linux only).
    #[arg(long, global = true)]
    interface: Option<String>,
}

impl Overrides {
    fn apply(self, file: &mut ConfigFile) {
        if !self.routers.is_empty() {
            file.routers = self.routers;
        }
        if !self.nameservers.is_empty() {
            file.nameservers = self.nameservers;
        }
        if let Some(range) = self.range
            && let [low, high] = range.as_slice()
        {
            file.range_low = low.clone();
            file.range_high = high.clone();
        }
        if let Some(lease_time) = self.lease_time {
            file.lease_time = lease_time;
        }
        if let Some(prefix_len) = self.prefix_len {
            file.prefix_len = prefix_len;
        }
        if let Some(server_ip) = self.server_ip {
            file.server_ip = server_ip.to_string();
        }
        if self.interface.is_some() {
            file.interface = self.interface;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut file = ConfigFile::load_or_create(&cli.config)?;
    cli.overrides.apply(&mut file);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = ServerConfig::try_from(&file)?;
            info!("Starting DHCP server with config: {:?}", cli.config);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            runtime.block_on(async {
                let mut server = DhcpServer::new(config)?;

                tokio::select! {
                    result = server.run() => result,
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, stopping server...");
                        Ok(())
                    }
                }
            })
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&file)?);
            Ok(())
        }
        Commands::CheckConfig => {
            let config = ServerConfig::try_from(&file)?;
            println!(
                "Configuration OK: {} addresses from {} to {}, pool capacity {}",
                config.range_size(),
                Ipv4Addr::from(config.range_low),
                Ipv4Addr::from(config.range_high),
                config.pool_capacity
            );
            Ok(())
        }
    }
}
