use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use wirebroker_core::config::BrokerConfig;
use wirebroker_core::{broker, logging};
use wirebroker_tunnel::keys;

/// Userspace network broker: terminates an encrypted tunnel and proxies the
/// client's connections into the local network.
#[derive(Parser, Debug)]
#[command(name = "wirebroker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a tunnel key pair
    Genkey,
    /// Listen and proxy traffic into the target network
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Configuration file to read from
    #[arg(short = 'f', long)]
    config_file: Option<PathBuf>,

    /// Silence log messages
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose log messages
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Disable the nested tunnel for a simpler single-hop setup
    #[arg(long)]
    simple: Option<bool>,

    /// Write the log to this file as well
    #[arg(short = 'o', long)]
    log_file: Option<String>,

    /// Time in ms for the client to complete its TCP handshake
    #[arg(long)]
    completion_timeout: Option<u64>,

    /// Time in ms to wait for outgoing TCP handshakes to complete
    #[arg(long)]
    conn_timeout: Option<u64>,

    /// Seconds before TCP keepalives are sent to the client
    #[arg(long)]
    keepalive_idle: Option<u64>,

    /// Seconds between TCP keepalives
    #[arg(long)]
    keepalive_interval: Option<u64>,

    /// Unacknowledged TCP keepalives before closing a connection
    #[arg(long)]
    keepalive_count: Option<u32>,

    /// Disable IPv6
    #[arg(long)]
    disable_ipv6: bool,
}

impl ServeArgs {
    fn into_config(self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::load(self.config_file.as_deref())?;

        if self.quiet {
            config.log.quiet = true;
        }
        if self.verbose {
            config.log.verbose = true;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(file);
        }
        if let Some(simple) = self.simple {
            config.simple = simple;
        }
        if self.disable_ipv6 {
            config.disable_ipv6 = true;
        }
        if let Some(ms) = self.completion_timeout {
            config.forward.catch_timeout_ms = ms;
        }
        if let Some(ms) = self.conn_timeout {
            config.forward.conn_timeout_ms = ms;
        }
        if let Some(secs) = self.keepalive_idle {
            config.forward.keepalive_idle_secs = secs;
        }
        if let Some(secs) = self.keepalive_interval {
            config.forward.keepalive_interval_secs = secs;
        }
        if let Some(count) = self.keepalive_count {
            config.forward.keepalive_count = count;
        }
        config.validate()?;
        Ok(config)
    }
}

fn genkey() {
    let (private, public) = keys::generate_keypair();
    println!("Private Key: {}", keys::encode_base64(&private));
    println!("Public Key: {}", keys::encode_base64(&public));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Genkey => {
            genkey();
            Ok(())
        }
        Command::Serve(args) => {
            let config = args.into_config()?;
            logging::init(&config.log)?;
            broker::run(config).await?;
            Ok(())
        }
    }
}
