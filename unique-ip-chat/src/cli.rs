use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server; stdin lines are sent to every client.
    Server(ServerArgs),
    /// Connect to a server from a chosen local address.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// IP address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Drop a client after this many seconds without data.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Local IP address the client binds before connecting.
    #[arg(long, default_value = "127.0.0.2")]
    pub local: String,

    /// IP address of the server.
    #[arg(long, default_value = "127.0.0.1")]
    pub server: String,

    /// Port of the server.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Give up connecting after this many milliseconds.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    pub connect_timeout_ms: u64,
}

impl ClientArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..ClientConfig::default()
        }
    }
}
