use std::{
    io,
    net::{AddrParseError, IpAddr, SocketAddr},
    time::Duration,
};

use thiserror::Error;

/// Failures surfaced synchronously by server and client commands.
///
/// Per-connection failures never travel through this type; they are reported
/// as events on the owning component's notification channel.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid IP address '{input}': {source}")]
    AddressFormat {
        input: String,
        #[source]
        source: AddrParseError,
    },

    #[error("cannot reach {server} from {local}: address families differ")]
    AddressFamilyMismatch { local: IpAddr, server: IpAddr },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("rejected by server: {reason}")]
    RejectedByServer { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChatError {
    pub(crate) fn address_format(input: &str, source: AddrParseError) -> Self {
        Self::AddressFormat {
            input: input.to_string(),
            source,
        }
    }
}

/// Parses a literal IP address, trimming surrounding whitespace.
pub(crate) fn parse_ip(input: &str) -> Result<IpAddr, ChatError> {
    input
        .trim()
        .parse()
        .map_err(|err| ChatError::address_format(input, err))
}
