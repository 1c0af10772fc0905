//! Notifications delivered to whoever drives a server or client.
//!
//! Each component owns one unbounded channel, so events from one source stay
//! in order. Every event renders as a single human-readable line.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started { addr: SocketAddr },
    AlreadyRunning { addr: SocketAddr },
    NewConnection { addr: IpAddr },
    Rejected { addr: IpAddr, reason: String },
    /// A chat chunk relayed from a client, already tagged with its address.
    Chat(String),
    /// Local echo of a message sent by the server operator.
    OperatorEcho(String),
    ConnectionError { addr: IpAddr, error: String },
    Disconnected { addr: IpAddr },
    AcceptFailed { error: String },
    Stopped { closed: usize },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { addr } => write!(f, "*** server started on {addr}"),
            Self::AlreadyRunning { addr } => write!(f, "*** server already running on {addr}"),
            Self::NewConnection { addr } => write!(f, "*** new connection: {addr}"),
            Self::Rejected { reason, .. } => write!(f, "*** rejected connection: {reason}"),
            Self::Chat(line) => f.write_str(line),
            Self::OperatorEcho(text) => write!(f, "Server (you): {text}"),
            Self::ConnectionError { addr, error } => write!(f, "!!! client {addr} error: {error}"),
            Self::Disconnected { addr } => write!(f, "*** disconnected: {addr}"),
            Self::AcceptFailed { error } => write!(f, "!!! failed to accept connection: {error}"),
            Self::Stopped { closed } => {
                write!(f, "*** server stopped, closed {closed} connection(s)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Bytes read from the server, passed through verbatim.
    Received(String),
    Error(String),
    Disconnected,
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received(text) => f.write_str(text),
            Self::Error(message) => write!(f, "!!! {message}"),
            Self::Disconnected => f.write_str("*** disconnected from server"),
        }
    }
}

/// Sending half of a notification channel. A dropped receiver is not an
/// error: the component keeps working without a listener.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: fmt::Debug> EventSink<E> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: E) {
        if let Err(err) = self.tx.send(event) {
            debug!(event = ?err.0, "event listener dropped");
        }
    }
}
