//! Multi-party TCP chat with one connection per source address.
//!
//! The server admits at most one live connection per remote IP, relays every
//! chunk a client sends to all other clients as `[<ip>]: <text>`, and answers
//! a duplicate connection with a single `!REJECT:<reason>` frame before
//! closing it. The client binds a chosen local address, connects, and reports
//! whatever the server sends. Each module has one job:
//!
//! - [`registry`] keeps the admitted addresses and live connections together
//!   behind one lock.
//! - [`broadcast`] fans a payload out to every connection except the sender.
//! - [`server`] runs the accept loop and one handler task per connection.
//! - [`client`] owns a single outbound session and its receive task.
//! - [`wire`] holds the rejection frame and relay-line formatting.
//! - [`event`] defines the notifications both sides emit.
//! - [`error`] and [`config`] carry the error taxonomy and tunables.
//! - [`cli`] parses the terminal front-end used by `main.rs`.
//!
//! Traffic other than the rejection frame is an unframed byte stream: reads
//! are relayed as the transport delivers them.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod server;
pub mod wire;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::ChatError;
pub use event::{ClientEvent, ServerEvent};
pub use server::Server;
