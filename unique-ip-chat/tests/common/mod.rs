#![allow(dead_code)]

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use anyhow::{Result, anyhow};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use unique_ip_chat::{Client, ClientConfig, ClientEvent, Server, ServerConfig, ServerEvent};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub fn loopback(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
}

pub async fn start_server(
    config: ServerConfig,
) -> Result<(Server, UnboundedReceiver<ServerEvent>, SocketAddr)> {
    let (server, mut events) = Server::new(config);
    let addr = server.start("127.0.0.1", 0).await?;
    assert_eq!(next_event(&mut events).await?, ServerEvent::Started { addr });
    Ok((server, events, addr))
}

/// Connects from `local` and waits until the server has admitted it.
pub async fn connect_client(
    server: SocketAddr,
    local: &str,
    server_events: &mut UnboundedReceiver<ServerEvent>,
) -> Result<(Client, UnboundedReceiver<ClientEvent>)> {
    let (client, events) = Client::new(local, ClientConfig::default())?;
    client.connect("127.0.0.1", server.port()).await?;
    let admitted = ServerEvent::NewConnection {
        addr: local.parse()?,
    };
    wait_for(server_events, |event| *event == admitted).await?;
    Ok((client, events))
}

pub async fn next_event<E>(rx: &mut UnboundedReceiver<E>) -> Result<E> {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for event"))?
        .ok_or_else(|| anyhow!("event channel closed"))
}

/// Skips events until one matches `predicate`.
pub async fn wait_for<E, F>(rx: &mut UnboundedReceiver<E>, predicate: F) -> Result<E>
where
    F: Fn(&E) -> bool,
{
    loop {
        let event = next_event(rx).await?;
        if predicate(&event) {
            return Ok(event);
        }
    }
}

/// Everything emitted during the quiet period.
pub async fn drain_for<E>(rx: &mut UnboundedReceiver<E>, period: Duration) -> Vec<E> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + period;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events
}
