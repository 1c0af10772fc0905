use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::{
    registry::{Connection, ConnectionId, SharedRegistry},
    wire::write_payload,
};

/// Best-effort fan-out over every registered connection.
///
/// The registry lock is held for the whole pass, so broadcasts never
/// interleave with each other or with admission and eviction.
pub struct Broadcaster<W> {
    registry: SharedRegistry<W>,
    write_timeout: Duration,
}

impl<W> Clone for Broadcaster<W> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            write_timeout: self.write_timeout,
        }
    }
}

impl<W> Broadcaster<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(registry: SharedRegistry<W>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Writes `payload` to every connection except `exclude`. Connections
    /// whose write fails are marked closed and left for their own handler to
    /// evict. Returns how many connections accepted the payload.
    pub async fn fan_out(&self, payload: &[u8], exclude: Option<ConnectionId>) -> usize {
        let mut registry = self.registry.lock().await;
        let mut delivered = 0;

        for connection in registry.connections_mut() {
            if Some(connection.id()) == exclude || connection.is_closed() {
                continue;
            }

            let peer = connection.peer();
            match timeout(
                self.write_timeout,
                write_payload(connection.writer_mut(), payload),
            )
            .await
            {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    debug!(peer = %peer, error = ?err, "failed to deliver broadcast");
                    self.abandon(connection).await;
                }
                Err(_) => {
                    debug!(peer = %peer, "broadcast write timed out");
                    self.abandon(connection).await;
                }
            }
        }

        delivered
    }

    /// Marks the connection closed and shuts its write side. A cancelled write
    /// may have left a partial payload on the wire; the peer sees EOF, hangs
    /// up, and its handler evicts the entry.
    async fn abandon(&self, connection: &mut Connection<W>) {
        connection.mark_closed();
        let peer = connection.peer();
        match timeout(self.write_timeout, connection.writer_mut().shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(peer = %peer, error = ?err, "failed to shut down stalled peer"),
            Err(_) => debug!(peer = %peer, "shutting down stalled peer timed out"),
        }
    }
}
