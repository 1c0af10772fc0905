use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, mpsc, watch},
    task::{JoinError, JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Broadcaster,
    config::ServerConfig,
    error::{ChatError, parse_ip},
    event::{EventSink, ServerEvent},
    registry::{AdmitError, ConnectionId, Registry, Rejected, SharedRegistry},
    wire::{operator_line, relay_line, write_rejection},
};

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ServerRegistry = SharedRegistry<OwnedWriteHalf>;

/// Chat server handle. Commands are async methods; everything that happens
/// afterwards is reported on the event channel returned by [`Server::new`].
pub struct Server {
    config: ServerConfig,
    events: EventSink<ServerEvent>,
    lifecycle: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    registry: ServerRegistry,
    broadcaster: Broadcaster<OwnedWriteHalf>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    announced_running: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, rx) = EventSink::channel();
        let server = Self {
            config,
            events,
            lifecycle: Mutex::new(None),
        };
        (server, rx)
    }

    /// Binds `bind_address:port` and starts accepting. Calling it again while
    /// running returns the current address without opening a second listener.
    pub async fn start(&self, bind_address: &str, port: u16) -> Result<SocketAddr, ChatError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_mut() {
            if !running.announced_running {
                running.announced_running = true;
                self.events.emit(ServerEvent::AlreadyRunning {
                    addr: running.local_addr,
                });
            }
            return Ok(running.local_addr);
        }

        let requested = SocketAddr::new(parse_ip(bind_address)?, port);
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| ChatError::Bind {
                addr: requested,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry = Registry::shared();
        let broadcaster = Broadcaster::new(Arc::clone(&registry), self.config.write_timeout);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_loop = AcceptLoop {
            listener,
            shutdown: shutdown_rx,
            ctx: ConnectionContext {
                registry: Arc::clone(&registry),
                broadcaster: broadcaster.clone(),
                events: self.events.clone(),
                config: self.config.clone(),
            },
            next_id: 1,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        info!(%local_addr, "server listening");
        self.events.emit(ServerEvent::Started { addr: local_addr });
        *lifecycle = Some(Running {
            local_addr,
            registry,
            broadcaster,
            shutdown,
            accept_task,
            announced_running: false,
        });

        Ok(local_addr)
    }

    /// Sends an operator message to every connected client.
    pub async fn send_message(&self, text: &str) {
        if text.is_empty() {
            return;
        }

        self.events.emit(ServerEvent::OperatorEcho(text.to_string()));

        let broadcaster = self
            .lifecycle
            .lock()
            .await
            .as_ref()
            .map(|running| running.broadcaster.clone());
        if let Some(broadcaster) = broadcaster {
            let delivered = broadcaster
                .fan_out(operator_line(text).as_bytes(), None)
                .await;
            debug!(delivered, "operator message broadcast");
        }
    }

    /// Stops accepting, closes every connection and waits for the workers to
    /// finish. Does nothing when the server is not running.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };
        let Running {
            local_addr,
            registry,
            shutdown,
            accept_task,
            ..
        } = running;

        // Closing the registry first refuses late admissions and makes this
        // the only place the remaining connections are torn down and reported.
        let drained = registry.lock().await.close();
        let closed = drained.len();
        for connection in drained {
            let addr = connection.addr();
            close_writer(connection.into_writer()).await;
            self.events.emit(ServerEvent::Disconnected { addr });
        }

        shutdown.send_replace(true);

        if let Err(err) = accept_task.await {
            warn!(error = ?err, "accept task ended abnormally");
        }

        info!(%local_addr, closed, "server stopped");
        self.events.emit(ServerEvent::Stopped { closed });
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    /// Source addresses currently holding a connection, in ascending order.
    pub async fn admitted_addresses(&self) -> Vec<IpAddr> {
        match self.registry().await {
            Some(registry) => registry.lock().await.admitted(),
            None => Vec::new(),
        }
    }

    pub async fn connection_count(&self) -> usize {
        match self.registry().await {
            Some(registry) => registry.lock().await.len(),
            None => 0,
        }
    }

    async fn registry(&self) -> Option<ServerRegistry> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.registry))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Aborting the accept task drops its JoinSet, which aborts every handler.
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.accept_task.abort();
        }
    }
}

/// Everything a connection handler needs, cloned once per connection.
#[derive(Clone)]
struct ConnectionContext {
    registry: ServerRegistry,
    broadcaster: Broadcaster<OwnedWriteHalf>,
    events: EventSink<ServerEvent>,
    config: ServerConfig,
}

struct AcceptLoop {
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
    ctx: ConnectionContext,
    next_id: ConnectionId,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut handlers = JoinSet::new();

        loop {
            select! {
                _ = shutdown_requested(&mut self.shutdown) => break,
                accept_result = self.listener.accept() => match accept_result {
                    Ok((stream, peer)) => self.handle_accept(stream, peer, &mut handlers).await,
                    Err(err) => {
                        warn!(error = ?err, "failed to accept connection");
                        self.ctx.events.emit(ServerEvent::AcceptFailed {
                            error: err.to_string(),
                        });
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    reap_handler(finished);
                }
            }
        }

        drop(self.listener);
        while let Some(finished) = handlers.join_next().await {
            reap_handler(finished);
        }
        debug!("accept loop finished");
    }

    async fn handle_accept(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        handlers: &mut JoinSet<()>,
    ) {
        let id = self.next_id;
        self.next_id += 1;

        let (reader, writer) = stream.into_split();
        let admission = self.ctx.registry.lock().await.admit(id, peer, writer);

        match admission {
            Ok(()) => {
                info!(peer = %peer, id, "connection admitted");
                self.ctx
                    .events
                    .emit(ServerEvent::NewConnection { addr: peer.ip() });
                handlers.spawn(handle_connection(
                    id,
                    peer,
                    reader,
                    self.ctx.clone(),
                    self.shutdown.clone(),
                ));
            }
            Err(Rejected {
                error: AdmitError::Closed,
                ..
            }) => {
                debug!(peer = %peer, "dropping connection accepted during shutdown");
            }
            Err(Rejected { error, mut writer }) => {
                let reason = error.reason();
                match timeout(
                    self.ctx.config.write_timeout,
                    write_rejection(&mut writer, &reason),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => debug!(peer = %peer, error = ?err, "failed to send rejection"),
                    Err(_) => debug!(peer = %peer, "rejection write timed out"),
                }
                drop(reader);

                info!(peer = %peer, %reason, "connection rejected");
                self.ctx.events.emit(ServerEvent::Rejected {
                    addr: peer.ip(),
                    reason,
                });
            }
        }
    }
}

/// Resolves once `stop` raises the flag or the server handle is dropped.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

fn reap_handler(finished: Result<(), JoinError>) {
    if let Err(err) = finished {
        if err.is_panic() {
            warn!(error = ?err, "connection handler panicked");
        }
    }
}

async fn handle_connection(
    id: ConnectionId,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    ctx: ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = peer.ip();
    let idle_timeout = ctx.config.idle_timeout;
    let mut buf = vec![0u8; ctx.config.read_buffer_size];

    loop {
        let read = select! {
            _ = shutdown_requested(&mut shutdown) => break,
            read = timeout(idle_timeout, reader.read(&mut buf)) => read,
        };

        match read {
            Ok(Ok(0)) => {
                debug!(peer = %peer, "peer closed the connection");
                break;
            }
            Ok(Ok(n)) => relay_chat(&ctx, id, addr, &buf[..n]).await,
            Ok(Err(err)) => {
                warn!(peer = %peer, error = ?err, "connection read failed");
                ctx.events.emit(ServerEvent::ConnectionError {
                    addr,
                    error: err.to_string(),
                });
                break;
            }
            Err(_) => {
                info!(peer = %peer, ?idle_timeout, "dropping idle connection");
                ctx.events.emit(ServerEvent::ConnectionError {
                    addr,
                    error: format!("no data received for {idle_timeout:?}"),
                });
                break;
            }
        }
    }

    cleanup_connection(&ctx, id, peer).await;
}

async fn relay_chat(ctx: &ConnectionContext, id: ConnectionId, addr: IpAddr, payload: &[u8]) {
    let line = relay_line(addr, payload);
    ctx.events.emit(ServerEvent::Chat(line.clone()));
    let delivered = ctx.broadcaster.fan_out(line.as_bytes(), Some(id)).await;
    debug!(peer = %addr, delivered, "relayed chat");
}

/// Evicts the connection if it is still registered. After `stop` has drained
/// the registry the disconnect has already been reported there.
async fn cleanup_connection(ctx: &ConnectionContext, id: ConnectionId, peer: SocketAddr) {
    let evicted = ctx.registry.lock().await.evict(id);
    if let Some(connection) = evicted {
        close_writer(connection.into_writer()).await;
        info!(peer = %peer, "client disconnected");
        ctx.events
            .emit(ServerEvent::Disconnected { addr: peer.ip() });
    }
}

async fn close_writer(mut writer: OwnedWriteHalf) {
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down connection");
    }
}
