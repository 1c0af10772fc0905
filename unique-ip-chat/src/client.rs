use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    task::{AbortHandle, JoinHandle},
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::{ChatError, parse_ip},
    event::{ClientEvent, EventSink},
    wire::{REJECT_PREFIX, decode_text, may_be_rejection, parse_rejection, write_payload},
};

/// Delay between peeks while only part of the rejection marker has arrived.
const PARTIAL_MARKER_POLL: Duration = Duration::from_millis(5);

/// A chat client bound to one local address. It runs at most one session at
/// a time and can reconnect after a disconnect.
pub struct Client {
    inner: Arc<ClientInner>,
    /// Abort handle of the latest receive task. Kept outside the state lock
    /// so `Drop` never has to wait for it.
    receiver: std::sync::Mutex<Option<AbortHandle>>,
}

struct ClientInner {
    local_address: IpAddr,
    config: ClientConfig,
    events: EventSink<ClientEvent>,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    next_session: u64,
}

struct Session {
    id: u64,
    server: SocketAddr,
    writer: OwnedWriteHalf,
    receiver: JoinHandle<()>,
}

impl Client {
    /// Validates `local_address`; nothing touches the network until
    /// [`Client::connect`].
    pub fn new(
        local_address: &str,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ChatError> {
        let local_address = parse_ip(local_address)?;
        let (events, rx) = EventSink::channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                local_address,
                config,
                events,
                state: Mutex::new(ClientState::default()),
            }),
            receiver: std::sync::Mutex::new(None),
        };
        Ok((client, rx))
    }

    pub fn local_address(&self) -> IpAddr {
        self.inner.local_address
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.session.is_some()
    }

    /// Connects to `server_address:port` from the configured local address.
    /// Already being connected is not an error.
    pub async fn connect(&self, server_address: &str, port: u16) -> Result<(), ChatError> {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state.session.as_ref() {
            debug!(server = %session.server, "already connected");
            return Ok(());
        }

        let server = SocketAddr::new(parse_ip(server_address)?, port);
        let mut stream = self.inner.open_stream(server).await?;
        check_rejection(&mut stream, self.inner.config.rejection_grace).await?;

        let (reader, writer) = stream.into_split();
        state.next_session += 1;
        let id = state.next_session;
        let receiver = tokio::spawn(receive_loop(Arc::clone(&self.inner), id, reader));
        *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(receiver.abort_handle());
        state.session = Some(Session {
            id,
            server,
            writer,
            receiver,
        });

        info!(local = %self.inner.local_address, %server, "connected");
        Ok(())
    }

    /// Writes `text` as-is. Empty text or a missing session makes this a
    /// no-op; a failed write is reported as an event and ends the session.
    pub async fn send_message(&self, text: &str) {
        let mut state = self.inner.state.lock().await;
        if text.is_empty() {
            return;
        }
        let Some(session) = state.session.as_mut() else {
            debug!("not connected, dropping outgoing message");
            return;
        };

        let error = match timeout(
            self.inner.config.write_timeout,
            write_payload(&mut session.writer, text.as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("write timed out after {:?}", self.inner.config.write_timeout),
        };

        warn!(%error, "failed to send message");
        self.inner
            .events
            .emit(ClientEvent::Error(format!("send failed: {error}")));
        let session = state.session.take();
        drop(state);
        if let Some(session) = session {
            self.inner.finish(session).await;
        }
    }

    /// Ends the current session, if any. Safe to call repeatedly and
    /// concurrently.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The receive task holds the only other reference to the inner state;
        // once it is gone the session's socket halves are dropped with it.
        let receiver = self.receiver.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = receiver.take() {
            handle.abort();
        }
    }
}

impl ClientInner {
    async fn open_stream(&self, server: SocketAddr) -> Result<TcpStream, ChatError> {
        let local = SocketAddr::new(self.local_address, 0);
        if local.is_ipv4() != server.is_ipv4() {
            return Err(ChatError::AddressFamilyMismatch {
                local: self.local_address,
                server: server.ip(),
            });
        }

        let socket = if local.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket
            .bind(local)
            .map_err(|source| ChatError::Bind { addr: local, source })?;

        let connect_timeout = self.config.connect_timeout;
        match timeout(connect_timeout, socket.connect(server)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ChatError::Connect {
                addr: server,
                source,
            }),
            Err(_) => Err(ChatError::ConnectTimeout {
                addr: server,
                timeout: connect_timeout,
            }),
        }
    }

    async fn disconnect(&self) {
        let session = self.state.lock().await.session.take();
        if let Some(session) = session {
            self.finish(session).await;
        }
    }

    /// Called by the receive task when its loop ends. Only tears down the
    /// session it belongs to; a newer session is left alone.
    async fn release(&self, id: u64) {
        let session = {
            let mut state = self.state.lock().await;
            if state.session.as_ref().is_some_and(|session| session.id == id) {
                state.session.take()
            } else {
                None
            }
        };

        if let Some(Session {
            server, mut writer, ..
        }) = session
        {
            self.events.emit(ClientEvent::Disconnected);
            if let Err(err) = writer.shutdown().await {
                debug!(error = ?err, "failed to shut down writer");
            }
            info!(%server, "connection closed by server");
        }
    }

    /// Tears down a session already taken out of the state. The disconnect
    /// event goes out before any await, so it is delivered even when the
    /// caller is the receive task being aborted here.
    async fn finish(&self, session: Session) {
        let Session {
            server,
            mut writer,
            receiver,
            ..
        } = session;

        receiver.abort();
        self.events.emit(ClientEvent::Disconnected);

        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down writer");
        }
        drop(writer);

        if timeout(self.config.join_timeout, receiver).await.is_err() {
            warn!(
                join_timeout = ?self.config.join_timeout,
                "receive task did not stop in time"
            );
        }
        info!(%server, "disconnected");
    }
}

async fn receive_loop(inner: Arc<ClientInner>, id: u64, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; inner.config.read_buffer_size];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("server closed the connection");
                break;
            }
            Ok(n) => inner
                .events
                .emit(ClientEvent::Received(decode_text(&buf[..n]).into_owned())),
            Err(err) => {
                warn!(error = ?err, "connection read failed");
                inner
                    .events
                    .emit(ClientEvent::Error(format!("connection error: {err}")));
                break;
            }
        }
    }

    drop(reader);
    inner.release(id).await;
}

/// Waits up to `grace` for the server to speak first. A rejection frame is
/// consumed and turned into an error; anything else stays unread for the
/// receive loop.
async fn check_rejection(stream: &mut TcpStream, grace: Duration) -> Result<(), ChatError> {
    let deadline = Instant::now() + grace;
    let mut marker = [0u8; REJECT_PREFIX.len()];

    loop {
        let peeked = match timeout_at(deadline, stream.peek(&mut marker)).await {
            Err(_) => return Ok(()),
            Ok(Ok(0)) => {
                return Err(ChatError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection during connect",
                )));
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err.into()),
        };

        if !may_be_rejection(&marker[..peeked]) {
            return Ok(());
        }
        if peeked == REJECT_PREFIX.len() {
            break;
        }
        if Instant::now() + PARTIAL_MARKER_POLL >= deadline {
            return Ok(());
        }
        tokio::time::sleep(PARTIAL_MARKER_POLL).await;
    }

    // The server closes right after the frame, so read until EOF.
    let deadline = Instant::now() + grace;
    let mut frame = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        match timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
            Ok(Err(err)) => {
                debug!(error = ?err, "connection reset after rejection frame");
                break;
            }
        }
    }

    let reason = parse_rejection(&frame).unwrap_or_else(|| "rejected without a reason".to_string());
    info!(%reason, "server rejected the connection");
    Err(ChatError::RejectedByServer { reason })
}
