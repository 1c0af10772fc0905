use std::{borrow::Cow, io, net::IpAddr};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Marker that opens the only control message on the wire.
pub const REJECT_PREFIX: &[u8] = b"!REJECT:";

/// Builds the rejection frame: the marker followed by the reason, no terminator.
pub fn rejection_frame(reason: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REJECT_PREFIX.len() + reason.len());
    frame.extend_from_slice(REJECT_PREFIX);
    frame.extend_from_slice(reason.as_bytes());
    frame
}

/// Returns the reason carried by a rejection frame, if `bytes` is one.
pub fn parse_rejection(bytes: &[u8]) -> Option<String> {
    bytes
        .strip_prefix(REJECT_PREFIX)
        .map(|reason| decode_text(reason).into_owned())
}

/// True while `bytes` could still turn out to be a rejection frame, i.e. it
/// either starts with the marker or is a truncated copy of it.
pub fn may_be_rejection(bytes: &[u8]) -> bool {
    if bytes.len() >= REJECT_PREFIX.len() {
        bytes.starts_with(REJECT_PREFIX)
    } else {
        REJECT_PREFIX.starts_with(bytes)
    }
}

/// Formats a chat chunk received from `addr` the way every listener sees it.
pub fn relay_line(addr: IpAddr, payload: &[u8]) -> String {
    format!("[{addr}]: {}", decode_text(payload))
}

/// Copy of an operator message as delivered to connected clients.
pub fn operator_line(text: &str) -> String {
    format!("Server: {text}")
}

/// Chat payloads are UTF-8 by convention; invalid sequences are replaced
/// rather than dropping the chunk.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

/// Writes one raw payload and flushes so the peer sees it promptly.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Sends a rejection frame and closes the write direction. Nothing else may
/// follow on a rejected socket.
pub async fn write_rejection<W>(writer: &mut W, reason: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_payload(writer, &rejection_frame(reason)).await?;
    writer.shutdown().await
}
