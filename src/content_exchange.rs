/// Content Exchange Module
///
/// Length-prefixed stream side channel for fetching blobs by content id.
/// The wire format is deliberately tiny:
///
/// - Request: up to 100 ASCII bytes carrying the content id, then the
///   client half-closes its write side.
/// - Response on hit: 4-byte big-endian payload size, then exactly that
///   many bytes.
/// - Response on miss: the server closes without writing; the client reads
///   a clean EOF and maps it to `not-found`.
///
/// Responses above 10 MiB are rejected outright. Failures are fatal for the
/// attempt, never for the peer.
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::StreamProtocol;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::content_id::{parse_cid, ContentId};
use crate::content_store::ContentStore;
use crate::error::{MeshError, MeshResult};
use crate::monitoring::MeshMetrics;

/// Maximum length of the requested identifier
const MAX_ID_LEN: usize = 100;
/// Hard ceiling on response payloads (10 MiB)
pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;

/// Serve one content-exchange request on an accepted stream.
///
/// Reads the requested id, answers from the local store, and closes. A miss
/// is signalled by closing without writing anything.
pub async fn serve_stream<S>(
    mut stream: S,
    store: &dyn ContentStore,
    metrics: &MeshMetrics,
) -> MeshResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut id_buf = [0u8; MAX_ID_LEN];
    let mut filled = 0;
    loop {
        let n = stream
            .read(&mut id_buf[filled..])
            .await
            .map_err(|e| MeshError::Transport(format!("request read: {}", e)))?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == MAX_ID_LEN {
            break;
        }
    }

    let id = std::str::from_utf8(&id_buf[..filled])
        .map_err(|_| MeshError::BadRequest("non-ASCII content id".to_string()))?
        .trim();
    let cid = parse_cid(id)?;

    match store.get(&cid).await? {
        Some(bytes) => {
            debug!("serving {} ({} bytes)", cid, bytes.len());
            let size = (bytes.len() as u32).to_be_bytes();
            stream
                .write_all(&size)
                .await
                .map_err(|e| MeshError::Transport(format!("response write: {}", e)))?;
            stream
                .write_all(&bytes)
                .await
                .map_err(|e| MeshError::Transport(format!("response write: {}", e)))?;
            stream
                .close()
                .await
                .map_err(|e| MeshError::Transport(format!("response close: {}", e)))?;
            MeshMetrics::incr(&metrics.fetches_served);
            MeshMetrics::add(&metrics.bytes_sent, bytes.len() as u64);
        }
        None => {
            debug!("miss for {}", cid);
            let _ = stream.close().await;
            MeshMetrics::incr(&metrics.fetch_misses_served);
        }
    }

    Ok(())
}

/// Fetch bytes for a content id over an open stream.
///
/// Returns `not-found` when the server closes without a size prefix and
/// rejects oversized or truncated responses. Verification and storing the
/// bytes are the caller's responsibility.
pub async fn fetch_content<S>(mut stream: S, cid: &ContentId) -> MeshResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let id = cid.to_string();
    if id.len() > MAX_ID_LEN {
        return Err(MeshError::BadRequest(format!(
            "content id longer than {} bytes",
            MAX_ID_LEN
        )));
    }

    stream
        .write_all(id.as_bytes())
        .await
        .map_err(|e| MeshError::Transport(format!("request write: {}", e)))?;
    stream
        .close()
        .await
        .map_err(|e| MeshError::Transport(format!("request close: {}", e)))?;

    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        let n = stream
            .read(&mut size_buf[filled..])
            .await
            .map_err(|e| MeshError::Transport(format!("size read: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                // Clean close without a size prefix: remote miss.
                return Err(MeshError::NotFound(format!("{} not held by peer", cid)));
            }
            return Err(MeshError::Transport("truncated size prefix".to_string()));
        }
        filled += n;
    }

    let size = u32::from_be_bytes(size_buf) as usize;
    if size > MAX_CONTENT_SIZE {
        return Err(MeshError::Transport(format!(
            "response of {} bytes exceeds {} byte ceiling",
            size, MAX_CONTENT_SIZE
        )));
    }

    let mut bytes = vec![0u8; size];
    stream
        .read_exact(&mut bytes)
        .await
        .map_err(|e| MeshError::Transport(format!("payload read: {}", e)))?;

    Ok(bytes)
}

/// Accept loop for inbound content-exchange streams.
///
/// Registered under the negotiated protocol id; each accepted stream is
/// served on its own task so a slow requester cannot stall the loop.
pub fn spawn_server(
    control: &mut libp2p_stream::Control,
    protocol: StreamProtocol,
    store: Arc<dyn ContentStore>,
    metrics: Arc<MeshMetrics>,
) -> MeshResult<JoinHandle<()>> {
    let mut incoming = control
        .accept(protocol.clone())
        .map_err(|e| MeshError::Network(format!("content-exchange handler: {}", e)))?;

    Ok(tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            let store = Arc::clone(&store);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                if let Err(e) = serve_stream(stream, store.as_ref(), &metrics).await {
                    warn!("content-exchange request from {} failed: {}", peer, e);
                }
            });
        }
        debug!("content-exchange accept loop ended");
    }))
}
