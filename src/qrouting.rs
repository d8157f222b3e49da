/// Q-Routing Messenger Module
///
/// Direct per-peer stream protocol whose target selection and feedback loop
/// both run through the QTable: outbound sends go to the best-scored
/// candidate and report wall-clock latency and success back into the table;
/// inbound messages credit the sender. Failures produce a negative update
/// and are surfaced to the caller without automatic retry.
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::qtable::QTable;

/// Hard cap on direct message payloads (1 MiB)
pub const MAX_DIRECT_SIZE: usize = 1024 * 1024;

/// Write one direct message and half-close.
pub async fn write_direct<S>(mut stream: S, bytes: &[u8]) -> MeshResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    if bytes.len() > MAX_DIRECT_SIZE {
        return Err(MeshError::BadRequest(format!(
            "direct message of {} bytes exceeds {} byte cap",
            bytes.len(),
            MAX_DIRECT_SIZE
        )));
    }
    stream
        .write_all(bytes)
        .await
        .map_err(|e| MeshError::Transport(format!("direct write: {}", e)))?;
    stream
        .close()
        .await
        .map_err(|e| MeshError::Transport(format!("direct close: {}", e)))?;
    Ok(())
}

/// Read one direct message, bounded by the payload cap.
pub async fn read_direct<S>(mut stream: S) -> MeshResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| MeshError::Transport(format!("direct read: {}", e)))?;
        if n == 0 {
            return Ok(bytes);
        }
        if bytes.len() + n > MAX_DIRECT_SIZE {
            return Err(MeshError::Transport(format!(
                "direct message exceeds {} byte cap",
                MAX_DIRECT_SIZE
            )));
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
}

/// Direct messenger that learns which peers are worth talking to.
pub struct QRoutingMessenger {
    control: libp2p_stream::Control,
    protocol: StreamProtocol,
    qtable: Arc<QTable>,
}

impl QRoutingMessenger {
    pub fn new(
        control: libp2p_stream::Control,
        protocol: StreamProtocol,
        qtable: Arc<QTable>,
    ) -> Self {
        Self {
            control,
            protocol,
            qtable,
        }
    }

    /// Send bytes to the best-scored candidate, feeding the observed
    /// outcome back into the QTable. Returns the peer that was selected.
    pub async fn send_direct(&self, candidates: &[PeerId], bytes: &[u8]) -> MeshResult<PeerId> {
        let target = self
            .qtable
            .select_best_peer(candidates)
            .await
            .ok_or_else(|| MeshError::BadRequest("no candidates to send to".to_string()))?;

        let started = Instant::now();
        let result = self.send_to(target, bytes).await;
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                self.qtable
                    .update_route(&target, latency, true, bytes.len() as u64)
                    .await;
                Ok(target)
            }
            Err(e) => {
                self.qtable.update_route(&target, latency, false, 0).await;
                Err(e)
            }
        }
    }

    async fn send_to(&self, target: PeerId, bytes: &[u8]) -> MeshResult<()> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(target, self.protocol.clone())
            .await
            .map_err(|e| MeshError::Transport(format!("open stream to {}: {}", target, e)))?;
        write_direct(stream, bytes).await
    }

    /// Accept inbound direct messages, crediting senders in the QTable and
    /// forwarding payloads to `delivery`.
    pub fn spawn_inbound(
        &self,
        delivery: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    ) -> MeshResult<JoinHandle<()>> {
        let mut control = self.control.clone();
        let mut incoming = control
            .accept(self.protocol.clone())
            .map_err(|e| MeshError::Network(format!("qrouting handler: {}", e)))?;
        let qtable = Arc::clone(&self.qtable);

        Ok(tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let qtable = Arc::clone(&qtable);
                let delivery = delivery.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    match read_direct(stream).await {
                        Ok(bytes) => {
                            qtable
                                .update_route(&peer, started.elapsed(), true, bytes.len() as u64)
                                .await;
                            if delivery.send((peer, bytes)).is_err() {
                                debug!("qrouting consumer gone; dropping message");
                            }
                        }
                        Err(e) => {
                            warn!("inbound qrouting message from {} failed: {}", peer, e);
                            qtable.update_route(&peer, started.elapsed(), false, 0).await;
                        }
                    }
                });
            }
            debug!("qrouting accept loop ended");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    #[tokio::test]
    async fn test_direct_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let reader = tokio::spawn(async move { read_direct(server_io.compat()).await });
        write_direct(client_io.compat(), b"route this").await.unwrap();

        let received = reader.await.unwrap().unwrap();
        assert_eq!(received, b"route this");
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_payload() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let oversized = vec![0u8; MAX_DIRECT_SIZE + 1];
        let err = write_direct(client_io.compat(), &oversized).await.unwrap_err();
        assert!(matches!(err, MeshError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_read_caps_at_one_megabyte() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let reader = tokio::spawn(async move { read_direct(server_io.compat()).await });

        // Stream more than the cap from a misbehaving sender.
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt as _;
            let mut client_io = client_io;
            let chunk = vec![0u8; 64 * 1024];
            for _ in 0..17 {
                if client_io.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let result = reader.await.unwrap();
        assert!(matches!(result.unwrap_err(), MeshError::Transport(_)));
        let _ = writer.await;
    }
}
