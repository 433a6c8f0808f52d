//! Inbound TCP listener.
//!
//! Accepted sockets are routed by the info hash in the remote handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::handshake::HandshakeCodec;
use super::manager::PeerConnectionManager;

/// Accepts inbound peers and hands them to the connection manager.
pub struct PeerListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerListener {
    /// Binds `addr` and starts accepting in a background task.
    ///
    /// # Errors
    ///
    /// - `io::Error` - The address could not be bound
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<PeerConnectionManager>,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for peers on {local_addr}");
        manager.add_local_address(local_addr);
        if local_addr.ip().is_unspecified() {
            manager.add_local_address(SocketAddr::from(([127, 0, 0, 1], local_addr.port())));
        }

        let task = tokio::spawn(async move {
            loop {
                let (mut stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let handshake =
                        match HandshakeCodec::read_handshake(&mut stream, handshake_timeout).await
                        {
                            Ok(handshake) => handshake,
                            Err(e) => {
                                tracing::debug!(peer = %remote, "Inbound handshake failed: {e}");
                                return;
                            }
                        };
                    if let Err(e) = manager.accept(stream, remote, handshake) {
                        tracing::debug!(peer = %remote, "Rejected inbound peer: {e}");
                    }
                });
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting; established connections are unaffected.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::config::{PeerConfig, ShaperConfig};
    use crate::peer::engine::EngineContext;
    use crate::peer::{ConnectionState, PeerHandshake, PeerId};
    use crate::shaper::SpeedShaper;
    use crate::torrent::{FakePieceStore, InfoHash, SessionCounters, TorrentMetadata};

    #[tokio::test]
    async fn test_inbound_peer_routed_to_registered_torrent() {
        let info_hash = InfoHash::new([0x42; 20]);
        let metadata = TorrentMetadata::new(info_hash, "in", 16384, 16384, Vec::new()).unwrap();
        let manager = Arc::new(PeerConnectionManager::new(
            PeerConfig::default(),
            Arc::new(Semaphore::new(1)),
        ));
        manager.register_torrent(
            EngineContext {
                info_hash,
                local_peer_id: PeerId::new([b'l'; 20]),
                piece_count: 1,
                pieces: Arc::new(FakePieceStore::new(&metadata, 0)),
                bitfield: Bytes::from_static(&[0x80]),
                counters: Arc::new(SessionCounters::default()),
                shaper: Arc::new(SpeedShaper::new(
                    ShaperConfig::default(),
                    Duration::from_millis(50),
                )),
                config: PeerConfig::default(),
                serve_interval: Duration::from_millis(50),
            },
            5,
        );

        let listener = PeerListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&manager),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let handshake = PeerHandshake::new(info_hash, PeerId::new([b'r'; 20]));
        client
            .write_all(&HandshakeCodec::serialize_handshake(&handshake))
            .await
            .unwrap();

        let reply = HandshakeCodec::read_handshake(&mut client, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.info_hash, info_hash);
        assert_eq!(manager.connection_count(&info_hash), 1);

        let snapshot = manager.snapshot(&info_hash);
        assert_ne!(snapshot[0].state, ConnectionState::Connecting);
        listener.shutdown();
    }
}
