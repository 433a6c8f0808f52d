//! Per-connection BitTorrent state machine.
//!
//! One engine task owns one socket. It performs the handshake, sends our
//! synthetic bitfield, answers requests with shaped fake piece data and
//! keeps the connection alive until it is told to close, times out or the
//! remote misbehaves. A separate reader task feeds decoded frames through a
//! channel so the main loop can select over frames, control commands and
//! the serve ticker without losing partially read messages.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::bitfield;
use super::handshake::HandshakeCodec;
use super::messages::{FrameLimits, MessageCodec};
use super::types::{
    ConnectionState, Direction, PeerHandshake, PeerId, PeerMessage, PeerProtocolError,
};
use crate::config::PeerConfig;
use crate::shaper::SpeedShaper;
use crate::torrent::{FakePieceStore, InfoHash, PieceIndex, SessionCounters};

/// Requests queued beyond this are treated as abuse.
const MAX_PENDING_REQUESTS: usize = 512;

/// Everything an engine needs to know about the torrent it serves.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub piece_count: u32,
    pub pieces: Arc<FakePieceStore>,
    /// Bitfield advertised to every peer of this torrent
    pub bitfield: Bytes,
    pub counters: Arc<SessionCounters>,
    pub shaper: Arc<SpeedShaper>,
    pub config: PeerConfig,
    /// How often queued requests are retried against the shaper
    pub serve_interval: Duration,
}

impl EngineContext {
    fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_message_length: self.config.max_message_length,
            message_read_timeout: self.config.message_read_timeout,
            data_read_timeout: self.config.data_read_timeout,
        }
    }
}

/// Control messages from the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    /// Advertise a piece, as a client that finished downloading it would
    SendHave(PieceIndex),
    /// Enter (true) or leave (false) the idle state
    SetIdle(bool),
    Close,
}

/// State shared between an engine task and the manager's ledger.
#[derive(Debug)]
pub struct ConnectionShared {
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    established_at: Mutex<Option<Instant>>,
    remote_peer_id: Mutex<Option<PeerId>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    remote_pieces: AtomicU32,
}

impl ConnectionShared {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            state: Mutex::new(initial),
            last_activity: Mutex::new(Instant::now()),
            established_at: Mutex::new(None),
            remote_peer_id: Mutex::new(None),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            remote_pieces: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// - `PeerProtocolError::InvalidTransition` - Move not permitted from current state
    pub fn transition(&self, next: ConnectionState) -> Result<(), PeerProtocolError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(PeerProtocolError::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        if next == ConnectionState::Established {
            self.established_at.lock().get_or_insert_with(Instant::now);
        }
        Ok(())
    }

    /// Ends the connection through Errored, or through Closing when
    /// `graceful`, landing in Closed either way.
    pub fn finish(&self, graceful: bool) {
        let mut state = self.state.lock();
        if state.is_live() {
            *state = if graceful {
                ConnectionState::Closing
            } else {
                ConnectionState::Errored
            };
        }
        *state = ConnectionState::Closed;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn established_at(&self) -> Option<Instant> {
        *self.established_at.lock()
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        *self.remote_peer_id.lock()
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Pieces the remote peer claims to have.
    pub fn remote_pieces(&self) -> u32 {
        self.remote_pieces.load(Ordering::Relaxed)
    }
}

/// Why a connection ended without a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Manager asked (rotation, cleanup, torrent removal)
    Requested,
    /// Lifetime limit reached
    DurationExceeded,
    /// Peer went silent past the read timeout
    ReadTimeout,
    /// Ended by an error; see [`ConnectionOutcome::error`]
    Error,
}

/// Final report of a finished connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOutcome {
    pub remote: SocketAddr,
    pub reason: CloseReason,
    pub error: Option<PeerProtocolError>,
    pub uploaded: u64,
    pub downloaded: u64,
}

#[derive(Debug)]
struct PendingRequest {
    piece: PieceIndex,
    offset: u32,
    length: u32,
    sent: u32,
}

/// Drives one peer connection from handshake to close.
pub struct PeerProtocolEngine<S> {
    stream: S,
    ctx: EngineContext,
    shared: Arc<ConnectionShared>,
    remote: SocketAddr,
    direction: Direction,
    commands: mpsc::Receiver<ConnectionCommand>,
}

impl<S> PeerProtocolEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates an engine for an already connected stream.
    ///
    /// Outbound connections are expected in `Connecting`, inbound ones in
    /// `Handshaking`.
    pub fn new(
        stream: S,
        ctx: EngineContext,
        shared: Arc<ConnectionShared>,
        remote: SocketAddr,
        direction: Direction,
        commands: mpsc::Receiver<ConnectionCommand>,
    ) -> Self {
        Self {
            stream,
            ctx,
            shared,
            remote,
            direction,
            commands,
        }
    }

    /// Runs the connection to completion.
    ///
    /// For inbound connections the listener may already have consumed the
    /// remote handshake to route the stream; it is passed in here.
    pub async fn run(self, remote_handshake: Option<PeerHandshake>) -> ConnectionOutcome {
        let shared = Arc::clone(&self.shared);
        let remote = self.remote;
        let info_hash = self.ctx.info_hash;

        let result = self.drive(remote_handshake).await;

        let (reason, error) = match result {
            Ok(reason) => (reason, None),
            Err(error @ PeerProtocolError::ReadTimeout { .. }) => {
                (CloseReason::ReadTimeout, Some(error))
            }
            Err(error) => (CloseReason::Error, Some(error)),
        };
        shared.finish(reason != CloseReason::Error);

        match &error {
            Some(error) => tracing::debug!(
                peer = %remote,
                info_hash = %info_hash,
                "Connection ended: {error}"
            ),
            None => tracing::debug!(
                peer = %remote,
                info_hash = %info_hash,
                ?reason,
                "Connection closed"
            ),
        }

        ConnectionOutcome {
            remote,
            reason,
            error,
            uploaded: shared.uploaded(),
            downloaded: shared.downloaded(),
        }
    }

    async fn drive(
        mut self,
        remote_handshake: Option<PeerHandshake>,
    ) -> Result<CloseReason, PeerProtocolError> {
        self.handshake(remote_handshake).await?;
        self.shared.transition(ConnectionState::BitfieldExchange)?;

        let limits = self.ctx.frame_limits();
        let (read_half, writer) = tokio::io::split(self.stream);
        let (frame_tx, frames) = mpsc::channel(32);
        let reader = tokio::spawn(read_frames(read_half, limits, frame_tx));

        let mut connection = Connection {
            writer,
            frames,
            commands: self.commands,
            ctx: self.ctx,
            shared: self.shared,
            pending: VecDeque::new(),
            am_choking: true,
            last_sent: Instant::now(),
        };

        let result = connection.serve().await;
        reader.abort();
        let _ = connection.writer.shutdown().await;
        result
    }

    async fn handshake(
        &mut self,
        remote_handshake: Option<PeerHandshake>,
    ) -> Result<(), PeerProtocolError> {
        let ours = HandshakeCodec::serialize_handshake(&PeerHandshake::new(
            self.ctx.info_hash,
            self.ctx.local_peer_id,
        ));
        let timeout = self.ctx.config.handshake_timeout;

        let theirs = match self.direction {
            Direction::Outbound => {
                self.shared.transition(ConnectionState::Handshaking)?;
                write_bytes(&mut self.stream, &ours).await?;
                HandshakeCodec::read_handshake(&mut self.stream, timeout).await?
            }
            Direction::Inbound => {
                let theirs = match remote_handshake {
                    Some(handshake) => handshake,
                    None => HandshakeCodec::read_handshake(&mut self.stream, timeout).await?,
                };
                if theirs.info_hash == self.ctx.info_hash {
                    write_bytes(&mut self.stream, &ours).await?;
                }
                theirs
            }
        };

        if theirs.info_hash != self.ctx.info_hash {
            return Err(PeerProtocolError::HandshakeMismatch {
                expected: self.ctx.info_hash,
                received: theirs.info_hash,
            });
        }

        *self.shared.remote_peer_id.lock() = Some(theirs.peer_id);
        self.shared.touch();
        Ok(())
    }
}

async fn write_bytes<W>(writer: &mut W, bytes: &[u8]) -> Result<(), PeerProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(bytes)
        .await
        .map_err(|e| PeerProtocolError::ConnectionReset {
            reason: format!("write failed: {e}"),
        })
}

async fn read_frames<R>(
    mut reader: ReadHalf<R>,
    limits: FrameLimits,
    frames: mpsc::Sender<Result<PeerMessage, PeerProtocolError>>,
) where
    R: AsyncRead,
{
    loop {
        let frame = MessageCodec::read_frame(&mut reader, &limits).await;
        let failed = frame.is_err();
        if frames.send(frame).await.is_err() || failed {
            break;
        }
    }
}

struct Connection<S> {
    writer: WriteHalf<S>,
    frames: mpsc::Receiver<Result<PeerMessage, PeerProtocolError>>,
    commands: mpsc::Receiver<ConnectionCommand>,
    ctx: EngineContext,
    shared: Arc<ConnectionShared>,
    pending: VecDeque<PendingRequest>,
    am_choking: bool,
    last_sent: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    async fn serve(&mut self) -> Result<CloseReason, PeerProtocolError> {
        if bitfield::count_pieces(&self.ctx.bitfield) > 0 {
            let bitfield = self.ctx.bitfield.clone();
            self.send(PeerMessage::Bitfield { bitfield }).await?;
        }

        // Give the remote a moment to send its own bitfield first
        let grace = tokio::time::sleep(self.ctx.config.bitfield_grace_period);
        let first = tokio::select! {
            frame = self.frames.recv() => Some(frame),
            _ = grace => None,
        };
        self.shared.transition(ConnectionState::Established)?;
        if let Some(frame) = first {
            self.on_frame(frame).await?;
        }

        let deadline = tokio::time::Instant::now() + self.ctx.config.connection_duration;
        let mut ticker = tokio::time::interval(self.ctx.serve_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.frames.recv() => self.on_frame(frame).await?,
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Close) | None => return Ok(CloseReason::Requested),
                    Some(ConnectionCommand::SendHave(piece_index)) => {
                        self.send(PeerMessage::Have { piece_index }).await?;
                    }
                    Some(ConnectionCommand::SetIdle(idle)) => self.set_idle(idle)?,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(CloseReason::DurationExceeded);
                }
                _ = ticker.tick() => {
                    self.serve_pending().await?;
                    if self.last_sent.elapsed() >= self.ctx.config.keep_alive_interval {
                        self.send(PeerMessage::KeepAlive).await?;
                    }
                }
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<PeerMessage, PeerProtocolError>>,
    ) -> Result<(), PeerProtocolError> {
        match frame {
            Some(Ok(message)) => {
                self.shared.touch();
                self.handle_message(message).await
            }
            Some(Err(error)) => Err(error),
            None => Err(PeerProtocolError::ConnectionReset {
                reason: "reader stopped".to_string(),
            }),
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<(), PeerProtocolError> {
        tracing::trace!(info_hash = %self.ctx.info_hash, kind = message.kind(), "Received message");

        match message {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::NotInterested => {}
            PeerMessage::Port { .. } => {}
            PeerMessage::Interested => {
                if self.am_choking && self.shared.state().is_established() {
                    self.am_choking = false;
                    self.send(PeerMessage::Unchoke).await?;
                }
            }
            PeerMessage::Have { piece_index } => {
                if piece_index.as_u32() >= self.ctx.piece_count {
                    return Err(PeerProtocolError::MalformedMessage {
                        reason: format!("have for piece {piece_index} beyond torrent"),
                    });
                }
                self.shared.remote_pieces.fetch_add(1, Ordering::Relaxed);
            }
            PeerMessage::Bitfield { bitfield } => self.on_bitfield(&bitfield)?,
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.on_request(piece_index, offset, length).await?,
            PeerMessage::Piece { data, .. } => {
                let bytes = data.len() as u64;
                self.shared.downloaded.fetch_add(bytes, Ordering::Relaxed);
                self.ctx.counters.record_downloaded(bytes);
                self.ctx.shaper.record_download(&self.ctx.info_hash, bytes);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => self.pending.retain(|r| {
                !(r.piece == piece_index && r.offset == offset && r.length == length)
            }),
        }
        Ok(())
    }

    fn on_bitfield(&mut self, bits: &[u8]) -> Result<(), PeerProtocolError> {
        let expected = (self.ctx.piece_count as usize).div_ceil(8);
        if bits.len() != expected {
            return Err(PeerProtocolError::MalformedMessage {
                reason: format!("bitfield is {} bytes, expected {expected}", bits.len()),
            });
        }
        let spare = expected * 8 - self.ctx.piece_count as usize;
        if spare > 0 && bits[expected - 1] & ((1u8 << spare) - 1) != 0 {
            return Err(PeerProtocolError::MalformedMessage {
                reason: "bitfield has spare bits set".to_string(),
            });
        }
        self.shared
            .remote_pieces
            .store(bitfield::count_pieces(bits), Ordering::Relaxed);
        Ok(())
    }

    async fn on_request(
        &mut self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), PeerProtocolError> {
        if length == 0 || length > self.ctx.config.max_request_length {
            return Err(PeerProtocolError::MalformedMessage {
                reason: format!("request length {length} out of range"),
            });
        }
        self.ctx
            .pieces
            .check_range(piece, offset, length)
            .map_err(|e| PeerProtocolError::MalformedMessage {
                reason: e.to_string(),
            })?;

        if self.am_choking {
            tracing::trace!(info_hash = %self.ctx.info_hash, "Ignoring request while choking");
            return Ok(());
        }
        if !bitfield::has_piece(&self.ctx.bitfield, piece.as_u32()) {
            tracing::trace!(info_hash = %self.ctx.info_hash, %piece, "Ignoring request for missing piece");
            return Ok(());
        }
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            return Err(PeerProtocolError::MalformedMessage {
                reason: "too many outstanding requests".to_string(),
            });
        }

        self.pending.push_back(PendingRequest {
            piece,
            offset,
            length,
            sent: 0,
        });
        self.serve_pending().await
    }

    /// Sends as much queued data as the shaper currently grants.
    async fn serve_pending(&mut self) -> Result<(), PeerProtocolError> {
        let chunk_limit = u64::from(self.ctx.config.fake_piece_data_size_kb) * 1024;

        while let Some(front) = self.pending.front_mut() {
            let remaining = u64::from(front.length - front.sent);
            let granted = self
                .ctx
                .shaper
                .request_upload(&self.ctx.info_hash, remaining.min(chunk_limit));
            if granted == 0 {
                break;
            }

            let granted = granted as u32;
            let piece_index = front.piece;
            let offset = front.offset + front.sent;
            front.sent += granted;
            if front.sent == front.length {
                self.pending.pop_front();
            }

            let data = self
                .ctx
                .pieces
                .read_block(piece_index, offset, granted)
                .map_err(|e| PeerProtocolError::MalformedMessage {
                    reason: e.to_string(),
                })?;
            self.send(PeerMessage::Piece {
                piece_index,
                offset,
                data,
            })
            .await?;

            self.shared
                .uploaded
                .fetch_add(u64::from(granted), Ordering::Relaxed);
            self.ctx.counters.record_uploaded(u64::from(granted));
        }
        Ok(())
    }

    /// Idle is a reporting state only; choking and serving are unaffected.
    fn set_idle(&mut self, idle: bool) -> Result<(), PeerProtocolError> {
        match (idle, self.shared.state()) {
            (true, ConnectionState::Established) => {
                self.shared.transition(ConnectionState::Idle)
            }
            (false, ConnectionState::Idle) => {
                self.shared.transition(ConnectionState::Established)
            }
            _ => Ok(()),
        }
    }

    async fn send(&mut self, message: PeerMessage) -> Result<(), PeerProtocolError> {
        let bytes = MessageCodec::serialize_message(&message);
        write_bytes(&mut self.writer, &bytes).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::config::ShaperConfig;
    use crate::random::SeededRandom;
    use crate::torrent::TorrentMetadata;

    const PIECE_LEN: u32 = 64 * 1024;

    fn context(upload_cap: u64, config: PeerConfig) -> EngineContext {
        let info_hash = InfoHash::new([0x11; 20]);
        let metadata =
            TorrentMetadata::new(info_hash, "engine", PIECE_LEN, 4 * PIECE_LEN as u64, Vec::new())
                .unwrap();
        let shaper = Arc::new(SpeedShaper::new(
            ShaperConfig::default(),
            Duration::from_millis(10),
        ));
        shaper.register_torrent(info_hash, upload_cap, 0);
        let mut rng = SeededRandom::from_seed(1);

        EngineContext {
            info_hash,
            local_peer_id: PeerId::generate("-SS0100-", &mut rng),
            piece_count: metadata.piece_count,
            pieces: Arc::new(FakePieceStore::new(&metadata, 7)),
            bitfield: bitfield::synthetic_bitfield(metadata.piece_count, 1.0, &mut rng),
            counters: Arc::new(SessionCounters::default()),
            shaper,
            config,
            serve_interval: Duration::from_millis(10),
        }
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            handshake_timeout: Duration::from_millis(500),
            bitfield_grace_period: Duration::from_millis(20),
            ..PeerConfig::default()
        }
    }

    fn remote() -> SocketAddr {
        "10.0.0.2:51413".parse().unwrap()
    }

    fn spawn_outbound(
        ctx: EngineContext,
    ) -> (
        DuplexStream,
        Arc<ConnectionShared>,
        mpsc::Sender<ConnectionCommand>,
        tokio::task::JoinHandle<ConnectionOutcome>,
    ) {
        let (local, remote_end) = tokio::io::duplex(1 << 20);
        let shared = Arc::new(ConnectionShared::new(ConnectionState::Connecting));
        let (tx, rx) = mpsc::channel(8);
        let engine =
            PeerProtocolEngine::new(local, ctx, Arc::clone(&shared), remote(), Direction::Outbound, rx);
        let task = tokio::spawn(engine.run(None));
        (remote_end, shared, tx, task)
    }

    fn frame_limits() -> FrameLimits {
        FrameLimits {
            max_message_length: 1 << 20,
            message_read_timeout: Duration::from_secs(2),
            data_read_timeout: Duration::from_secs(2),
        }
    }

    async fn complete_remote_handshake(stream: &mut DuplexStream, info_hash: InfoHash) {
        let ours = HandshakeCodec::read_handshake(stream, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ours.info_hash, info_hash);
        let reply = PeerHandshake::new(info_hash, PeerId::new([0x22; 20]));
        stream
            .write_all(&HandshakeCodec::serialize_handshake(&reply))
            .await
            .unwrap();
    }

    async fn send(stream: &mut DuplexStream, message: PeerMessage) {
        stream
            .write_all(&MessageCodec::serialize_message(&message))
            .await
            .unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> PeerMessage {
        MessageCodec::read_frame(stream, &frame_limits()).await.unwrap()
    }

    #[tokio::test]
    async fn test_serves_request_in_bounded_chunks() {
        let ctx = context(0, fast_config());
        let info_hash = ctx.info_hash;
        let counters = Arc::clone(&ctx.counters);
        let (mut peer, shared, commands, task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;
        assert!(matches!(recv(&mut peer).await, PeerMessage::Bitfield { .. }));

        send(&mut peer, PeerMessage::Interested).await;
        assert_eq!(recv(&mut peer).await, PeerMessage::Unchoke);
        assert_eq!(shared.state(), ConnectionState::Established);

        send(
            &mut peer,
            PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 0,
                length: 40 * 1024,
            },
        )
        .await;

        let mut sizes = Vec::new();
        let mut next_offset = 0;
        while sizes.iter().sum::<usize>() < 40 * 1024 {
            match recv(&mut peer).await {
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                } => {
                    assert_eq!(piece_index, PieceIndex::new(1));
                    assert_eq!(offset, next_offset);
                    next_offset += data.len() as u32;
                    sizes.push(data.len());
                }
                PeerMessage::KeepAlive => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sizes, vec![16 * 1024, 16 * 1024, 8 * 1024]);

        commands.send(ConnectionCommand::Close).await.unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Requested);
        assert_eq!(outcome.uploaded, 40 * 1024);
        assert_eq!(counters.uploaded(), 40 * 1024);
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_mismatch_errors_then_closes() {
        let ctx = context(0, fast_config());
        let (mut peer, shared, _commands, task) = spawn_outbound(ctx);

        let _ = HandshakeCodec::read_handshake(&mut peer, Duration::from_secs(1))
            .await
            .unwrap();
        let wrong = PeerHandshake::new(InfoHash::new([0x99; 20]), PeerId::new([0x22; 20]));
        peer.write_all(&HandshakeCodec::serialize_handshake(&wrong))
            .await
            .unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Error);
        assert!(matches!(
            outcome.error,
            Some(PeerProtocolError::HandshakeMismatch { .. })
        ));
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_message_is_an_error() {
        let ctx = context(0, fast_config());
        let info_hash = ctx.info_hash;
        let (mut peer, _shared, _commands, task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;
        // Have with a three byte payload
        peer.write_all(&[0, 0, 0, 4, 4, 0, 0, 1]).await.unwrap();

        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome.error,
            Some(PeerProtocolError::MalformedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_shaper_cap_defers_serving() {
        // 100 KiB/s with a 10ms tick is 1024 bytes per tick
        let ctx = context(100 * 1024, fast_config());
        let info_hash = ctx.info_hash;
        let shaper = Arc::clone(&ctx.shaper);
        let (mut peer, _shared, commands, task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;
        let _bitfield = recv(&mut peer).await;
        send(&mut peer, PeerMessage::Interested).await;
        assert_eq!(recv(&mut peer).await, PeerMessage::Unchoke);
        send(
            &mut peer,
            PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: 4096,
            },
        )
        .await;

        let PeerMessage::Piece { data, .. } = recv(&mut peer).await else {
            panic!("expected piece");
        };
        assert_eq!(data.len(), 1024);

        // Nothing more until the shaper refills
        shaper.tick(Duration::from_millis(10));
        let PeerMessage::Piece { offset, data, .. } = recv(&mut peer).await else {
            panic!("expected piece");
        };
        assert_eq!(offset, 1024);
        assert_eq!(data.len(), 1024);

        commands.send(ConnectionCommand::Close).await.unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.uploaded, 2048);
    }

    #[tokio::test]
    async fn test_idle_keeps_serving_and_sends_have() {
        let ctx = context(0, fast_config());
        let info_hash = ctx.info_hash;
        let (mut peer, shared, commands, task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;
        let _bitfield = recv(&mut peer).await;
        send(&mut peer, PeerMessage::Interested).await;
        assert_eq!(recv(&mut peer).await, PeerMessage::Unchoke);

        commands.send(ConnectionCommand::SetIdle(true)).await.unwrap();
        commands
            .send(ConnectionCommand::SendHave(PieceIndex::new(2)))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut peer).await,
            PeerMessage::Have {
                piece_index: PieceIndex::new(2)
            }
        );
        assert_eq!(shared.state(), ConnectionState::Idle);

        send(
            &mut peer,
            PeerMessage::Request {
                piece_index: PieceIndex::new(3),
                offset: 0,
                length: 4096,
            },
        )
        .await;
        loop {
            match recv(&mut peer).await {
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                } => {
                    assert_eq!(piece_index, PieceIndex::new(3));
                    assert_eq!(offset, 0);
                    assert_eq!(data.len(), 4096);
                    break;
                }
                PeerMessage::KeepAlive => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(shared.state(), ConnectionState::Idle);

        commands.send(ConnectionCommand::SetIdle(false)).await.unwrap();
        drop(commands);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Requested);
        assert_eq!(outcome.uploaded, 4096);
    }

    #[tokio::test]
    async fn test_keep_alive_after_silence() {
        let config = PeerConfig {
            keep_alive_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let ctx = context(0, config);
        let info_hash = ctx.info_hash;
        let (mut peer, _shared, commands, _task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;
        let _bitfield = recv(&mut peer).await;

        let mut header = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header, [0, 0, 0, 0]);
        commands.send(ConnectionCommand::Close).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_gracefully() {
        let config = PeerConfig {
            message_read_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let ctx = context(0, config);
        let info_hash = ctx.info_hash;
        let (mut peer, shared, _commands, task) = spawn_outbound(ctx);

        complete_remote_handshake(&mut peer, info_hash).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.reason, CloseReason::ReadTimeout);
        assert_eq!(shared.state(), ConnectionState::Closed);
    }
}
