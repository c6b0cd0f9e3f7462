//! The per-peer state machine (§4.3): the four choke/interest flags,
//! availability bitset, block-request pipeline, and the dispatch of incoming
//! messages to the right mutation and listener event.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use super::exchange::{ExchangeState, PeerExchange};
use super::id::PeerId;
use crate::conf::PeerConf;
use crate::error::{Error, Result};
use crate::listener::{PeerActivityListener, PeerEvent};
use crate::rate::Rate;
use crate::torrent::Torrent;
use crate::wire::{BlockInfo, Handshake, Message};
use crate::Bitfield;

/// The piece currently being downloaded from this peer, and how far into it
/// we've requested.
struct RequestedPiece {
    index: u32,
    size: u32,
    last_requested_offset: u32,
}

/// Everything guarded by the per-peer mutex: the four flags, the request
/// pipeline, and the exchange reference (§5).
struct State {
    choking: bool,
    interesting: bool,
    choked: bool,
    interested: bool,
    requested_piece: Option<RequestedPiece>,
    requests: VecDeque<BlockInfo>,
    exchange: Option<PeerExchange>,
    /// Whether any message has been processed on the current connection yet,
    /// used to enforce that BITFIELD (if sent at all) is the first message.
    seen_any_message: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            choking: true,
            interesting: false,
            choked: true,
            interested: false,
            requested_piece: None,
            requests: VecDeque::new(),
            exchange: None,
            seen_any_message: false,
        }
    }
}

/// The state machine for one remote peer, as described throughout §3-§5.
///
/// `available_pieces` is guarded by its own lock, separate from the rest of
/// the state, so a rarest-first scheduler scanning availability across many
/// peers doesn't contend with message handling.
pub struct SharingPeer {
    id: PeerId,
    torrent: Arc<dyn Torrent>,
    listener: Arc<dyn PeerActivityListener>,
    conf: PeerConf,
    state: Mutex<State>,
    available_pieces: RwLock<Bitfield>,
    download_rate: Rate,
    upload_rate: Rate,
}

impl SharingPeer {
    pub fn new(
        id: PeerId,
        torrent: Arc<dyn Torrent>,
        listener: Arc<dyn PeerActivityListener>,
        conf: PeerConf,
    ) -> Arc<Self> {
        let piece_count = torrent.piece_count();
        Arc::new(Self {
            id,
            torrent,
            listener,
            conf,
            state: Mutex::new(State::default()),
            available_pieces: RwLock::new(Bitfield::repeat(false, piece_count as usize)),
            download_rate: Rate::new(conf.rate_window),
            upload_rate: Rate::new(conf.rate_window),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn download_rate(&self) -> &Rate {
        &self.download_rate
    }

    pub fn upload_rate(&self) -> &Rate {
        &self.upload_rate
    }

    pub async fn is_bound(&self) -> bool {
        self.state.lock().await.exchange.is_some()
    }

    /// The lifecycle state of the underlying connection, or `None` if the
    /// peer is currently unbound.
    pub async fn exchange_state(&self) -> Option<ExchangeState> {
        self.state.lock().await.exchange.as_ref().map(PeerExchange::state)
    }

    pub async fn is_choking(&self) -> bool {
        self.state.lock().await.choking
    }

    pub async fn is_choked(&self) -> bool {
        self.state.lock().await.choked
    }

    pub async fn is_interesting(&self) -> bool {
        self.state.lock().await.interesting
    }

    pub async fn is_interested(&self) -> bool {
        self.state.lock().await.interested
    }

    pub async fn available_pieces(&self) -> Bitfield {
        self.available_pieces.read().await.clone()
    }

    pub async fn pending_requests(&self) -> Vec<BlockInfo> {
        self.state.lock().await.requests.iter().copied().collect()
    }

    /// Connects to `addr`, performs the handshake, and installs the
    /// resulting exchange. Resets both rate meters, leaving
    /// `available_pieces` untouched so a reconnecting peer doesn't lose its
    /// previously announced availability (§9, open question decision).
    pub async fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
        our_handshake: Handshake,
    ) -> Result<Handshake> {
        {
            let state = self.state.lock().await;
            if state.exchange.is_some() {
                return Err(Error::AlreadyBound);
            }
        }

        self.download_rate.reset();
        self.upload_rate.reset();

        let weak = Arc::downgrade(self);
        let (exchange, peer_handshake) = PeerExchange::connect(
            addr,
            &self.conf,
            our_handshake,
            Arc::clone(&self.torrent),
            weak,
        )
        .await?;

        let mut state = self.state.lock().await;
        if state.exchange.is_some() {
            exchange.terminate();
            return Err(Error::AlreadyBound);
        }
        state.exchange = Some(exchange);
        state.seen_any_message = false;

        Ok(peer_handshake)
    }

    /// Tears down the connection. If `force` is false, first drains a
    /// NOT_INTERESTED and a CANCEL per outstanding request through the
    /// exchange before closing it gracefully; if `force`, aborts immediately.
    pub async fn unbind(&self, force: bool) {
        let exchange = {
            let mut state = self.state.lock().await;
            if state.exchange.is_none() {
                return;
            }
            if !force {
                for block in state.requests.iter().copied().collect::<Vec<_>>() {
                    self.send(&state.exchange, Message::Cancel(block));
                }
                self.send(&state.exchange, Message::NotInterested);
            }
            state.exchange.take()
        };

        if let Some(exchange) = exchange {
            if force {
                exchange.terminate();
            } else {
                exchange.close().await;
            }
        }

        self.listener
            .on_event(PeerEvent::PeerDisconnected(self.id.clone()));
    }

    pub async fn choke(&self) {
        let mut state = self.state.lock().await;
        if !state.choking {
            state.choking = true;
            self.send(&state.exchange, Message::Choke);
        }
    }

    pub async fn unchoke(&self) {
        let mut state = self.state.lock().await;
        if state.choking {
            state.choking = false;
            self.send(&state.exchange, Message::Unchoke);
        }
    }

    pub async fn interesting(&self) {
        let mut state = self.state.lock().await;
        if !state.interesting {
            state.interesting = true;
            self.send(&state.exchange, Message::Interested);
        }
    }

    pub async fn not_interesting(&self) {
        let mut state = self.state.lock().await;
        if state.interesting {
            state.interesting = false;
            self.send(&state.exchange, Message::NotInterested);
        }
    }

    /// Starts downloading piece `index`: fails with `AlreadyDownloading` if a
    /// download is already in progress on this peer.
    pub async fn download_piece(&self, index: u32) -> Result<()> {
        let size = self
            .torrent
            .piece_len(index)
            .ok_or(Error::ProtocolViolation("download_piece: unknown piece index"))?;

        let mut state = self.state.lock().await;
        if state.requested_piece.is_some() {
            return Err(Error::AlreadyDownloading);
        }
        state.requested_piece = Some(RequestedPiece {
            index,
            size,
            last_requested_offset: 0,
        });
        state.requests.clear();
        self.request_next_blocks(&mut state);
        Ok(())
    }

    /// Enqueues a CANCEL mirroring every currently outstanding request and
    /// returns the set, without clearing `requested_piece` (the caller
    /// decides whether and to whom to reassign the piece).
    pub async fn cancel_pending_requests(&self) -> Vec<BlockInfo> {
        let state = self.state.lock().await;
        for block in &state.requests {
            self.send(&state.exchange, Message::Cancel(*block));
        }
        state.requests.iter().copied().collect()
    }

    pub(crate) async fn handle_message(&self, msg: Message) {
        if let Err(err) = self.handle_message_inner(msg).await {
            log::warn!("peer {} protocol violation: {}", self.id, err);
            self.unbind(true).await;
        }
    }

    pub(crate) async fn handle_exchange_error(&self, err: Error) {
        log::warn!("peer {} io error: {}", self.id, err);
        self.listener
            .on_event(PeerEvent::IoError(self.id.clone(), Arc::new(err)));
        self.unbind(true).await;
    }

    async fn handle_message_inner(&self, msg: Message) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if matches!(msg, Message::Bitfield(_)) && state.seen_any_message {
                return Err(Error::ProtocolViolation(
                    "BITFIELD received after other messages",
                ));
            }
            state.seen_any_message = true;
        }

        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.on_choke().await,
            Message::Unchoke => self.on_unchoke().await,
            Message::Interested => {
                self.state.lock().await.interested = true;
            }
            Message::NotInterested => {
                self.state.lock().await.interested = false;
            }
            Message::Have { piece_index } => self.on_have(piece_index).await,
            Message::Bitfield(bitfield) => self.on_bitfield(bitfield).await,
            Message::Request(block) => self.on_request(block).await?,
            Message::Piece {
                piece_index,
                offset,
                block,
            } => self.on_piece(piece_index, offset, block).await,
            Message::Cancel(block) => {
                // the writer flushes eagerly and retains no queue of
                // already-encoded PIECE responses to rescind (§9, open
                // question decision): accept and log only.
                log::trace!("peer {} sent CANCEL for {:?}", self.id, block);
            }
        }
        Ok(())
    }

    async fn on_choke(&self) {
        {
            let mut state = self.state.lock().await;
            state.choked = true;
        }
        self.listener
            .on_event(PeerEvent::PeerChoked(self.id.clone()));
        self.cancel_pending_requests().await;
    }

    async fn on_unchoke(&self) {
        {
            let mut state = self.state.lock().await;
            state.choked = false;
        }
        self.listener
            .on_event(PeerEvent::PeerReady(self.id.clone()));
    }

    async fn on_have(&self, piece_index: u32) {
        let changed = {
            let mut available = self.available_pieces.write().await;
            match available.get_mut(piece_index as usize) {
                Some(mut bit) if !*bit => {
                    *bit = true;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.listener.on_event(PeerEvent::PieceAvailability {
                peer: self.id.clone(),
                piece_index,
            });
        }
    }

    async fn on_bitfield(&self, mut bitfield: Bitfield) {
        // the wire form is byte-rounded and so may be longer than
        // `piece_count`; trim the padding bits before storing it so
        // `available_pieces.len() <= piece_count` always holds.
        bitfield.truncate(self.torrent.piece_count() as usize);
        {
            let mut available = self.available_pieces.write().await;
            *available = bitfield.clone();
        }
        self.listener.on_event(PeerEvent::BitfieldAvailability {
            peer: self.id.clone(),
            available: bitfield,
        });
    }

    async fn on_request(&self, block: BlockInfo) -> Result<()> {
        if self.state.lock().await.choking {
            return Err(Error::ProtocolViolation("REQUEST received while choking"));
        }

        let piece = self
            .torrent
            .piece(block.piece_index)
            .ok_or(Error::ProtocolViolation("REQUEST for an unknown piece"))?;
        if !piece.is_valid() {
            return Err(Error::ProtocolViolation(
                "REQUEST for a piece we don't hold",
            ));
        }
        if block.length > self.conf.max_request_size {
            return Err(Error::ProtocolViolation(
                "REQUEST exceeds the maximum block size",
            ));
        }

        let data = match piece.read(block.offset, block.length) {
            Ok(data) => data,
            Err(err) => {
                // a storage read failure is not a protocol violation: surface
                // it and let the caller decide whether to keep the peer.
                self.listener.on_event(PeerEvent::IoError(
                    self.id.clone(),
                    Arc::new(err),
                ));
                return Ok(());
            }
        };
        let piece_size = piece.size();

        {
            let state = self.state.lock().await;
            self.send(
                &state.exchange,
                Message::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    block: data,
                },
            );
        }
        self.upload_rate.add(block.length as usize);

        if block.end_offset() == piece_size as u64 {
            self.listener.on_event(PeerEvent::PieceSent {
                peer: self.id.clone(),
                piece_index: block.piece_index,
            });
        }
        Ok(())
    }

    async fn on_piece(&self, piece_index: u32, offset: u32, block: Bytes) {
        let Some(piece) = self.torrent.piece(piece_index) else {
            log::trace!(
                "peer {} sent PIECE for unknown piece {}",
                self.id,
                piece_index
            );
            return;
        };
        let block_len = block.len() as u32;
        piece.record(&block, offset);
        self.download_rate.add(block_len as usize);

        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.piece_index == piece_index && r.offset == offset)
        {
            state.requests.remove(pos);
        }

        if offset as u64 + block_len as u64 == piece.size() as u64 {
            piece.validate();
            if matches!(&state.requested_piece, Some(p) if p.index == piece_index) {
                state.requested_piece = None;
            }
            drop(state);
            self.listener.on_event(PeerEvent::PieceCompleted {
                peer: self.id.clone(),
                piece_index,
            });
            self.listener
                .on_event(PeerEvent::PeerReady(self.id.clone()));
        } else {
            self.request_next_blocks(&mut state);
        }
    }

    /// Fills the request pipeline up to its configured depth, per §4.3.
    fn request_next_blocks(&self, state: &mut State) {
        let max = self.conf.max_pipelined_requests;
        let request_size = self.conf.request_size;
        if let Some(piece) = state.requested_piece.as_mut() {
            while state.requests.len() < max && piece.last_requested_offset < piece.size {
                let len = request_size.min(piece.size - piece.last_requested_offset);
                let block = BlockInfo {
                    piece_index: piece.index,
                    offset: piece.last_requested_offset,
                    length: len,
                };
                piece.last_requested_offset += len;
                state.requests.push_back(block);
                self.send(&state.exchange, Message::Request(block));
            }
        }
    }

    fn send(&self, exchange: &Option<PeerExchange>, msg: Message) {
        match exchange {
            Some(exchange) => exchange.send(msg),
            None => {
                log::trace!("peer {} is unbound, dropping outbound {:?}", self.id, msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChannelListener;
    use crate::test_support::FixedSizeTorrent;
    use crate::wire::{HandshakeCodec, PeerCodec};
    use futures::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, FramedParts};

    fn peer_id() -> PeerId {
        PeerId::new("127.0.0.1", 6881, [7; 20])
    }

    fn make_peer(
        torrent: Arc<dyn Torrent>,
    ) -> (
        Arc<SharingPeer>,
        tokio::sync::mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (channel_listener, events) = ChannelListener::new();
        let peer = SharingPeer::new(peer_id(), torrent, Arc::new(channel_listener), PeerConf::default());
        (peer, events)
    }

    #[tokio::test]
    async fn fresh_peer_has_spec_default_flags() {
        let torrent = Arc::new(FixedSizeTorrent::new(4, 1 << 16));
        let (peer, _events) = make_peer(torrent);

        assert!(peer.is_choking().await);
        assert!(peer.is_choked().await);
        assert!(!peer.is_interesting().await);
        assert!(!peer.is_interested().await);
        assert!(!peer.available_pieces().await.any());
        assert!(!peer.is_bound().await);
    }

    #[tokio::test]
    async fn choke_is_idempotent_on_the_flag() {
        let torrent = Arc::new(FixedSizeTorrent::new(4, 1 << 16));
        let (peer, _events) = make_peer(torrent);

        peer.unchoke().await;
        assert!(!peer.is_choking().await);
        peer.unchoke().await;
        assert!(!peer.is_choking().await);
    }

    /// Connects a `SharingPeer` to a raw loopback socket acting as the
    /// remote end, completing the handshake and handing back a plain
    /// `Framed<TcpStream, PeerCodec>` for the test to drive the remote side
    /// of the protocol directly.
    async fn connected_pair(
        piece_count: u32,
        piece_len: u32,
    ) -> (
        Arc<SharingPeer>,
        Framed<TcpStream, PeerCodec>,
        tokio::sync::mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let torrent: Arc<dyn Torrent> = Arc::new(FixedSizeTorrent::new(piece_count, piece_len));
        let (channel_listener, events) = ChannelListener::new();
        let peer = SharingPeer::new(
            PeerId::new("127.0.0.1", addr.port(), [7; 20]),
            torrent.clone(),
            Arc::new(channel_listener),
            PeerConf::default(),
        );

        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);
            let _their_handshake = framed.next().await.unwrap().unwrap();
            framed
                .send(Handshake::new([0; 20], [9; 20]))
                .await
                .unwrap();
            let parts = framed.into_parts();
            let mut new_parts = FramedParts::new(parts.io, PeerCodec::new(torrent));
            new_parts.read_buf = parts.read_buf;
            new_parts.write_buf = parts.write_buf;
            Framed::from_parts(new_parts)
        });

        peer.bind(addr, Handshake::new([0; 20], [1; 20]))
            .await
            .unwrap();
        let remote = accept.await.unwrap();

        (peer, remote, events)
    }

    #[tokio::test]
    async fn downloads_a_two_block_piece() {
        let (peer, mut remote, _events) = connected_pair(1, 32 * 1024).await;

        remote.send(Message::Unchoke).await.unwrap();
        // give the reader task a chance to observe UNCHOKE before we start
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        peer.download_piece(0).await.unwrap();

        let first = remote.next().await.unwrap().unwrap();
        let second = remote.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            Message::Request(BlockInfo {
                piece_index: 0,
                offset: 0,
                length: 16384
            })
        );
        assert_eq!(
            second,
            Message::Request(BlockInfo {
                piece_index: 0,
                offset: 16384,
                length: 16384
            })
        );

        remote
            .send(Message::Piece {
                piece_index: 0,
                offset: 0,
                block: Bytes::from(vec![0u8; 16384]),
            })
            .await
            .unwrap();
        remote
            .send(Message::Piece {
                piece_index: 0,
                offset: 16384,
                block: Bytes::from(vec![0u8; 16384]),
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(peer.pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn choke_while_downloading_cancels_outstanding_requests() {
        let (peer, mut remote, mut events) = connected_pair(1, 96 * 1024).await;

        remote.send(Message::Unchoke).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        peer.download_piece(0).await.unwrap();

        for offset in [0u32, 16384, 32768, 49152, 65536] {
            let msg = remote.next().await.unwrap().unwrap();
            assert_eq!(
                msg,
                Message::Request(BlockInfo {
                    piece_index: 0,
                    offset,
                    length: 16384
                })
            );
        }

        remote.send(Message::Choke).await.unwrap();

        let mut cancels = Vec::new();
        for _ in 0..5 {
            match remote.next().await.unwrap().unwrap() {
                Message::Cancel(block) => cancels.push(block.offset),
                other => panic!("expected CANCEL, got {:?}", other),
            }
        }
        assert_eq!(cancels, vec![0, 16384, 32768, 49152, 65536]);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::PeerReady(_)));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::PeerChoked(_)));
    }

    #[tokio::test]
    async fn request_while_choking_forces_a_disconnect() {
        let (peer, mut remote, mut events) = connected_pair(1, 32 * 1024).await;

        remote
            .send(Message::Request(BlockInfo {
                piece_index: 0,
                offset: 0,
                length: 16384,
            }))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::PeerDisconnected(_)));
        assert!(remote.next().await.is_none());
        assert!(!peer.is_bound().await);
    }

    #[tokio::test]
    async fn serves_a_request_for_a_held_piece() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let torrent: Arc<dyn Torrent> = Arc::new(FixedSizeTorrent::seeded(1, 16384));
        let (channel_listener, mut events) = ChannelListener::new();
        let peer = SharingPeer::new(
            PeerId::new("127.0.0.1", addr.port(), [7; 20]),
            torrent.clone(),
            Arc::new(channel_listener),
            PeerConf::default(),
        );

        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);
            let _ = framed.next().await.unwrap().unwrap();
            framed
                .send(Handshake::new([0; 20], [9; 20]))
                .await
                .unwrap();
            let parts = framed.into_parts();
            let mut new_parts = FramedParts::new(parts.io, PeerCodec::new(torrent));
            new_parts.read_buf = parts.read_buf;
            new_parts.write_buf = parts.write_buf;
            Framed::from_parts(new_parts)
        });

        peer.bind(addr, Handshake::new([0; 20], [1; 20]))
            .await
            .unwrap();
        let mut remote = accept.await.unwrap();

        peer.unchoke().await;
        remote
            .send(Message::Request(BlockInfo {
                piece_index: 0,
                offset: 0,
                length: 16384,
            }))
            .await
            .unwrap();

        let reply = remote.next().await.unwrap().unwrap();
        match reply {
            Message::Piece {
                piece_index,
                offset,
                block,
            } => {
                assert_eq!(piece_index, 0);
                assert_eq!(offset, 0);
                assert_eq!(block.len(), 16384);
            }
            other => panic!("expected PIECE, got {:?}", other),
        }

        let event = events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::PieceSent { .. }));
    }
}
