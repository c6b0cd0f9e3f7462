//! Owns one connected peer socket and runs the reader and writer activities
//! described in §4.2: a reader that decodes frames and hands them to the
//! owning [`super::sharing_peer::SharingPeer`], and a writer that drains an
//! outbound queue, injecting a KEEP_ALIVE when the queue has been idle for
//! too long.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedParts};

use super::sharing_peer::SharingPeer;
use crate::conf::PeerConf;
use crate::error::{Error, Result};
use crate::torrent::Torrent;
use crate::wire::{Handshake, HandshakeCodec, Message, PeerCodec};

/// The lifecycle of a [`PeerExchange`]'s underlying connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    New,
    Connected,
    Closing,
    Closed,
    Errored,
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;
type Stream = SplitStream<Framed<TcpStream, PeerCodec>>;

/// Owns the socket and background tasks for one peer connection.
pub struct PeerExchange {
    outbound: mpsc::UnboundedSender<Message>,
    state: Arc<Mutex<ExchangeState>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PeerExchange {
    /// Performs an outbound handshake to `addr` and, on success, switches to
    /// the steady-state [`PeerCodec`] and spawns the reader and writer
    /// tasks, reusing the handshake codec's buffered bytes so that any
    /// message the peer sent immediately after its own handshake isn't
    /// lost.
    pub(crate) async fn connect(
        addr: SocketAddr,
        conf: &PeerConf,
        our_handshake: Handshake,
        torrent: Arc<dyn Torrent>,
        sharing_peer: Weak<SharingPeer>,
    ) -> Result<(Self, Handshake)> {
        let socket =
            tokio::time::timeout(conf.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;

        let mut handshake_framed = Framed::new(socket, HandshakeCodec);
        handshake_framed.send(our_handshake).await?;
        let peer_handshake = handshake_framed
            .next()
            .await
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection during handshake",
                ))
            })??;

        // switch codecs in place, keeping any buffered bytes the peer sent
        // right after its handshake
        let old_parts = handshake_framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec::new(torrent));
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let framed = Framed::from_parts(new_parts);

        Ok((Self::spawn(framed, conf, sharing_peer), peer_handshake))
    }

    fn spawn(
        framed: Framed<TcpStream, PeerCodec>,
        conf: &PeerConf,
        sharing_peer: Weak<SharingPeer>,
    ) -> Self {
        let (sink, stream) = framed.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ExchangeState::Connected));

        let writer_task = tokio::spawn(Self::run_writer(
            sink,
            outbound_rx,
            conf.keepalive_interval,
            Arc::clone(&state),
        ));
        let reader_task = tokio::spawn(Self::run_reader(
            stream,
            conf.idle_read_timeout,
            sharing_peer,
            Arc::clone(&state),
        ));

        Self {
            outbound,
            state,
            reader_task,
            writer_task,
        }
    }

    /// Enqueues `msg` for delivery; returns immediately without waiting for
    /// the write to complete.
    pub(crate) fn send(&self, msg: Message) {
        if self.outbound.send(msg).is_err() {
            log::warn!("Peer outbound queue is closed, dropping message");
        }
    }

    pub(crate) fn state(&self) -> ExchangeState {
        *self.state.lock().unwrap()
    }

    /// Gracefully closes the exchange: lets the writer drain whatever is
    /// already queued, then tears the socket down.
    pub(crate) async fn close(self) {
        *self.state.lock().unwrap() = ExchangeState::Closing;
        // dropping the sender closes the channel, so the writer's `recv()`
        // returns `None` once the queue is drained
        drop(self.outbound);
        let _ = self.writer_task.await;
        self.reader_task.abort();
    }

    /// Abortively tears the connection down, dropping any queued writes.
    pub(crate) fn terminate(self) {
        *self.state.lock().unwrap() = ExchangeState::Closed;
        self.reader_task.abort();
        self.writer_task.abort();
    }

    async fn run_reader(
        mut stream: Stream,
        idle_timeout: std::time::Duration,
        sharing_peer: Weak<SharingPeer>,
        state: Arc<Mutex<ExchangeState>>,
    ) {
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let Some(sharing_peer) = sharing_peer.upgrade() else {
                break;
            };
            let err = match next {
                Ok(Some(Ok(msg))) => {
                    sharing_peer.handle_message(msg).await;
                    continue;
                }
                Ok(Some(Err(err))) => err,
                Ok(None) => Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )),
                Err(_elapsed) => Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer read timed out",
                )),
            };
            *state.lock().unwrap() = ExchangeState::Errored;
            sharing_peer.handle_exchange_error(err).await;
            break;
        }
    }

    async fn run_writer(
        mut sink: Sink,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        keepalive_interval: std::time::Duration,
        state: Arc<Mutex<ExchangeState>>,
    ) {
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(err) = sink.send(msg).await {
                                log::warn!("Peer write error: {}", err);
                                *state.lock().unwrap() = ExchangeState::Errored;
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(keepalive_interval) => {
                    log::trace!("Outbound queue idle, sending keepalive");
                    if let Err(err) = sink.send(Message::KeepAlive).await {
                        log::warn!("Peer keepalive write error: {}", err);
                        *state.lock().unwrap() = ExchangeState::Errored;
                        break;
                    }
                }
            }
        }

        {
            let mut state = state.lock().unwrap();
            if *state != ExchangeState::Errored {
                *state = ExchangeState::Closed;
            }
        }
        let _ = sink.close().await;
    }
}
