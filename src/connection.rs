//! A single peer connection: handshake exchange followed by a framed
//! message stream.
//!
//! Grounded in the teacher's `peer/mod.rs` `PeerSession::start`, which
//! drives the handshake over a `Framed<_, HandshakeCodec>` and then swaps
//! in the body codec via `FramedParts` once the handshake completes; this
//! module keeps that two-codec-handoff shape but drops the teacher's wider
//! `State`/`Status` choking machinery, which this spec's Non-goals rule out.
//! Listener-side accept semantics follow
//! `original_source/client/core/p2p/connection.py` and
//! `connection_listener.py`.

use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::wire::codec::{HandshakeCodec, MessageCodec};
use crate::wire::{Handshake, Message};
use crate::{Error, PeerId, Result, Sha256Hash};

/// An established, post-handshake connection to one peer.
pub struct Connection {
    peer_addr: SocketAddr,
    peer_id: PeerId,
    framed: Framed<TcpStream, MessageCodec>,
}

impl Connection {
    /// Dials `addr`, sends the handshake first, then waits for the peer's
    /// reply (spec.md §4.4: the side with the smaller peer id is the one
    /// that dials).
    pub async fn outbound(
        addr: SocketAddr,
        our_id: PeerId,
        info_hash: Sha256Hash,
        piece_count: usize,
        max_block_len: u32,
    ) -> Result<Self> {
        log::info!("dialing peer {addr}");
        let socket = TcpStream::connect(addr).await?;
        let mut handshaking = Framed::new(socket, HandshakeCodec);

        handshaking
            .send(Handshake::new(our_id, info_hash))
            .await?;
        let peer_handshake = handshaking
            .next()
            .await
            .ok_or(Error::ConnectionClosed)??;

        finish_handshake(
            handshaking,
            peer_handshake,
            addr,
            info_hash,
            piece_count,
            max_block_len,
        )
    }

    /// Accepts an already-connected inbound socket, waiting for the peer's
    /// handshake before sending ours back.
    pub async fn inbound(
        socket: TcpStream,
        addr: SocketAddr,
        our_id: PeerId,
        info_hash: Sha256Hash,
        piece_count: usize,
        max_block_len: u32,
    ) -> Result<Self> {
        log::info!("accepted connection from {addr}");
        let mut handshaking = Framed::new(socket, HandshakeCodec);

        let peer_handshake = handshaking
            .next()
            .await
            .ok_or(Error::ConnectionClosed)??;
        handshaking
            .send(Handshake::new(our_id, info_hash))
            .await?;

        finish_handshake(
            handshaking,
            peer_handshake,
            addr,
            info_hash,
            piece_count,
            max_block_len,
        )
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.framed.send(msg).await
    }

    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.framed.next().await {
            Some(msg) => Ok(Some(msg?)),
            None => Ok(None),
        }
    }

    /// Splits the connection into an independent reader and writer so the
    /// engine can run the reader as a free-standing background task while
    /// keeping writes serialized through its own actor loop (spec.md §5,
    /// "single-actor model").
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (sink, stream) = self.framed.split();
        (
            ConnectionReader {
                peer_id: self.peer_id,
                peer_addr: self.peer_addr,
                stream,
            },
            ConnectionWriter { sink },
        )
    }
}

/// The read half of a split [`Connection`]; owned by the engine's
/// per-connection reader task (spec.md §4.2, "Reader loop").
pub struct ConnectionReader {
    peer_id: PeerId,
    peer_addr: SocketAddr,
    stream: SplitStream<Framed<TcpStream, MessageCodec>>,
}

impl ConnectionReader {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.stream.next().await {
            Some(msg) => Ok(Some(msg?)),
            None => Ok(None),
        }
    }
}

/// The write half of a split [`Connection`]; held by the engine's peer
/// record so outbound messages go out serialized by the engine's single
/// actor loop.
pub struct ConnectionWriter {
    sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
}

impl ConnectionWriter {
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.sink.send(msg).await
    }
}

fn finish_handshake(
    handshaking: Framed<TcpStream, HandshakeCodec>,
    peer_handshake: Handshake,
    addr: SocketAddr,
    our_info_hash: Sha256Hash,
    piece_count: usize,
    max_block_len: u32,
) -> Result<Connection> {
    if peer_handshake.info_hash != our_info_hash {
        log::warn!("peer {addr} sent a mismatched info hash");
        return Err(Error::InfoHashMismatch);
    }
    log::info!("handshake with {addr} complete, peer id {}", crate::short_hex(&peer_handshake.peer_id));

    // swap the fixed-size handshake codec for the length-prefixed message
    // codec, reusing the already-buffered bytes
    let parts = handshaking.into_parts();
    let mut new_parts = FramedParts::new(parts.io, MessageCodec::new(piece_count, max_block_len));
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    let framed = Framed::from_parts(new_parts);

    Ok(Connection {
        peer_addr: addr,
        peer_id: peer_handshake.peer_id,
        framed,
    })
}
