//! The peer engine: the center of the crate (spec.md §4.5). Owns one
//! resource's connections, its piece scheduler, request timeouts, hash
//! verification, completion commit, periodic bitfield broadcast, and the
//! network stats sampler.
//!
//! Shaped as a single-actor task that owns all mutable state directly and
//! is driven by one `tokio::select!` loop, rather than the teacher's
//! `Arc<RwLock<Torrent>>` shared-state style (visible in `peer/mod.rs`'s
//! `PeerSession` holding a back-reference to shared `Torrent` state): this
//! spec's "single-threaded cooperative" requirement (its concurrency
//! section) maps more directly onto an actor with message passing than onto
//! lock-guarded shared state, so connection reader tasks and timers talk to
//! the engine only through channels. Handshake/tie-break semantics and the
//! scheduler loop are grounded in
//! `original_source/client/core/p2p/resource_manager.py`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::conf::EngineConf;
use crate::connection::Connection;
use crate::descriptor::ResourceDescriptor;
use crate::piece_table::PieceTable;
use crate::resource_file::{ResourceFile, State as FileState};
use crate::resume::ResumeStore;
use crate::wire::Message;
use crate::{short_hex, Bitfield, Error, PeerId, PieceIndex, Result};

/// A snapshot of one resource's download/upload progress, returned by
/// [`ResourceEngine::state`] (spec.md §4.5, "get_state").
#[derive(Clone, Debug)]
pub struct EngineState {
    pub owned: Vec<bool>,
    pub download_bps: f64,
    pub upload_bps: f64,
}

#[derive(Default)]
struct NetworkStats {
    bytes_down: u64,
    bytes_up: u64,
    download_bps: f64,
    upload_bps: f64,
}

impl NetworkStats {
    fn drop_window(&mut self, elapsed: std::time::Duration) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        self.download_bps = self.bytes_down as f64 / secs;
        self.upload_bps = self.bytes_up as f64 / secs;
        self.bytes_down = 0;
        self.bytes_up = 0;
    }
}

struct PeerRecord {
    addr: SocketAddr,
    bitfield: Bitfield,
    writer: crate::connection::ConnectionWriter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Inbound,
    Outbound,
}

enum Command {
    SubmitPeers(Vec<(PeerId, SocketAddr)>),
    OpenPublicPort(oneshot::Sender<Result<u16>>),
    ClosePublicPort,
    RestorePrevious(oneshot::Sender<Result<()>>),
    StartDownload,
    StopDownload,
    StartSharing,
    StopSharing,
    GetState(oneshot::Sender<EngineState>),
    Shutdown,
}

enum ActorMsg {
    Connected(Connection, Origin),
    PeerMessage(PeerId, Message),
    PeerClosed(PeerId),
    WorkTimeout(PeerId, PieceIndex),
    Command(Command),
}

/// A cheap, cloneable handle to a running engine task. All operations are
/// fire-and-forget or round-trip through the actor via a channel; the
/// engine itself lives entirely inside the task spawned by
/// [`ResourceEngine::spawn`].
#[derive(Clone)]
pub struct ResourceEngine {
    tx: mpsc::UnboundedSender<ActorMsg>,
}

impl ResourceEngine {
    /// Spawns the engine task for `descriptor`, writing to/reading from
    /// `destination`. The engine starts idle: call `restore_previous`,
    /// `start_sharing_file`/`start_download`, and `open_public_port` (or
    /// `full_start`) to bring it up.
    pub fn spawn(
        our_id: PeerId,
        descriptor: ResourceDescriptor,
        destination: PathBuf,
        conf: EngineConf,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let info_hash = descriptor.info_hash();
        let piece_count = descriptor.piece_count();
        let dir = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let resume = ResumeStore::new(&dir, &descriptor);
        let file = Arc::new(ResourceFile::new(destination, &descriptor));

        let actor = Actor {
            our_id,
            info_hash,
            piece_table: PieceTable::new(piece_count, &vec![false; piece_count]),
            descriptor,
            file,
            resume,
            conf,
            peers: HashMap::new(),
            sharing_enabled: false,
            downloading: false,
            listener: None,
            stats: NetworkStats::default(),
            shutting_down: false,
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    fn send_command(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(ActorMsg::Command(cmd))
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn submit_peers(&self, peers: Vec<(PeerId, SocketAddr)>) -> Result<()> {
        self.send_command(Command::SubmitPeers(peers))
    }

    pub async fn open_public_port(&self) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::OpenPublicPort(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub fn close_public_port(&self) -> Result<()> {
        self.send_command(Command::ClosePublicPort)
    }

    pub async fn restore_previous(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::RestorePrevious(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub fn start_download(&self) -> Result<()> {
        self.send_command(Command::StartDownload)
    }

    pub fn stop_download(&self) -> Result<()> {
        self.send_command(Command::StopDownload)
    }

    pub fn start_sharing_file(&self) -> Result<()> {
        self.send_command(Command::StartSharing)
    }

    pub fn stop_sharing_file(&self) -> Result<()> {
        self.send_command(Command::StopSharing)
    }

    pub async fn state(&self) -> Result<EngineState> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::GetState(reply))?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Convenience: restore, optionally enable sharing, start the
    /// scheduler, and open the public port, in that order.
    pub async fn full_start(&self, share: bool) -> Result<u16> {
        self.restore_previous().await?;
        if share {
            self.start_sharing_file()?;
        }
        self.start_download()?;
        self.open_public_port().await
    }

    /// Idempotent: shutting down an already-shut-down engine is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.tx.send(ActorMsg::Command(Command::Shutdown));
        Ok(())
    }
}

struct Actor {
    our_id: PeerId,
    info_hash: crate::Sha256Hash,
    descriptor: ResourceDescriptor,
    file: Arc<ResourceFile>,
    resume: ResumeStore,
    conf: EngineConf,
    piece_table: PieceTable,
    peers: HashMap<PeerId, PeerRecord>,
    sharing_enabled: bool,
    downloading: bool,
    listener: Option<TcpListener>,
    stats: NetworkStats,
    shutting_down: bool,
    tx: mpsc::UnboundedSender<ActorMsg>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorMsg>) {
        let mut scheduler_tick = tokio::time::interval(self.conf.scheduler_tick);
        let mut broadcast_tick = tokio::time::interval(self.conf.broadcast_interval);
        let mut stats_tick = tokio::time::interval(self.conf.stats_window);
        let mut last_drop = Instant::now();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = scheduler_tick.tick() => self.on_scheduler_tick().await,
                _ = broadcast_tick.tick() => self.on_broadcast_tick().await,
                _ = stats_tick.tick() => {
                    let now = Instant::now();
                    self.stats.drop_window(now.duration_since(last_drop));
                    last_drop = now;
                }
                accepted = accept_if_listening(&mut self.listener) => {
                    if let Some(Ok((socket, addr))) = accepted {
                        self.handle_inbound(socket, addr);
                    }
                }
            }

            if self.shutting_down {
                break;
            }
        }
        log::info!("engine for {} shut down", self.descriptor.name);
    }

    async fn handle(&mut self, msg: ActorMsg) {
        match msg {
            ActorMsg::Connected(conn, origin) => self.handle_connected(conn, origin).await,
            ActorMsg::PeerMessage(peer_id, msg) => self.handle_peer_message(peer_id, msg).await,
            ActorMsg::PeerClosed(peer_id) => {
                if self.disconnect_peer(&peer_id) {
                    log::info!("peer {} disconnected", short_hex(&peer_id));
                }
            }
            ActorMsg::WorkTimeout(peer_id, piece_index) => {
                if self.piece_table.charge_of(piece_index) == Some(peer_id) {
                    log::debug!(
                        "request for piece {piece_index} to {} timed out",
                        short_hex(&peer_id)
                    );
                    let _ = self.piece_table.release(piece_index);
                }
            }
            ActorMsg::Command(cmd) => self.handle_command(cmd).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SubmitPeers(candidates) => {
                for (peer_id, addr) in candidates {
                    if peer_id == self.our_id {
                        log::warn!("own peer id passed to submit_peers");
                        continue;
                    }
                    // only the lexicographically smaller id dials (spec.md
                    // §4.5, "Identity and tie-breaking")
                    if !(self.our_id < peer_id) {
                        continue;
                    }
                    if self.peers.contains_key(&peer_id) {
                        continue;
                    }
                    self.dial(peer_id, addr);
                }
            }
            Command::OpenPublicPort(reply) => {
                let result = self.open_public_port().await;
                let _ = reply.send(result);
            }
            Command::ClosePublicPort => {
                self.listener = None;
            }
            Command::RestorePrevious(reply) => {
                let result = self.restore_previous().await;
                let _ = reply.send(result);
            }
            Command::StartDownload => {
                if !self.piece_table.is_complete() {
                    self.downloading = true;
                }
            }
            Command::StopDownload => {
                self.downloading = false;
            }
            Command::StartSharing => {
                self.sharing_enabled = true;
            }
            Command::StopSharing => {
                self.sharing_enabled = false;
            }
            Command::GetState(reply) => {
                let _ = reply.send(EngineState {
                    owned: self.piece_table.saved_bitmap(),
                    download_bps: self.stats.download_bps,
                    upload_bps: self.stats.upload_bps,
                });
            }
            Command::Shutdown => {
                self.listener = None;
                self.peers.clear();
                self.downloading = false;
                self.sharing_enabled = false;
                self.shutting_down = true;
            }
        }
    }

    async fn open_public_port(&mut self) -> Result<u16> {
        if self.listener.is_some() {
            return Err(Error::AlreadyListening);
        }
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        self.listener = Some(listener);
        log::info!("listening on port {port}");
        Ok(port)
    }

    async fn restore_previous(&mut self) -> Result<()> {
        if self.file.state().await == FileState::Downloaded {
            self.piece_table.seed_saved(&vec![true; self.piece_table.len()]);
            return Ok(());
        }
        match self.resume.load().await {
            Ok(bitmap) => self.piece_table.seed_saved(&bitmap),
            Err(e) => log::warn!("no resume state to restore: {e}"),
        }
        Ok(())
    }

    fn dial(&self, peer_id: PeerId, addr: SocketAddr) {
        let our_id = self.our_id;
        let info_hash = self.info_hash;
        let piece_count = self.piece_table.len();
        let max_block_len = self.conf.max_block_len;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match Connection::outbound(addr, our_id, info_hash, piece_count, max_block_len).await
            {
                Ok(conn) => {
                    if conn.peer_id() != peer_id {
                        log::warn!("peer at {addr} handshake carried an unexpected peer id");
                        return;
                    }
                    let _ = tx.send(ActorMsg::Connected(conn, Origin::Outbound));
                }
                Err(e) => log::warn!("failed to connect to {addr}: {e}"),
            }
        });
    }

    fn handle_inbound(&self, socket: TcpStream, addr: SocketAddr) {
        let our_id = self.our_id;
        let info_hash = self.info_hash;
        let piece_count = self.piece_table.len();
        let max_block_len = self.conf.max_block_len;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match Connection::inbound(socket, addr, our_id, info_hash, piece_count, max_block_len)
                .await
            {
                Ok(conn) => {
                    let _ = tx.send(ActorMsg::Connected(conn, Origin::Inbound));
                }
                Err(e) => log::warn!("inbound handshake with {addr} failed: {e}"),
            }
        });
    }

    /// Registers a freshly-handshaken connection, applying the tie-break
    /// and deduplication rules (spec.md §4.5). Only inbound connections are
    /// subject to the tie-break check: outbound dials already only happen
    /// when our id is smaller (see `Command::SubmitPeers`).
    async fn handle_connected(&mut self, conn: Connection, origin: Origin) {
        let peer_id = conn.peer_id();
        if origin == Origin::Inbound && !(peer_id < self.our_id) {
            log::debug!(
                "rejecting inbound handshake from {}: peer should have accepted, not dialed",
                short_hex(&peer_id)
            );
            return;
        }
        if self.peers.contains_key(&peer_id) {
            log::debug!("dropping duplicate connection to {}", short_hex(&peer_id));
            return;
        }
        self.register(conn).await;
    }

    async fn register(&mut self, conn: Connection) {
        let peer_id = conn.peer_id();
        let addr = conn.peer_addr();
        let (mut reader, mut writer) = conn.split();

        if let Err(e) = writer.send(Message::Bitfield(self.owned_bitfield())).await {
            log::warn!(
                "failed to send initial bitfield to {}: {e}",
                short_hex(&peer_id)
            );
            return;
        }

        let bitfield = Bitfield::repeat(false, self.piece_table.len());
        self.peers.insert(
            peer_id,
            PeerRecord {
                addr,
                bitfield,
                writer,
            },
        );
        log::info!("registered peer {} at {addr}", short_hex(&peer_id));

        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(msg)) => {
                        if tx.send(ActorMsg::PeerMessage(peer_id, msg)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(ActorMsg::PeerClosed(peer_id));
                        break;
                    }
                    Err(e) => {
                        log::warn!("connection to {} failed: {e}", short_hex(&peer_id));
                        let _ = tx.send(ActorMsg::PeerClosed(peer_id));
                        break;
                    }
                }
            }
        });
    }

    /// Removes `peer_id` from the peer table and releases whatever piece it
    /// was charged with back to `Free`. Returns whether a peer was actually
    /// removed (it may already be gone, e.g. if a send failure and the
    /// reader loop's closure are both being processed for the same peer).
    fn disconnect_peer(&mut self, peer_id: &PeerId) -> bool {
        if self.peers.remove(peer_id).is_some() {
            self.piece_table.release_peer(peer_id);
            true
        } else {
            false
        }
    }

    fn owned_bitfield(&self) -> Bitfield {
        let mut bits = Bitfield::repeat(false, self.piece_table.len());
        for (i, saved) in self.piece_table.saved_bitmap().into_iter().enumerate() {
            bits.set(i, saved);
        }
        bits
    }

    async fn broadcast_bitfield(&mut self) {
        let bits = self.owned_bitfield();
        for (peer_id, rec) in self.peers.iter_mut() {
            if let Err(e) = rec.writer.send(Message::Bitfield(bits.clone())).await {
                log::warn!("failed to broadcast bitfield to {}: {e}", short_hex(peer_id));
            }
        }
    }

    async fn on_broadcast_tick(&mut self) {
        if self.listener.is_none() {
            return;
        }
        self.broadcast_bitfield().await;
    }

    async fn on_scheduler_tick(&mut self) {
        if !self.downloading || self.piece_table.is_complete() {
            return;
        }
        loop {
            let mut free = self.piece_table.free_indices();
            free.shuffle(&mut rand::thread_rng());

            let mut dispatch = None;
            'search: for piece_index in free {
                for (&peer_id, rec) in self.peers.iter() {
                    if self.piece_table.peer_is_busy(&peer_id) {
                        continue;
                    }
                    if piece_index < rec.bitfield.len() && rec.bitfield[piece_index] {
                        dispatch = Some((piece_index, peer_id));
                        break 'search;
                    }
                }
            }

            match dispatch {
                Some((piece_index, peer_id)) => {
                    self.piece_table
                        .begin(piece_index, peer_id)
                        .expect("checked free and idle just above");
                    self.spawn_work(piece_index, peer_id).await;
                }
                None => break,
            }
        }
    }

    async fn spawn_work(&mut self, piece_index: PieceIndex, peer_id: PeerId) {
        let block_length = match self.descriptor.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => {
                let _ = self.piece_table.release(piece_index);
                return;
            }
        };

        let sent = match self.peers.get_mut(&peer_id) {
            Some(rec) => rec
                .writer
                .send(Message::Request {
                    piece_index,
                    inner_offset: 0,
                    block_length,
                })
                .await,
            None => Err(Error::ConnectionClosed),
        };
        if let Err(e) = sent {
            log::warn!(
                "failed to request piece {piece_index} from {}, dropping peer: {e}",
                short_hex(&peer_id)
            );
            // a broken writer never un-breaks: if we only released the
            // piece and left the peer idle, the next tick would immediately
            // re-dispatch the same (piece, peer) pair to the same dead
            // socket and spin forever without ever reaching the `select!`
            // arm that would process this peer's queued `PeerClosed`.
            self.disconnect_peer(&peer_id);
            return;
        }

        let tx = self.tx.clone();
        let timeout = self.conf.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(ActorMsg::WorkTimeout(peer_id, piece_index));
        });
    }

    async fn handle_peer_message(&mut self, peer_id: PeerId, msg: Message) {
        if !self.peers.contains_key(&peer_id) {
            return;
        }
        match msg {
            Message::Bitfield(bits) => {
                if let Some(rec) = self.peers.get_mut(&peer_id) {
                    rec.bitfield = bits;
                }
            }
            Message::Request {
                piece_index,
                inner_offset,
                block_length,
            } => {
                self.handle_request(peer_id, piece_index, inner_offset, block_length)
                    .await;
            }
            Message::Piece {
                piece_index,
                inner_offset,
                data,
                ..
            } => {
                self.handle_piece(peer_id, piece_index, inner_offset, data)
                    .await;
            }
        }
    }

    async fn handle_request(
        &mut self,
        peer_id: PeerId,
        piece_index: PieceIndex,
        inner_offset: u32,
        block_length: u32,
    ) {
        if !self.sharing_enabled {
            return;
        }
        let data = match self.file.read(piece_index, inner_offset, block_length).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!(
                    "failed to read requested range for {}: {e}",
                    short_hex(&peer_id)
                );
                return;
            }
        };
        self.stats.bytes_up += data.len() as u64;
        if let Some(rec) = self.peers.get_mut(&peer_id) {
            let msg = Message::Piece {
                piece_index,
                inner_offset,
                block_length,
                data,
            };
            if let Err(e) = rec.writer.send(msg).await {
                log::warn!("failed to send piece to {}: {e}", short_hex(&peer_id));
            }
        }
    }

    async fn handle_piece(
        &mut self,
        peer_id: PeerId,
        piece_index: PieceIndex,
        inner_offset: u32,
        data: Vec<u8>,
    ) {
        if self.piece_table.charge_of(piece_index) != Some(peer_id) {
            return;
        }
        if self.piece_table.mark_received(piece_index).is_err() {
            return;
        }

        let expected = match self.descriptor.pieces.get(piece_index) {
            Some(piece) => piece.sha256.clone(),
            None => {
                let _ = self.piece_table.release(piece_index);
                return;
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(&expected) {
            log::warn!(
                "piece {piece_index} from {} failed hash verification",
                short_hex(&peer_id)
            );
            let _ = self.piece_table.release(piece_index);
            return;
        }

        if let Err(e) = self.file.write(piece_index, inner_offset, &data).await {
            log::warn!("failed to write piece {piece_index}: {e}");
            let _ = self.piece_table.release(piece_index);
            return;
        }

        self.stats.bytes_down += data.len() as u64;
        let _ = self.piece_table.mark_saved(piece_index);

        if let Err(e) = self.resume.store(&self.piece_table.saved_bitmap()).await {
            log::warn!("failed to persist resume state: {e}");
        }

        self.broadcast_bitfield().await;

        if self.piece_table.is_complete() {
            self.complete_download().await;
        }
    }

    async fn complete_download(&mut self) {
        if let Err(e) = self.file.commit().await {
            log::warn!("failed to commit completed download: {e}");
            return;
        }
        if let Err(e) = self.resume.remove().await {
            log::warn!("failed to remove resume state after completion: {e}");
        }
        self.downloading = false;
        log::info!("download of {} complete", self.descriptor.name);
    }
}

async fn accept_if_listening(
    listener: &mut Option<TcpListener>,
) -> Option<std::io::Result<(TcpStream, SocketAddr)>> {
    match listener {
        Some(l) => Some(l.accept().await),
        None => future::pending().await,
    }
}
