//! The per peer protocol state machine.
//!
//! A session owns its socket and request pipeline and talks to the rest of
//! the engine through two channels: commands arrive from the torrent control
//! loop and observations flow back to it. Block bookkeeping lives in the
//! shared [`PieceMap`](crate::piece_map::PieceMap); the session holds a non
//! owning handle and delivers blocks carrying its own address, so the map
//! never needs to know about session internals.

pub(crate) mod codec;
pub(crate) mod crypto;
pub(crate) mod extension;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    select,
    stream::{Fuse, SplitSink},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::{EncryptionPolicy, TorrentConf},
    counter::{RateEstimator, ThruputCounters},
    error::{Error, ProtocolError, Result},
    piece_map::DeliverOutcome,
    torrent::{TorrentContext, TorrentMsg, Work},
    Bitfield, BlockInfo, PieceIndex, BLOCK_LEN,
};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use crypto::EncryptedStream;
use extension::{
    ExtendedHandshake, PexMessage, UtMetadataMsg, EXTENDED_HANDSHAKE_ID,
    LOCAL_UT_METADATA_ID, LOCAL_UT_PEX_ID,
};

/// The `reqq` value we advertise: how many remote requests we queue before
/// dropping.
pub(crate) const MAX_PEER_REQUEST_QUEUE_LEN: usize = 250;

/// How many invalid or unsolicited blocks and bogus requests we tolerate
/// from a peer before treating the session as hostile.
const MAX_PEER_ERROR_COUNT: u32 = 8;

/// The outstanding request pipeline is adapted to the link's bandwidth-delay
/// product within these bounds.
const MIN_REQUEST_QUEUE_LEN: usize = 4;
const MAX_REQUEST_QUEUE_LEN: usize = 128;
const DEFAULT_REQUEST_QUEUE_LEN: usize = 16;

/// All connections are driven through the obfuscation wrapper; a plaintext
/// connection is simply the wrapper in passthrough mode.
pub(crate) type Socket = EncryptedStream<TcpStream>;

/// The channel on which the torrent control loop commands a session.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// Announce a newly verified piece to this peer, unless it has it.
    Have(PieceIndex),
    /// The choker granted the remote permission to request.
    Unchoke,
    /// The choker revoked the remote's permission to request.
    Choke,
    /// The torrent's metadata was fetched and the download is live: register
    /// availability and start requesting.
    WorkReady(Arc<Work>),
    /// Request a metadata piece via the remote's `ut_metadata` extension.
    RequestMetadata(u32),
    /// Gossip swarm membership changes to this peer, subject to the per peer
    /// PEX interval.
    SendPex {
        added: Vec<SocketAddr>,
        dropped: Vec<SocketAddr>,
    },
    /// Another session received this block first; withdraw our request.
    Cancel(BlockInfo),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// Directly after the handshake the peer may send its bitfield, exactly
    /// once. The state is left on the first message of any kind.
    AvailabilityExchange,
    /// The normal state of a session. If the torrent's metadata is not known
    /// yet, no blocks are exchanged in this state but the metadata extension
    /// is live.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The mutable protocol status of a session.
#[derive(Debug)]
struct Status {
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// Whether the remote delivered at least one block this session. CANCEL
    /// messages are only worth sending to such peers.
    peer_served_block: bool,
    /// The request pipeline length, adapted to the bandwidth-delay product
    /// so the link stays saturated: rate * rtt / block length, clamped.
    target_request_queue_len: usize,
    /// Smoothed request round trip time.
    avg_request_rtt: Option<Duration>,
    /// Smoothed download rate, sampled on the session tick.
    download_rate: RateEstimator,
    /// Protocol anomalies tolerated so far.
    error_count: u32,
    last_incoming: Instant,
    last_outgoing: Instant,
    last_pex: Option<Instant>,
}

impl Default for Status {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            peer_served_block: false,
            target_request_queue_len: DEFAULT_REQUEST_QUEUE_LEN,
            avg_request_rtt: None,
            download_rate: RateEstimator::default(),
            error_count: 0,
            last_incoming: now,
            last_outgoing: now,
            last_pex: None,
        }
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    id: crate::PeerId,
    /// All pieces the peer has. Until the torrent's metadata is known the
    /// field is kept at the raw wire length and only normalized to the piece
    /// count when the download goes live.
    pieces: Bitfield,
    /// Whether a bitfield message was already received.
    bitfield_received: bool,
    /// Whether both sides advertised the extension protocol.
    extended: bool,
    /// The sub-ids from the remote's extended handshake `m` map.
    ut_metadata_id: Option<u8>,
    ut_pex_id: Option<u8>,
}

/// A block request we sent and haven't been served yet.
#[derive(Clone, Copy, Debug)]
struct OutgoingRequest {
    block: BlockInfo,
    sent_at: Instant,
}

pub(crate) struct PeerSession {
    /// Shared information of the torrent and the channel back to its control
    /// loop.
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    /// The download state, present once the torrent's metadata is known.
    work: Option<Arc<Work>>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// Byte counters shared with the torrent's choker.
    counters: Arc<ThruputCounters>,
    status: Status,
    peer: Option<PeerInfo>,
    /// Our pending block requests, in the order they were sent.
    outgoing_requests: Vec<OutgoingRequest>,
}

type MessageSink = SplitSink<Framed<Socket, PeerCodec>, Message>;

impl PeerSession {
    /// Creates a new session with the peer at the given address. The
    /// connection itself is established by [`Self::start_outbound`] or
    /// [`Self::start_inbound`].
    pub fn new(
        ctx: Arc<TorrentContext>,
        conf: TorrentConf,
        work: Option<Arc<Work>>,
        addr: SocketAddr,
        counters: Arc<ThruputCounters>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                conf,
                work,
                addr,
                cmd_port: cmd_port.fuse(),
                counters,
                status: Status::default(),
                peer: None,
                outgoing_requests: Vec::new(),
            },
            cmd_chan,
        )
    }

    /// Connects to the peer, performs the handshake (plaintext first with an
    /// encrypted retry, per the engine's policy) and runs the session until
    /// the connection is closed or an error occurs.
    pub async fn start_outbound(
        &mut self,
        encryption: EncryptionPolicy,
    ) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;

        let handshake_timeout = self.conf.handshake_timeout;
        let socket = time::timeout(
            handshake_timeout,
            self.establish_outbound(encryption),
        )
        .await??;

        self.run(socket).await
    }

    /// Runs the session over an incoming connection whose handshake the
    /// engine already read while routing it to our torrent.
    pub async fn start_inbound(
        &mut self,
        socket: Framed<Socket, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        log::info!("Peer {} connected to us", self.addr);
        self.status.state = State::Handshaking;
        let mut socket = socket;

        self.check_handshake(&peer_handshake)?;

        // the remote spoke first, now introduce ourselves
        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        socket.send(handshake).await?;

        self.init_peer(&peer_handshake);
        self.run(socket).await
    }

    async fn establish_outbound(
        &mut self,
        encryption: EncryptionPolicy,
    ) -> Result<Framed<Socket, HandshakeCodec>> {
        match encryption {
            EncryptionPolicy::Always => self.connect_encrypted().await,
            EncryptionPolicy::Never => self.connect_plaintext().await,
            EncryptionPolicy::Fallback => {
                match self.connect_plaintext().await {
                    Ok(socket) => Ok(socket),
                    // a dropped connection during the plaintext handshake is
                    // the classic symptom of a peer requiring obfuscation
                    Err(Error::Io(_)) => {
                        log::info!(
                            "Peer {} dropped plaintext handshake, retrying \
                             encrypted",
                            self.addr
                        );
                        self.connect_encrypted().await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Connects and exchanges the handshake in plaintext. Returns the framed
    /// socket with the peer's handshake already consumed and validated.
    async fn connect_plaintext(
        &mut self,
    ) -> Result<Framed<Socket, HandshakeCodec>> {
        let stream = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);
        self.status.state = State::Handshaking;

        let mut socket =
            Framed::new(EncryptedStream::passthrough(stream), HandshakeCodec);

        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        log::debug!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => {
                // connection dropped before a reply; the caller may retry
                // with the encrypted handshake
                return Err(Error::Io(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ));
            }
        };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);

        self.check_handshake(&peer_handshake)?;
        self.init_peer(&peer_handshake);
        Ok(socket)
    }

    /// Connects with the MSE handshake, carrying our BitTorrent handshake as
    /// its initial payload.
    async fn connect_encrypted(
        &mut self,
    ) -> Result<Framed<Socket, HandshakeCodec>> {
        let stream = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {} (encrypted)", self.addr);
        self.status.state = State::Handshaking;

        let handshake =
            Handshake::new(self.ctx.info_hash, self.ctx.client_id);
        let mut ia = bytes::BytesMut::new();
        use tokio_util::codec::Encoder;
        HandshakeCodec.encode(handshake, &mut ia)?;

        let stream =
            crypto::initiate(stream, self.ctx.info_hash, &ia).await?;
        let mut socket = Framed::new(stream, HandshakeCodec);

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => {
                return Err(Error::Io(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ))
            }
        };
        self.check_handshake(&peer_handshake)?;
        self.init_peer(&peer_handshake);
        Ok(socket)
    }

    fn check_handshake(&self, peer_handshake: &Handshake) -> Result<()> {
        if peer_handshake.info_hash != self.ctx.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(ProtocolError::InvalidInfoHash.into());
        }
        if peer_handshake.peer_id == self.ctx.client_id {
            log::info!("Peer {} is ourselves", self.addr);
            return Err(ProtocolError::SelfConnection.into());
        }
        Ok(())
    }

    fn init_peer(&mut self, peer_handshake: &Handshake) {
        let piece_count = self
            .work
            .as_ref()
            .map(|work| work.storage.piece_count)
            .unwrap_or(0);
        self.peer = Some(PeerInfo {
            id: peer_handshake.peer_id,
            pieces: Bitfield::repeat(false, piece_count),
            bitfield_received: false,
            extended: peer_handshake.supports_extended(),
            ut_metadata_id: None,
            ut_pex_id: None,
        });
    }

    /// Runs the session after the handshakes are exchanged.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<Socket, HandshakeCodec>,
    ) -> Result<()> {
        // Now that we have the handshake, we need to switch to the peer
        // message codec and save the socket in self (note that we need to
        // keep the buffer from the original codec as it may contain bytes
        // of any potential message the peer may have sent after the
        // handshake).
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        // reuse buffers of previous codec
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        // our first messages: the extended handshake if both sides speak it,
        // and our bitfield if we have any pieces
        let peer_extended =
            self.peer.as_ref().map(|p| p.extended).unwrap_or_default();
        if peer_extended {
            let metadata_size = self
                .work
                .as_ref()
                .map(|work| work.info_bytes.len() as i64);
            let extended = ExtendedHandshake::new_local(
                self.ctx.listen_port,
                Some(self.addr.ip()),
                metadata_size,
            );
            self.send_msg(
                &mut sink,
                Message::Extended {
                    id: EXTENDED_HANDSHAKE_ID,
                    payload: extended.to_bytes()?,
                },
            )
            .await?;
        }
        if let Some(work) = &self.work {
            let own = work.piece_map.read().await.own_bitfield().clone();
            if own.count_ones() > 0 {
                self.send_msg(&mut sink, Message::Bitfield(own)).await?;
            }
        }

        self.ctx.tx.send(TorrentMsg::PeerConnected {
            addr: self.addr,
            id: self.peer.as_ref().map(|p| p.id).unwrap_or_default(),
        })?;

        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.status.last_incoming = Instant::now();

                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                            self.status.state = State::Connected;
                            continue;
                        }
                        // the bitfield window closes on the first message of
                        // any other kind
                        self.status.state = State::Connected;
                    }
                    self.handle_msg(&mut sink, msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    if self.handle_cmd(&mut sink, cmd).await? {
                        log::info!(
                            "Shutting down peer {} session",
                            self.addr
                        );
                        // a best effort courtesy to the remote
                        let _ = sink.send(Message::NotInterested).await;
                        break;
                    }
                }
                _ = tick.select_next_some() => {
                    self.on_tick(&mut sink).await?;
                }
            }
        }

        Ok(())
    }

    /// Releases the session's shared resources and reports the closure to
    /// the torrent. Called by the spawner after `start_*` returns.
    pub async fn shutdown(self, error: Option<Error>) {
        if let (Some(work), Some(peer)) = (&self.work, &self.peer) {
            let mut piece_map = work.piece_map.write().await;
            piece_map.peer_gone(&peer.pieces, self.addr);
        }
        let _ = self.ctx.tx.send(TorrentMsg::SessionClosed {
            addr: self.addr,
            error,
            served_block: self.status.peer_served_block,
        });
    }

    async fn send_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        self.status.last_outgoing = Instant::now();
        sink.send(msg).await
    }

    /// Handles the bitfield message expected in the `AvailabilityExchange`
    /// state.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut MessageSink,
        bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::debug!("Handling peer {} bitfield message", self.addr);

        let peer = self.peer.as_mut().ok_or(Error::ChannelClosed)?;
        if peer.bitfield_received {
            return Err(ProtocolError::InvalidBitfield.into());
        }
        peer.bitfield_received = true;

        if let Some(work) = &self.work {
            let piece_count = work.storage.piece_count;
            peer.pieces =
                validate_bitfield(bitfield, piece_count)?;
            work.piece_map
                .write()
                .await
                .register_availability(&peer.pieces);
            self.update_interest(sink).await?;
            self.make_requests(sink).await?;
        } else {
            // metadata not known yet: keep the raw bits, they are validated
            // and registered when the download goes live
            peer.pieces = bitfield;
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: Message,
    ) -> Result<()> {
        log::debug!(
            "Received message {:?} from peer {}",
            msg.id(),
            self.addr
        );
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(ProtocolError::InvalidBitfield.into());
            }
            Message::KeepAlive => {
                log::debug!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.abandon_requests(sink, true).await?;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks, start the
                    // download pipeline if we're interested
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    self.ctx.tx.send(TorrentMsg::PeerInterested {
                        addr: self.addr,
                        interested: true,
                    })?;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    self.ctx.tx.send(TorrentMsg::PeerInterested {
                        addr: self.addr,
                        interested: false,
                    })?;
                }
            }
            Message::Have(piece_index) => {
                self.handle_have_msg(sink, piece_index as PieceIndex)
                    .await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(sink, block).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block = BlockInfo {
                    piece_index: piece_index as PieceIndex,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(block) => {
                // requests are served inline as they arrive, so there is no
                // queue to cancel from
                log::debug!(
                    "Peer {} cancelled block {:?} (noop)",
                    self.addr,
                    block
                );
            }
            Message::Port(port) => {
                // we don't run a DHT node, so the port is only noted
                log::debug!("Peer {} DHT port is {}", self.addr, port);
            }
            Message::Extended { id, payload } => {
                self.handle_extended_msg(sink, id, payload).await?;
            }
        }

        Ok(())
    }

    async fn handle_have_msg(
        &mut self,
        sink: &mut MessageSink,
        piece_index: PieceIndex,
    ) -> Result<()> {
        let peer = self.peer.as_mut().ok_or(Error::ChannelClosed)?;
        match &self.work {
            Some(work) => {
                if piece_index >= work.storage.piece_count {
                    return Err(ProtocolError::InvalidBlockInfo.into());
                }
                // a repeated announcement of the same piece must not skew
                // the availability counts
                if !peer.pieces[piece_index] {
                    peer.pieces.set(piece_index, true);
                    work.piece_map
                        .write()
                        .await
                        .have_received(piece_index);
                    self.update_interest(sink).await?;
                    if !self.status.is_choked {
                        self.make_requests(sink).await?;
                    }
                }
            }
            None => {
                // piece count unknown: grow the raw bitfield as needed, with
                // a sanity cap so a hostile index can't balloon memory
                if piece_index >= (1 << 24) {
                    return Err(ProtocolError::InvalidBlockInfo.into());
                }
                if peer.pieces.len() <= piece_index {
                    peer.pieces.resize(piece_index + 1, false);
                }
                peer.pieces.set(piece_index, true);
            }
        }
        Ok(())
    }

    /// Serves a block request from a remote peer, the seeding path.
    async fn handle_request_msg(
        &mut self,
        sink: &mut MessageSink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            // requests sent while choked are a protocol smell but some
            // clients race the choke message, so they are dropped silently
            log::debug!(
                "Peer {} requested {:?} while choked",
                self.addr,
                block
            );
            return Ok(());
        }
        let work = match &self.work {
            Some(work) => Arc::clone(work),
            None => return self.peer_error("request without metadata"),
        };
        // only verified pieces are served
        let valid = block.piece_index < work.storage.piece_count
            && block.len > 0
            && block.len <= BLOCK_LEN
            && block
                .offset
                .checked_add(block.len)
                .map(|end| {
                    end <= work.storage.piece_len(block.piece_index).unwrap_or(0)
                })
                .unwrap_or(false)
            && work.piece_map.read().await.own_bitfield()[block.piece_index];
        if !valid {
            log::warn!(
                "Peer {} requested invalid block {:?}",
                self.addr,
                block
            );
            return self.peer_error("invalid block request");
        }

        let data = work.disk.read_block(self.ctx.id, block).await?;
        self.counters.up.add(data.len() as u64);
        self.send_msg(
            &mut *sink,
            Message::Block {
                piece_index: block.piece_index as u32,
                offset: block.offset,
                data,
            },
        )
        .await?;
        Ok(())
    }

    /// Verifies block validity, registers the download with the piece map
    /// and forwards the payload to the disk task.
    async fn handle_block_msg(
        &mut self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::debug!("Received block from peer {}: {:?}", self.addr, block);
        let work = match &self.work {
            Some(work) => Arc::clone(work),
            None => return self.peer_error("block without metadata"),
        };

        // find the block in the list of pending requests
        let solicited = match self
            .outgoing_requests
            .iter()
            .position(|r| r.block == block)
        {
            Some(pos) => {
                let request = self.outgoing_requests.remove(pos);
                self.record_request_rtt(request.sent_at.elapsed());
                true
            }
            None => {
                // unsolicited blocks are still offered to the piece map (the
                // tolerant policy: in endgame, a cancelled duplicate may
                // arrive after we dropped the request), but they count
                // against the peer's error budget
                log::warn!(
                    "Peer {} sent unsolicited block: {:?}",
                    self.addr,
                    block,
                );
                self.peer_error("unsolicited block")?;
                false
            }
        };

        let outcome =
            work.piece_map.write().await.deliver(block, self.addr);
        match outcome {
            DeliverOutcome::Accepted {
                piece_complete,
                cancel_peers,
            } => {
                self.status.peer_served_block = true;
                self.counters.down.add(block.len as u64);
                if !cancel_peers.is_empty() {
                    self.ctx.tx.send(TorrentMsg::CancelDuplicates {
                        block,
                        peers: cancel_peers,
                    })?;
                }
                // the disk task buffers the block and, on the last one of
                // the piece, verifies and commits it
                work.disk.write_block(self.ctx.id, block, data)?;
                if piece_complete {
                    log::info!(
                        "Piece {} assembled via peer {}",
                        block.piece_index,
                        self.addr
                    );
                }
            }
            DeliverOutcome::Duplicate => {
                log::debug!(
                    "Peer {} sent duplicate block {:?}",
                    self.addr,
                    block
                );
            }
            DeliverOutcome::Rejected => {
                if solicited {
                    // a solicited block that the map rejects means our own
                    // bookkeeping and the wire disagree
                    return Err(ProtocolError::InvalidBlockInfo.into());
                }
                self.peer_error("rejected block")?;
            }
        }

        Ok(())
    }

    async fn handle_extended_msg(
        &mut self,
        sink: &mut MessageSink,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        match id {
            EXTENDED_HANDSHAKE_ID => {
                let handshake = ExtendedHandshake::from_bytes(&payload)?;
                log::info!(
                    "Peer {} extended handshake, client {:?}",
                    self.addr,
                    handshake.v.as_deref().unwrap_or("unknown")
                );
                let peer = self.peer.as_mut().ok_or(Error::ChannelClosed)?;
                peer.ut_metadata_id = handshake.ut_metadata_id();
                peer.ut_pex_id = handshake.ut_pex_id();
                if let (Some(_), Some(metadata_size)) =
                    (peer.ut_metadata_id, handshake.metadata_size)
                {
                    self.ctx.tx.send(TorrentMsg::MetadataPeer {
                        addr: self.addr,
                        metadata_size,
                    })?;
                }
            }
            LOCAL_UT_METADATA_ID => {
                let msg = UtMetadataMsg::from_bytes(&payload)?;
                self.handle_ut_metadata_msg(sink, msg).await?;
            }
            LOCAL_UT_PEX_ID => {
                let msg = PexMessage::from_bytes(&payload)?;
                let added = msg.added_peers();
                if !added.is_empty() {
                    log::debug!(
                        "Peer {} sent {} PEX peers",
                        self.addr,
                        added.len()
                    );
                    self.ctx.tx.send(TorrentMsg::PexPeers {
                        addr: self.addr,
                        peers: added,
                    })?;
                }
            }
            id => {
                // an extension we didn't advertise; drop silently
                log::debug!(
                    "Peer {} sent message for unknown extension {}",
                    self.addr,
                    id
                );
            }
        }
        Ok(())
    }

    async fn handle_ut_metadata_msg(
        &mut self,
        sink: &mut MessageSink,
        msg: UtMetadataMsg,
    ) -> Result<()> {
        match msg {
            UtMetadataMsg::Request { piece } => {
                let peer_id = self
                    .peer
                    .as_ref()
                    .and_then(|p| p.ut_metadata_id);
                let reply = match (&self.work, peer_id) {
                    (Some(work), Some(remote_id)) => {
                        let total = work.info_bytes.len();
                        let start = piece as usize
                            * extension::METADATA_PIECE_LEN;
                        if start < total {
                            let end = total
                                .min(start + extension::METADATA_PIECE_LEN);
                            Some((
                                remote_id,
                                UtMetadataMsg::Data {
                                    piece,
                                    total_size: total as i64,
                                    payload: work.info_bytes[start..end]
                                        .to_vec(),
                                },
                            ))
                        } else {
                            Some((remote_id, UtMetadataMsg::Reject { piece }))
                        }
                    }
                    (None, Some(remote_id)) => {
                        Some((remote_id, UtMetadataMsg::Reject { piece }))
                    }
                    _ => None,
                };
                if let Some((remote_id, reply)) = reply {
                    self.send_msg(
                        sink,
                        Message::Extended {
                            id: remote_id,
                            payload: reply.to_bytes()?,
                        },
                    )
                    .await?;
                }
            }
            UtMetadataMsg::Data {
                piece,
                total_size,
                payload,
            } => {
                self.ctx.tx.send(TorrentMsg::MetadataData {
                    addr: self.addr,
                    piece,
                    total_size,
                    data: payload,
                })?;
            }
            UtMetadataMsg::Reject { piece } => {
                self.ctx.tx.send(TorrentMsg::MetadataReject {
                    addr: self.addr,
                    piece,
                })?;
            }
        }
        Ok(())
    }

    async fn handle_cmd(
        &mut self,
        sink: &mut MessageSink,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Shutdown => return Ok(true),
            Command::Have(piece_index) => {
                let has = self
                    .peer
                    .as_ref()
                    .map(|p| {
                        p.pieces.get(piece_index).copied().unwrap_or(false)
                    })
                    .unwrap_or(false);
                // it only makes sense to announce to peers that lack the
                // piece
                if !has {
                    self.send_msg(sink, Message::Have(piece_index as u32))
                        .await?;
                }
                // completing pieces may end our interest in this peer
                self.update_interest(sink).await?;
            }
            Command::Choke => {
                if !self.status.is_peer_choked {
                    self.status.is_peer_choked = true;
                    self.send_msg(sink, Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    self.status.is_peer_choked = false;
                    self.send_msg(sink, Message::Unchoke).await?;
                }
            }
            Command::WorkReady(work) => {
                self.on_work_ready(sink, work).await?;
            }
            Command::RequestMetadata(piece) => {
                if let Some(remote_id) =
                    self.peer.as_ref().and_then(|p| p.ut_metadata_id)
                {
                    self.send_msg(
                        sink,
                        Message::Extended {
                            id: remote_id,
                            payload: UtMetadataMsg::Request { piece }
                                .to_bytes()?,
                        },
                    )
                    .await?;
                }
            }
            Command::SendPex { added, dropped } => {
                self.maybe_send_pex(sink, added, dropped).await?;
            }
            Command::Cancel(block) => {
                if let Some(pos) = self
                    .outgoing_requests
                    .iter()
                    .position(|r| r.block == block)
                {
                    self.outgoing_requests.remove(pos);
                    // only peers that actually served us a block warrant the
                    // cancel chatter
                    if self.status.peer_served_block {
                        self.send_msg(sink, Message::Cancel(block)).await?;
                    }
                }
            }
        }
        Ok(false)
    }

    /// Transitions a metadata-phase session into a downloading one.
    async fn on_work_ready(
        &mut self,
        sink: &mut MessageSink,
        work: Arc<Work>,
    ) -> Result<()> {
        log::info!("Peer {} session entering download", self.addr);
        let piece_count = work.storage.piece_count;
        self.work = Some(Arc::clone(&work));

        if let Some(peer) = self.peer.as_mut() {
            let raw = std::mem::take(&mut peer.pieces);
            // the raw bits collected before the piece count was known get
            // the same validation a regular bitfield does
            peer.pieces = if peer.bitfield_received {
                validate_bitfield(raw, piece_count)?
            } else {
                let mut bits = raw;
                if bits.len() > piece_count {
                    return Err(ProtocolError::InvalidBitfield.into());
                }
                bits.resize(piece_count, false);
                bits
            };
            work.piece_map
                .write()
                .await
                .register_availability(&peer.pieces);
        }

        self.update_interest(sink).await?;
        self.make_requests(sink).await?;
        Ok(())
    }

    async fn maybe_send_pex(
        &mut self,
        sink: &mut MessageSink,
        added: Vec<SocketAddr>,
        dropped: Vec<SocketAddr>,
    ) -> Result<()> {
        let remote_id = match self.peer.as_ref().and_then(|p| p.ut_pex_id) {
            Some(id) => id,
            None => return Ok(()),
        };
        // BEP 11: no more than one PEX message per minute per peer
        if let Some(last) = self.status.last_pex {
            if last.elapsed() < self.conf.pex_interval {
                return Ok(());
            }
        }
        // our own view of the peer must not be gossiped back to it
        let added: Vec<_> =
            added.into_iter().filter(|a| *a != self.addr).collect();
        let msg = PexMessage::new(&added, &dropped);
        if msg.is_empty() {
            return Ok(());
        }
        self.status.last_pex = Some(Instant::now());
        self.send_msg(
            sink,
            Message::Extended {
                id: remote_id,
                payload: msg.to_bytes()?,
            },
        )
        .await?;
        Ok(())
    }

    /// The periodic bookkeeping of a session: timeouts, keep-alives and rate
    /// sampling.
    async fn on_tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        if now.duration_since(self.status.last_incoming)
            >= self.conf.idle_timeout
        {
            log::info!("Peer {} idle timeout", self.addr);
            return Err(Error::Timeout);
        }

        // request timeouts: release the blocks for other peers and retry
        let request_timeout = self.conf.request_timeout;
        let timed_out: Vec<_> = self
            .outgoing_requests
            .iter()
            .filter(|r| now.duration_since(r.sent_at) >= request_timeout)
            .map(|r| r.block)
            .collect();
        if !timed_out.is_empty() {
            log::warn!(
                "Peer {} timed out {} requests",
                self.addr,
                timed_out.len()
            );
            self.outgoing_requests
                .retain(|r| now.duration_since(r.sent_at) < request_timeout);
            if let Some(work) = &self.work {
                work.piece_map
                    .write()
                    .await
                    .release_requests(self.addr, &timed_out);
            }
            self.make_requests(sink).await?;
        }

        self.status
            .download_rate
            .update(self.counters.down.total(), Duration::from_secs(1));
        self.adapt_request_queue_len();

        if now.duration_since(self.status.last_outgoing)
            >= self.conf.keep_alive_interval
        {
            self.send_msg(sink, Message::KeepAlive).await?;
        }

        Ok(())
    }

    /// Drops all outstanding requests, optionally telling the peer, and
    /// releases the blocks in the piece map so other sessions can pick them
    /// up.
    async fn abandon_requests(
        &mut self,
        sink: &mut MessageSink,
        notify_peer: bool,
    ) -> Result<()> {
        if self.outgoing_requests.is_empty() {
            return Ok(());
        }
        let blocks: Vec<_> =
            self.outgoing_requests.drain(..).map(|r| r.block).collect();
        if let Some(work) = &self.work {
            work.piece_map
                .write()
                .await
                .release_requests(self.addr, &blocks);
        }
        // cancels are only worth the bytes for a peer that has produced
        // a block before
        if notify_peer && self.status.peer_served_block {
            for block in blocks {
                self.send_msg(&mut *sink, Message::Cancel(block)).await?;
            }
        }
        Ok(())
    }

    /// Re-evaluates our interest in the peer and announces flips.
    async fn update_interest(
        &mut self,
        sink: &mut MessageSink,
    ) -> Result<()> {
        let (work, peer) = match (&self.work, &self.peer) {
            (Some(work), Some(peer)) => (work, peer),
            _ => return Ok(()),
        };
        let interested =
            work.piece_map.read().await.is_interested_in(&peer.pieces);
        if interested != self.status.is_interested {
            self.status.is_interested = interested;
            let msg = if interested {
                log::info!("Interested in peer {}", self.addr);
                Message::Interested
            } else {
                log::info!("No longer interested in peer {}", self.addr);
                Message::NotInterested
            };
            self.send_msg(sink, msg).await?;
        }
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.status.is_choked || !self.status.is_interested {
            return Ok(());
        }
        let (work, peer) = match (&self.work, &self.peer) {
            (Some(work), Some(peer)) => (Arc::clone(work), peer),
            _ => return Ok(()),
        };

        let mut blocks = Vec::new();
        {
            let now = Instant::now();
            let mut piece_map = work.piece_map.write().await;
            while self.outgoing_requests.len() + blocks.len()
                < self.status.target_request_queue_len
            {
                match piece_map.next_request(&peer.pieces, self.addr, now) {
                    Some(block) => blocks.push(block),
                    None => break,
                }
            }
        }

        // save current volley of requests, then make the actual requests
        let sent_at = Instant::now();
        self.outgoing_requests.extend(
            blocks
                .iter()
                .map(|block| OutgoingRequest {
                    block: *block,
                    sent_at,
                }),
        );
        for block in blocks {
            log::debug!("Requesting block {:?} from {}", block, self.addr);
            self.send_msg(&mut *sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    fn record_request_rtt(&mut self, rtt: Duration) {
        // a standard smoothed RTT fold, enough for queue sizing
        let avg = match self.status.avg_request_rtt {
            Some(avg) => avg.mul_f64(0.8) + rtt.mul_f64(0.2),
            None => rtt,
        };
        self.status.avg_request_rtt = Some(avg);
    }

    /// Adapts the request pipeline length to the link's bandwidth-delay
    /// product so a fast link isn't starved by a shallow queue.
    fn adapt_request_queue_len(&mut self) {
        let rtt = match self.status.avg_request_rtt {
            Some(rtt) => rtt,
            None => return,
        };
        let rate = self.status.download_rate.rate();
        if rate <= 0.0 {
            return;
        }
        let target =
            (rate * rtt.as_secs_f64() / BLOCK_LEN as f64).ceil() as usize;
        self.status.target_request_queue_len =
            target.clamp(MIN_REQUEST_QUEUE_LEN, MAX_REQUEST_QUEUE_LEN);
    }

    /// Charges one unit against the peer's error budget, failing the session
    /// once it is exhausted.
    fn peer_error(&mut self, what: &str) -> Result<()> {
        self.status.error_count += 1;
        log::warn!(
            "Peer {} anomaly ({}), {}/{}",
            self.addr,
            what,
            self.status.error_count,
            MAX_PEER_ERROR_COUNT
        );
        if self.status.error_count >= MAX_PEER_ERROR_COUNT {
            Err(ProtocolError::InvalidMessage.into())
        } else {
            Ok(())
        }
    }
}

/// Validates a wire bitfield against the torrent's piece count: the raw
/// length must be exactly the piece count rounded up to whole bytes and the
/// padding bits must be zero.
fn validate_bitfield(
    mut bitfield: Bitfield,
    piece_count: usize,
) -> Result<Bitfield> {
    let expected_bytes = (piece_count + 7) / 8;
    if bitfield.len() != expected_bytes * 8 {
        return Err(ProtocolError::InvalidBitfield.into());
    }
    if bitfield.iter().skip(piece_count).any(|bit| *bit) {
        return Err(ProtocolError::InvalidBitfield.into());
    }
    bitfield.resize(piece_count, false);
    Ok(bitfield)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bitfield_resizes_to_piece_count() {
        // 10 pieces come in 2 wire bytes with 6 padding bits
        let bits = Bitfield::from_vec(vec![0b1111_1111, 0b1100_0000]);
        let validated = validate_bitfield(bits, 10).unwrap();
        assert_eq!(validated.len(), 10);
        assert!(validated.all());
    }

    #[test]
    fn test_validate_bitfield_rejects_wrong_length() {
        let bits = Bitfield::from_vec(vec![0xff]);
        assert!(validate_bitfield(bits, 10).is_err());

        let bits = Bitfield::from_vec(vec![0xff, 0xff, 0xff]);
        assert!(validate_bitfield(bits, 10).is_err());
    }

    #[test]
    fn test_validate_bitfield_rejects_set_padding_bits() {
        let bits = Bitfield::from_vec(vec![0b1111_1111, 0b1100_1000]);
        assert!(validate_bitfield(bits, 10).is_err());
    }

    #[test]
    fn test_request_queue_adapts_to_bandwidth_delay_product() {
        let ctx = crate::torrent::TorrentContext::new_for_test();
        let (mut session, _cmd) = PeerSession::new(
            Arc::new(ctx),
            TorrentConf::new("/tmp"),
            None,
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ThruputCounters::default()),
        );

        // 1 MiB/s at 500 ms RTT wants a 32 deep queue
        session.status.avg_request_rtt = Some(Duration::from_millis(500));
        for _ in 0..60 {
            session.counters.down.add(1024 * 1024);
            session.status.download_rate.update(
                session.counters.down.total(),
                Duration::from_secs(1),
            );
        }
        session.adapt_request_queue_len();
        assert_eq!(session.status.target_request_queue_len, 32);

        // an extremely slow link clamps at the minimum
        session.status.download_rate = RateEstimator::default();
        session.status.download_rate.update(100, Duration::from_secs(1));
        session.adapt_request_queue_len();
        assert_eq!(
            session.status.target_request_queue_len,
            MIN_REQUEST_QUEUE_LEN
        );
    }

    #[test]
    fn test_peer_error_budget_exhausts() {
        let ctx = crate::torrent::TorrentContext::new_for_test();
        let (mut session, _cmd) = PeerSession::new(
            Arc::new(ctx),
            TorrentConf::new("/tmp"),
            None,
            "127.0.0.1:1".parse().unwrap(),
            Arc::new(ThruputCounters::default()),
        );
        for _ in 0..MAX_PEER_ERROR_COUNT - 1 {
            assert!(session.peer_error("test").is_ok());
        }
        assert!(session.peer_error("test").is_err());
    }
}
