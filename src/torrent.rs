//! The per torrent control loop.
//!
//! The torrent owns the swarm: it admits candidates, spawns peer sessions,
//! runs the choke rounds, fans out HAVE announcements and PEX deltas,
//! drives the metadata fetch when bootstrapped from a magnet link, applies
//! disk verdicts to the piece map, keeps the announce statistics and
//! persists the resume record.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{select, StreamExt};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time,
};
use tokio_util::codec::Framed;

use crate::{
    choker::{Choker, Decision, RoundPeer},
    conf::{EncryptionPolicy, TorrentConf},
    counter::{RateEstimator, ThruputCounters},
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    engine::Alert,
    error::{Error, Result},
    metadata::{MetadataEvent, MetadataFetcher},
    metainfo::Metainfo,
    peer::{
        self,
        codec::{Handshake, HandshakeCodec},
        PeerSession, Socket,
    },
    piece_map::PieceMap,
    resume::ResumeRecord,
    storage_info::StorageInfo,
    tracker::{Announce, Event as AnnounceEvent, Tracker},
    BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Shared, immutable information about a torrent, handed to every session.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    /// The engine's actual listen port, announced in extended handshakes.
    pub listen_port: Option<u16>,
    /// The channel on which sessions report to the torrent.
    pub tx: UnboundedSender<TorrentMsg>,
}

#[cfg(test)]
impl TorrentContext {
    pub(crate) fn new_for_test() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // keep the channel alive for the lifetime of the test context
        std::mem::forget(rx);
        Self {
            id: 0,
            info_hash: [0; 20],
            client_id: [0; 20],
            listen_port: None,
            tx,
        }
    }
}

/// The download state of a torrent whose metadata is known. Sessions share
/// it; until the metadata arrives (magnet bootstrap) it doesn't exist.
pub(crate) struct Work {
    pub piece_map: Arc<RwLock<PieceMap>>,
    pub storage: StorageInfo,
    pub disk: DiskHandle,
    /// The raw `info` dictionary, served to peers over `ut_metadata`.
    pub info_bytes: Vec<u8>,
}

/// Everything sessions and the engine report to a torrent.
pub(crate) enum TorrentMsg {
    PeerConnected {
        addr: SocketAddr,
        id: PeerId,
    },
    PeerInterested {
        addr: SocketAddr,
        interested: bool,
    },
    /// A peer negotiated `ut_metadata` and discloses the metadata size.
    MetadataPeer {
        addr: SocketAddr,
        metadata_size: i64,
    },
    MetadataData {
        addr: SocketAddr,
        piece: u32,
        total_size: i64,
        data: Vec<u8>,
    },
    MetadataReject {
        addr: SocketAddr,
        piece: u32,
    },
    /// Addresses learned via PEX from the given peer.
    PexPeers {
        addr: SocketAddr,
        peers: Vec<SocketAddr>,
    },
    /// A block arrived; these other peers hold duplicate requests for it
    /// (endgame) and should cancel.
    CancelDuplicates {
        block: BlockInfo,
        peers: Vec<SocketAddr>,
    },
    SessionClosed {
        addr: SocketAddr,
        error: Option<Error>,
        served_block: bool,
    },
    /// An accepted incoming connection routed here by the engine, with the
    /// already parsed remote handshake.
    IncomingPeer {
        addr: SocketAddr,
        socket: Framed<Socket, HandshakeCodec>,
        handshake: Handshake,
    },
    /// Candidate addresses from any source (tracker task, engine API, DHT
    /// subscription).
    AddPeers(Vec<SocketAddr>),
    Shutdown,
}

/// The parameters for creating a torrent.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub conf: TorrentConf,
    pub encryption: EncryptionPolicy,
    pub client_id: PeerId,
    pub listen_port: Option<u16>,
    pub disk: DiskHandle,
    /// Present when started from a `.torrent` file; a magnet bootstrap
    /// starts with `None` and fetches it from the swarm.
    pub metainfo: Option<Metainfo>,
    pub info_hash: Sha1Hash,
    pub trackers: Vec<String>,
    pub initial_peers: Vec<SocketAddr>,
    pub alert_tx: UnboundedSender<Alert>,
}

/// The statistics snapshot shared with the announce tasks.
#[derive(Default)]
struct AnnounceStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

/// The events the torrent pushes to its announce tasks.
#[derive(Clone, Copy, Debug, PartialEq)]
enum TrackerEvent {
    Completed,
    Stopped,
}

/// The torrent's view of one connected session.
struct PeerRecord {
    cmd: peer::Sender,
    counters: Arc<ThruputCounters>,
    peer_id: Option<PeerId>,
    /// Whether the remote is interested in us, the choker's partition key.
    interested: bool,
    down_rate: RateEstimator,
    up_rate: RateEstimator,
    last_down_total: u64,
    last_up_total: u64,
    last_delivery: Option<Instant>,
}

impl PeerRecord {
    fn new(cmd: peer::Sender, counters: Arc<ThruputCounters>) -> Self {
        Self {
            cmd,
            counters,
            peer_id: None,
            interested: false,
            down_rate: RateEstimator::default(),
            up_rate: RateEstimator::default(),
            last_down_total: 0,
            last_up_total: 0,
            last_delivery: None,
        }
    }
}

/// One known candidate address and its reconnect backoff state.
struct Candidate {
    failures: u32,
    next_attempt: Instant,
    banned: bool,
    connected: bool,
}

/// The deduplicated candidate address pool.
struct CandidateQueue {
    known: HashMap<SocketAddr, Candidate>,
    cap: usize,
}

impl CandidateQueue {
    fn new(cap: usize) -> Self {
        Self {
            known: HashMap::new(),
            cap,
        }
    }

    fn add(&mut self, addr: SocketAddr, now: Instant) {
        if self.known.contains_key(&addr) {
            return;
        }
        if self.known.len() >= self.cap {
            return;
        }
        self.known.insert(
            addr,
            Candidate {
                failures: 0,
                next_attempt: now,
                banned: false,
                connected: false,
            },
        );
    }

    /// Picks a dialable candidate and marks it connected.
    fn next_ready(&mut self, now: Instant) -> Option<SocketAddr> {
        let addr = *self
            .known
            .iter()
            .find(|(_, c)| {
                !c.connected && !c.banned && c.next_attempt <= now
            })
            .map(|(addr, _)| addr)?;
        if let Some(candidate) = self.known.get_mut(&addr) {
            candidate.connected = true;
        }
        Some(addr)
    }

    /// Applies the reconnect backoff after a session ended. A session that
    /// produced a verified block resets the failure streak.
    fn on_disconnect(
        &mut self,
        addr: SocketAddr,
        served_block: bool,
        now: Instant,
        conf: &TorrentConf,
    ) {
        if let Some(candidate) = self.known.get_mut(&addr) {
            candidate.connected = false;
            if served_block {
                candidate.failures = 0;
                candidate.next_attempt = now + conf.min_reconnect_backoff;
            } else {
                candidate.failures += 1;
                let backoff = conf
                    .min_reconnect_backoff
                    .checked_mul(1 << (candidate.failures - 1).min(16))
                    .unwrap_or(conf.max_reconnect_backoff)
                    .min(conf.max_reconnect_backoff);
                candidate.next_attempt = now + backoff;
            }
        }
    }

    fn ban(&mut self, addr: SocketAddr) {
        if let Some(candidate) = self.known.get_mut(&addr) {
            candidate.banned = true;
        }
    }
}

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    encryption: EncryptionPolicy,
    disk: DiskHandle,
    alert_tx: UnboundedSender<Alert>,

    /// Taken out of the struct when `run` starts selecting on them.
    rx: Option<UnboundedReceiver<TorrentMsg>>,
    disk_rx: Option<TorrentAlertReceiver>,
    disk_alert_tx: crate::disk::TorrentAlertSender,

    metainfo: Option<Metainfo>,
    work: Option<Arc<Work>>,
    fetcher: Option<MetadataFetcher>,

    swarm: HashMap<SocketAddr, PeerRecord>,
    candidates: CandidateQueue,
    choker: Choker,
    last_choke_round: Instant,

    tracker_urls: Vec<String>,
    spawned_trackers: HashSet<String>,
    tracker_events: Vec<UnboundedSender<TrackerEvent>>,
    announce_stats: Arc<AnnounceStats>,

    /// Payload byte totals, including what closed sessions transferred and
    /// what the resume record carried over.
    uploaded: u64,
    downloaded: u64,
    completed_announced: bool,

    last_pex: Instant,
    pex_last_view: HashSet<SocketAddr>,
    ticks: u64,

    shutdown_requested: bool,
    fatal_error: Option<Error>,
}

impl Torrent {
    /// Creates the torrent and returns the sender half of its message
    /// channel, used by the engine (and cloned into sessions via the
    /// context).
    pub fn new(params: TorrentParams) -> (Self, UnboundedSender<TorrentMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (disk_alert_tx, disk_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            id: params.id,
            info_hash: params.info_hash,
            client_id: params.client_id,
            listen_port: params.listen_port,
            tx: tx.clone(),
        });
        let choker = Choker::new(&params.conf);
        let candidates = CandidateQueue::new(params.conf.max_candidate_count);
        let now = Instant::now();

        let mut torrent = Self {
            ctx,
            conf: params.conf,
            encryption: params.encryption,
            disk: params.disk,
            alert_tx: params.alert_tx,
            rx: Some(rx),
            disk_rx: Some(disk_rx),
            disk_alert_tx,
            metainfo: params.metainfo,
            work: None,
            fetcher: None,
            swarm: HashMap::new(),
            candidates,
            choker,
            last_choke_round: now,
            tracker_urls: params.trackers,
            spawned_trackers: HashSet::new(),
            tracker_events: Vec::new(),
            announce_stats: Arc::new(AnnounceStats::default()),
            uploaded: 0,
            downloaded: 0,
            completed_announced: false,
            last_pex: now,
            pex_last_view: HashSet::new(),
            ticks: 0,
            shutdown_requested: false,
            fatal_error: None,
        };
        for addr in params.initial_peers {
            torrent.candidates.add(addr, now);
        }
        (torrent, tx)
    }

    /// The path of this torrent's resume record.
    fn resume_path(&self) -> PathBuf {
        self.conf.resume_path.clone().unwrap_or_else(|| {
            self.conf.download_dir.join(format!(
                ".{}.resume",
                hex::encode(self.ctx.info_hash)
            ))
        })
    }

    /// Runs the torrent until completion of a graceful shutdown or a fatal
    /// error. Always performs the teardown (disk flush, resume snapshot,
    /// `stopped` announces), whatever caused the exit.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(e) = self.run_inner().await {
            self.fatal_error = Some(e);
        }
        self.shutdown_cleanup().await;
        match self.fatal_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        log::info!(
            "Starting torrent {} ({})",
            self.ctx.id,
            hex::encode(self.ctx.info_hash)
        );

        match self.metainfo.take() {
            Some(metainfo) => self.init_work(metainfo, true).await?,
            None => {
                log::info!(
                    "Torrent {} bootstrapping metadata from swarm",
                    self.ctx.id
                );
                self.fetcher =
                    Some(MetadataFetcher::new(self.ctx.info_hash));
            }
        }

        self.spawn_tracker_tasks();

        let mut rx = self.rx.take().expect("torrent run twice").fuse();
        let mut disk_rx =
            self.disk_rx.take().expect("torrent run twice").fuse();
        let mut tick = time::interval(Duration::from_secs(1)).fuse();

        while !self.shutdown_requested {
            select! {
                msg = rx.select_next_some() => {
                    self.handle_msg(msg).await?;
                }
                alert = disk_rx.select_next_some() => {
                    self.handle_disk_alert(alert).await?;
                }
                _ = tick.select_next_some() => {
                    self.tick().await?;
                }
            }
        }
        Ok(())
    }

    /// Initializes the download state from the now known metadata. With
    /// `try_resume`, an existing resume record is verified against the disk
    /// and used to pre-complete pieces.
    async fn init_work(
        &mut self,
        metainfo: Metainfo,
        try_resume: bool,
    ) -> Result<()> {
        let storage =
            StorageInfo::new(&metainfo, self.conf.download_dir.clone());
        let mut piece_map = PieceMap::new(&storage, &self.conf);

        self.disk.new_torrent(
            self.ctx.id,
            storage.clone(),
            metainfo.piece_hashes.clone(),
            self.disk_alert_tx.clone(),
        )?;

        if try_resume {
            if let Err(e) = self
                .restore_resume(&mut piece_map, &storage)
                .await
            {
                log::info!(
                    "Torrent {} starting fresh (no resume: {})",
                    self.ctx.id,
                    e
                );
            }
        }

        // ignore what restore queued for broadcast, there are no peers yet
        piece_map.pending_broadcast();
        let left = piece_map.bytes_left();
        self.announce_stats.left.store(left, Ordering::Relaxed);
        self.completed_announced = piece_map.is_seed();

        let work = Arc::new(Work {
            piece_map: Arc::new(RwLock::new(piece_map)),
            storage,
            disk: self.disk.clone(),
            info_bytes: metainfo.info_bytes.clone(),
        });
        self.work = Some(Arc::clone(&work));
        self.fetcher = None;

        // tracker URLs embedded in the metainfo join the announce rotation
        for url in &metainfo.trackers {
            if !self.tracker_urls.contains(url) {
                self.tracker_urls.push(url.clone());
            }
        }
        self.metainfo = Some(metainfo);

        // sessions opened during the metadata fetch switch to downloading
        for record in self.swarm.values() {
            let _ = record.cmd.send(peer::Command::WorkReady(Arc::clone(&work)));
        }
        // trackers embedded in the fetched metadata join the rotation
        self.spawn_tracker_tasks();
        Ok(())
    }

    /// Loads the resume record and reverifies every piece it claims
    /// complete against the disk; mismatches are downgraded to missing.
    async fn restore_resume(
        &mut self,
        piece_map: &mut PieceMap,
        storage: &StorageInfo,
    ) -> Result<()> {
        let record = ResumeRecord::load(&self.resume_path())?;
        if record.info_hash != self.ctx.info_hash
            || record.piece_len != storage.piece_len
            || record.piece_count != storage.piece_count
        {
            return Err(Error::Config(
                "resume record does not match torrent".into(),
            ));
        }

        let mut bitfield = crate::Bitfield::from_vec(record.bitfield.clone());
        bitfield.resize(storage.piece_count, false);

        let mut restored = 0;
        for index in 0..storage.piece_count {
            if !bitfield[index] {
                continue;
            }
            match self.disk.check_piece(self.ctx.id, index).await {
                Ok(true) => {
                    piece_map.mark_complete_verified(index);
                    restored += 1;
                }
                Ok(false) | Err(_) => {
                    log::warn!(
                        "Resume piece {} fails reverification, downgrading",
                        index
                    );
                }
            }
        }
        log::info!(
            "Torrent {} restored {}/{} pieces from resume",
            self.ctx.id,
            restored,
            storage.piece_count
        );

        self.uploaded = record.uploaded;
        self.downloaded = record.downloaded;
        let now = Instant::now();
        for addr in record.peers_hint {
            self.candidates.add(addr, now);
        }
        Ok(())
    }

    /// Spawns an announce task for every tracker URL that doesn't have one
    /// yet. Called again when a metadata fetch surfaces embedded trackers.
    fn spawn_tracker_tasks(&mut self) {
        let urls = std::mem::take(&mut self.tracker_urls);
        for url in &urls {
            if !self.spawned_trackers.insert(url.clone()) {
                continue;
            }
            let tracker = match Tracker::new(url) {
                Ok(tracker) => tracker,
                Err(e) => {
                    log::warn!("Skipping tracker {}: {}", url, e);
                    continue;
                }
            };
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            self.tracker_events.push(event_tx);
            tokio::spawn(run_tracker(
                tracker,
                Arc::clone(&self.announce_stats),
                event_rx,
                self.ctx.tx.clone(),
                TrackerTaskConf {
                    info_hash: self.ctx.info_hash,
                    client_id: self.ctx.client_id,
                    port: self.ctx.listen_port.unwrap_or(6881),
                    fallback_interval: self.conf.announce_interval,
                    error_threshold: self.conf.tracker_error_threshold,
                },
            ));
        }
        self.tracker_urls = urls;
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<()> {
        match msg {
            TorrentMsg::PeerConnected { addr, id } => {
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.peer_id = Some(id);
                }
            }
            TorrentMsg::PeerInterested { addr, interested } => {
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.interested = interested;
                }
            }
            TorrentMsg::MetadataPeer {
                addr,
                metadata_size,
            } => {
                if let Some(fetcher) = &mut self.fetcher {
                    fetcher.add_peer(addr, metadata_size);
                    self.drive_metadata_fetch();
                }
            }
            TorrentMsg::MetadataData {
                addr,
                piece,
                total_size,
                data,
            } => {
                self.on_metadata_data(addr, piece, total_size, data)
                    .await?;
            }
            TorrentMsg::MetadataReject { addr, piece } => {
                if let Some(fetcher) = &mut self.fetcher {
                    fetcher.on_reject(addr, piece);
                    self.drive_metadata_fetch();
                }
            }
            TorrentMsg::PexPeers { addr, peers } => {
                log::debug!(
                    "{} candidates via PEX from {}",
                    peers.len(),
                    addr
                );
                self.add_candidates(peers);
            }
            TorrentMsg::CancelDuplicates { block, peers } => {
                for addr in peers {
                    if let Some(record) = self.swarm.get(&addr) {
                        let _ = record.cmd.send(peer::Command::Cancel(block));
                    }
                }
            }
            TorrentMsg::SessionClosed {
                addr,
                error,
                served_block,
            } => {
                self.on_session_closed(addr, error, served_block);
            }
            TorrentMsg::IncomingPeer {
                addr,
                socket,
                handshake,
            } => {
                self.on_incoming_peer(addr, socket, handshake);
            }
            TorrentMsg::AddPeers(peers) => {
                self.add_candidates(peers);
            }
            TorrentMsg::Shutdown => {
                log::info!("Torrent {} shutting down", self.ctx.id);
                self.shutdown_requested = true;
            }
        }
        Ok(())
    }

    async fn on_metadata_data(
        &mut self,
        addr: SocketAddr,
        piece: u32,
        total_size: i64,
        data: Vec<u8>,
    ) -> Result<()> {
        let fetcher = match &mut self.fetcher {
            Some(fetcher) => fetcher,
            None => return Ok(()),
        };
        match fetcher.on_data(addr, piece, total_size, data) {
            MetadataEvent::Pending => {
                self.drive_metadata_fetch();
            }
            MetadataEvent::Complete(info_bytes) => {
                match Metainfo::from_info_bytes(&info_bytes) {
                    Ok(metainfo) => {
                        log::info!(
                            "Torrent {} metadata resolved: {:?}",
                            self.ctx.id,
                            metainfo.name
                        );
                        let _ = self.alert_tx.send(Alert::MetadataResolved {
                            id: self.ctx.id,
                            name: metainfo.name.clone(),
                        });
                        self.init_work(metainfo, true).await?;
                    }
                    Err(_) => {
                        // hashes right but doesn't decode: treat the buffer
                        // exactly like a poisoned one
                        log::warn!(
                            "Metadata from {} hashes but does not decode",
                            addr
                        );
                        self.ban_peer(addr);
                        if let Some(fetcher) = &mut self.fetcher {
                            fetcher.peer_gone(addr);
                        }
                        self.drive_metadata_fetch();
                    }
                }
            }
            MetadataEvent::Poisoned { by } => {
                self.ban_peer(by);
                self.drive_metadata_fetch();
            }
        }
        Ok(())
    }

    /// Issues the next metadata request if the fetcher has one ready.
    fn drive_metadata_fetch(&mut self) {
        if let Some(fetcher) = &mut self.fetcher {
            if let Some((addr, piece)) = fetcher.next_request(Instant::now())
            {
                if let Some(record) = self.swarm.get(&addr) {
                    let _ = record
                        .cmd
                        .send(peer::Command::RequestMetadata(piece));
                }
            }
        }
    }

    fn ban_peer(&mut self, addr: SocketAddr) {
        log::warn!("Banning peer {}", addr);
        self.candidates.ban(addr);
        if let Some(record) = self.swarm.get(&addr) {
            let _ = record.cmd.send(peer::Command::Shutdown);
        }
    }

    fn add_candidates(&mut self, peers: Vec<SocketAddr>) {
        let now = Instant::now();
        for addr in peers {
            self.candidates.add(addr, now);
        }
    }

    fn on_session_closed(
        &mut self,
        addr: SocketAddr,
        error: Option<Error>,
        served_block: bool,
    ) {
        log::info!(
            "Peer {} session closed{}",
            addr,
            error
                .as_ref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
        if let Some(record) = self.swarm.remove(&addr) {
            // bank the transfer totals before the counters go away
            self.downloaded += record
                .counters
                .down
                .total()
                .saturating_sub(record.last_down_total);
            self.uploaded += record
                .counters
                .up
                .total()
                .saturating_sub(record.last_up_total);
        }
        self.choker.peer_gone(addr);
        if let Some(fetcher) = &mut self.fetcher {
            fetcher.peer_gone(addr);
            self.drive_metadata_fetch();
        }

        match error {
            Some(Error::Banned) => self.candidates.ban(addr),
            _ => self.candidates.on_disconnect(
                addr,
                served_block,
                Instant::now(),
                &self.conf,
            ),
        }
    }

    fn on_incoming_peer(
        &mut self,
        addr: SocketAddr,
        socket: Framed<Socket, HandshakeCodec>,
        handshake: Handshake,
    ) {
        if self.swarm.contains_key(&addr) {
            log::debug!("Peer {} already connected, dropping dup", addr);
            return;
        }
        if self.swarm.len() >= self.conf.max_connected_peer_count {
            // while seeding, fresh blood beats the least productive peer;
            // while leeching a full swarm just rejects
            let seeding = self.completed_announced;
            let evicted = if seeding {
                self.swarm
                    .iter()
                    .min_by(|a, b| {
                        let rate_a =
                            a.1.up_rate.rate() + a.1.down_rate.rate();
                        let rate_b =
                            b.1.up_rate.rate() + b.1.down_rate.rate();
                        rate_a
                            .partial_cmp(&rate_b)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(addr, _)| *addr)
            } else {
                None
            };
            match evicted {
                Some(evicted) => {
                    log::info!(
                        "Evicting {} for incoming {}",
                        evicted,
                        addr
                    );
                    if let Some(record) = self.swarm.get(&evicted) {
                        let _ = record.cmd.send(peer::Command::Shutdown);
                    }
                }
                None => {
                    log::debug!("Swarm full, rejecting incoming {}", addr);
                    return;
                }
            }
        }

        let counters = Arc::new(ThruputCounters::default());
        let (mut session, cmd) = PeerSession::new(
            Arc::clone(&self.ctx),
            self.conf.clone(),
            self.work.clone(),
            addr,
            Arc::clone(&counters),
        );
        self.swarm.insert(addr, PeerRecord::new(cmd, counters));
        self.candidates.add(addr, Instant::now());
        tokio::spawn(async move {
            let result = session.start_inbound(socket, handshake).await;
            session.shutdown(result.err()).await;
        });
    }

    fn spawn_outbound_session(&mut self, addr: SocketAddr) {
        let counters = Arc::new(ThruputCounters::default());
        let (mut session, cmd) = PeerSession::new(
            Arc::clone(&self.ctx),
            self.conf.clone(),
            self.work.clone(),
            addr,
            Arc::clone(&counters),
        );
        self.swarm.insert(addr, PeerRecord::new(cmd, counters));
        let encryption = self.encryption;
        tokio::spawn(async move {
            let result = session.start_outbound(encryption).await;
            session.shutdown(result.err()).await;
        });
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::PieceCompleted { piece_index, valid } => {
                self.on_piece_verified(piece_index, valid).await?;
            }
            TorrentAlert::WriteFailure { piece_index } => {
                // a piece that hashed correctly could not be committed;
                // losing data silently is not an option
                log::error!(
                    "Torrent {} failed to commit piece {}",
                    self.ctx.id,
                    piece_index
                );
                self.fatal_error = Some(Error::Io(
                    std::io::ErrorKind::Other.into(),
                ));
                self.shutdown_requested = true;
            }
        }
        Ok(())
    }

    async fn on_piece_verified(
        &mut self,
        piece_index: PieceIndex,
        valid: bool,
    ) -> Result<()> {
        let work = match &self.work {
            Some(work) => Arc::clone(work),
            None => return Ok(()),
        };

        let (contributors, broadcast, left, is_seed) = {
            let mut piece_map = work.piece_map.write().await;
            let contributors =
                piece_map.on_piece_verified(piece_index, valid);
            (
                contributors,
                piece_map.pending_broadcast(),
                piece_map.bytes_left(),
                piece_map.is_seed(),
            )
        };
        self.announce_stats.left.store(left, Ordering::Relaxed);

        if valid {
            for piece_index in broadcast {
                for record in self.swarm.values() {
                    let _ =
                        record.cmd.send(peer::Command::Have(piece_index));
                }
            }
            if is_seed && !self.completed_announced {
                self.completed_announced = true;
                log::info!("Torrent {} complete", self.ctx.id);
                let _ = self
                    .alert_tx
                    .send(Alert::TorrentCompleted { id: self.ctx.id });
                for events in &self.tracker_events {
                    let _ = events.send(TrackerEvent::Completed);
                }
                self.save_resume().await;
            }
        } else {
            // every contributor is suspect; trust is halved and repeat
            // offenders are banned outright
            let now = Instant::now();
            for addr in contributors {
                log::warn!(
                    "Peer {} contributed to bad piece {}",
                    addr,
                    piece_index
                );
                if self.choker.record_hash_failure(addr, now) {
                    self.ban_peer(addr);
                }
            }
        }
        Ok(())
    }

    /// The torrent's 1 Hz housekeeping.
    async fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        let now = Instant::now();

        self.update_transfer_stats(now);
        self.dial_candidates(now);

        if now.duration_since(self.last_choke_round)
            >= self.conf.choke_interval
        {
            self.last_choke_round = now;
            self.run_choke_round(now).await;
        }

        if let Some(work) = &self.work {
            let mut piece_map = work.piece_map.write().await;
            piece_map.expire_requests(now);
            let backlogged =
                piece_map.verifying_count() >= self.conf.hash_backlog;
            piece_map.set_backpressure(backlogged);
        }

        self.drive_metadata_fetch();

        if now.duration_since(self.last_pex) >= self.conf.pex_interval {
            self.last_pex = now;
            self.send_pex_deltas();
        }

        // a resume snapshot every minute bounds what a crash can cost
        if self.ticks % 60 == 0 {
            self.save_resume().await;
        }

        Ok(())
    }

    /// Folds the per session counters into the torrent totals and rate
    /// estimators.
    fn update_transfer_stats(&mut self, now: Instant) {
        let elapsed = Duration::from_secs(1);
        let mut down_sum = 0;
        let mut up_sum = 0;
        for record in self.swarm.values_mut() {
            let down_total = record.counters.down.total();
            let up_total = record.counters.up.total();
            let down_delta =
                down_total.saturating_sub(record.last_down_total);
            if down_delta > 0 {
                record.last_delivery = Some(now);
            }
            down_sum += down_delta;
            up_sum += up_total.saturating_sub(record.last_up_total);
            record.last_down_total = down_total;
            record.last_up_total = up_total;
            record.down_rate.update(down_total, elapsed);
            record.up_rate.update(up_total, elapsed);
        }
        self.downloaded += down_sum;
        self.uploaded += up_sum;
        self.announce_stats
            .downloaded
            .store(self.downloaded, Ordering::Relaxed);
        self.announce_stats
            .uploaded
            .store(self.uploaded, Ordering::Relaxed);
    }

    /// Keeps the swarm topped up to the target size from the candidate
    /// pool.
    fn dial_candidates(&mut self, now: Instant) {
        while self.swarm.len() < self.conf.target_peer_count {
            let addr = match self.candidates.next_ready(now) {
                Some(addr) => addr,
                None => break,
            };
            if self.swarm.contains_key(&addr) {
                continue;
            }
            log::debug!("Dialing candidate {}", addr);
            self.spawn_outbound_session(addr);
        }
    }

    async fn run_choke_round(&mut self, now: Instant) {
        let seeding = match &self.work {
            Some(work) => work.piece_map.read().await.is_seed(),
            None => false,
        };
        let peers: Vec<RoundPeer> = self
            .swarm
            .iter()
            .map(|(addr, record)| RoundPeer {
                addr: *addr,
                interested: record.interested,
                download_rate: record.down_rate.rate(),
                upload_rate: record.up_rate.rate(),
                last_delivery: record.last_delivery,
            })
            .collect();

        for decision in self.choker.run_round(&peers, seeding, now) {
            let (addr, cmd) = match decision {
                Decision::Choke(addr) => (addr, peer::Command::Choke),
                Decision::Unchoke(addr) => (addr, peer::Command::Unchoke),
            };
            if let Some(record) = self.swarm.get(&addr) {
                let _ = record.cmd.send(cmd);
            }
        }
    }

    /// Gossips swarm membership changes since the last PEX tick to every
    /// session (each session enforces its own per peer minimum interval).
    fn send_pex_deltas(&mut self) {
        let current: HashSet<SocketAddr> =
            self.swarm.keys().copied().collect();
        let added: Vec<SocketAddr> =
            current.difference(&self.pex_last_view).copied().collect();
        let dropped: Vec<SocketAddr> =
            self.pex_last_view.difference(&current).copied().collect();
        if added.is_empty() && dropped.is_empty() {
            return;
        }
        for record in self.swarm.values() {
            let _ = record.cmd.send(peer::Command::SendPex {
                added: added.clone(),
                dropped: dropped.clone(),
            });
        }
        self.pex_last_view = current;
    }

    async fn save_resume(&mut self) {
        let work = match &self.work {
            Some(work) => Arc::clone(work),
            None => return,
        };
        let bitfield =
            work.piece_map.read().await.own_bitfield().as_slice().to_vec();
        let peers_hint: Vec<SocketAddr> =
            self.swarm.keys().copied().collect();
        let record = ResumeRecord::new(
            self.ctx.info_hash,
            work.storage.piece_len,
            work.storage.piece_count,
            bitfield,
            self.uploaded,
            self.downloaded,
            peers_hint,
        );
        let path = self.resume_path();
        if let Err(e) = record.save(&path) {
            log::warn!("Failed to save resume record {:?}: {}", path, e);
        } else {
            log::debug!("Saved resume record {:?}", path);
        }
    }

    /// The graceful teardown: sessions are told to shut down, the disk is
    /// drained, the resume record saved, and the trackers get the final
    /// `stopped` event.
    async fn shutdown_cleanup(&mut self) {
        for record in self.swarm.values() {
            let _ = record.cmd.send(peer::Command::Shutdown);
        }
        // final transfer totals before the flush barrier
        self.update_transfer_stats(Instant::now());
        if self.work.is_some() {
            if let Err(e) = self.disk.flush(self.ctx.id).await {
                log::warn!("Flush on shutdown failed: {}", e);
            }
            self.save_resume().await;
        }
        for events in &self.tracker_events {
            let _ = events.send(TrackerEvent::Stopped);
        }
        let _ = self.disk.remove_torrent(self.ctx.id);
        let _ = self.alert_tx.send(Alert::TorrentStopped {
            id: self.ctx.id,
            error: self.fatal_error.as_ref().map(|e| e.to_string()),
        });
    }
}

struct TrackerTaskConf {
    info_hash: Sha1Hash,
    client_id: PeerId,
    port: u16,
    fallback_interval: Duration,
    error_threshold: usize,
}

/// The long lived announce loop of one tracker: `started` on spawn,
/// periodic re-announces per the tracker's interval, `completed` and
/// `stopped` when the torrent pushes those events.
async fn run_tracker(
    mut tracker: Tracker,
    stats: Arc<AnnounceStats>,
    mut events: UnboundedReceiver<TrackerEvent>,
    tx: UnboundedSender<TorrentMsg>,
    conf: TrackerTaskConf,
) {
    let mut next_event = Some(AnnounceEvent::Started);
    loop {
        let event = next_event.take().unwrap_or(AnnounceEvent::None);
        let announce = Announce {
            info_hash: conf.info_hash,
            peer_id: conf.client_id,
            port: conf.port,
            uploaded: stats.uploaded.load(Ordering::Relaxed),
            downloaded: stats.downloaded.load(Ordering::Relaxed),
            left: stats.left.load(Ordering::Relaxed),
            event,
        };

        let interval = match tracker.announce(&announce).await {
            Ok(response) => {
                if !response.peers.is_empty() {
                    let _ = tx.send(TorrentMsg::AddPeers(response.peers));
                }
                // `min interval` binds even if it exceeds the regular one
                response
                    .interval
                    .max(response.min_interval.unwrap_or_default())
            }
            Err(_) => conf.fallback_interval,
        };

        if event == AnnounceEvent::Stopped {
            return;
        }
        if tracker.error_streak >= conf.error_threshold {
            log::warn!(
                "Tracker {} keeps failing, giving up on it",
                tracker.url()
            );
            return;
        }

        let delay = time::delay_for(interval);
        let event_recv = events.recv();
        futures::pin_mut!(delay, event_recv);
        match futures::future::select(delay, event_recv).await {
            futures::future::Either::Left(_) => {}
            futures::future::Either::Right((event, _)) => match event {
                Some(TrackerEvent::Completed) => {
                    next_event = Some(AnnounceEvent::Completed);
                }
                Some(TrackerEvent::Stopped) | None => {
                    next_event = Some(AnnounceEvent::Stopped);
                }
            },
        }
    }
}
