//! Block level bookkeeping for the download: which pieces we have, which
//! blocks are requested from whom, piece selection (Rarest First with an
//! endgame mode), swarm availability accounting and the pending HAVE queue.
//!
//! All mutation goes through the methods below; sessions share one instance
//! behind a lock, so each operation sees and leaves a consistent state.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::{
    block_count, block_len, conf::TorrentConf, storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex,
};

/// The request state of a single 16 KiB block.
#[derive(Clone, Debug, PartialEq)]
enum BlockState {
    NotRequested,
    /// Outstanding at one or more peers. Outside endgame mode at most one
    /// peer holds a request for a block; in endgame up to `max_request_dup`.
    Requested {
        peers: Vec<SocketAddr>,
        deadline: Instant,
    },
    Received,
}

/// Bookkeeping for a piece that has download activity but is not yet
/// verified.
#[derive(Debug)]
struct PieceDownload {
    blocks: Vec<BlockState>,
    /// Peers that delivered an accepted block of this piece, charged on
    /// a hash failure.
    contributors: Vec<SocketAddr>,
    /// All blocks received and the assembled piece is at the hasher. No
    /// requests are handed out for a piece in this window, which is what
    /// makes the commit at-most-once.
    verifying: bool,
}

impl PieceDownload {
    fn new(block_count: usize) -> Self {
        Self {
            blocks: vec![BlockState::NotRequested; block_count],
            contributors: Vec::new(),
            verifying: false,
        }
    }

    fn received_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockState::Received))
            .count()
    }
}

/// The outcome of offering a downloaded block to the piece map.
#[derive(Debug, PartialEq)]
pub(crate) enum DeliverOutcome {
    /// The block was needed. When `piece_complete` is set, every block of the
    /// piece is now in and the assembled piece must be handed to the hasher.
    /// `cancel_peers` lists the other peers with an outstanding request for
    /// this exact block (endgame duplicates), which should now be cancelled.
    Accepted {
        piece_complete: bool,
        cancel_peers: Vec<SocketAddr>,
    },
    /// The block was already received. The payload must not be forwarded to
    /// disk.
    Duplicate,
    /// The block is out of bounds, belongs to a complete piece, or has the
    /// wrong length.
    Rejected,
}

pub(crate) struct PieceMap {
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    /// Our own piece possession, the bitfield we announce.
    own: Bitfield,
    /// Pieces with download activity, keyed by piece index.
    downloads: HashMap<PieceIndex, PieceDownload>,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    /// The number of pieces we don't have yet (missing and in flight).
    missing_count: usize,
    endgame_threshold: usize,
    max_request_dup: usize,
    request_timeout: Duration,
    in_endgame: bool,
    /// Whether the Random First Piece override was already spent.
    first_pick_made: bool,
    /// Verified pieces not yet announced to the swarm.
    pending_broadcast: Vec<PieceIndex>,
    /// While set, no new requests are handed out (the hash and disk commit
    /// queue is saturated).
    backpressured: bool,
}

impl PieceMap {
    pub fn new(storage: &StorageInfo, conf: &TorrentConf) -> Self {
        Self {
            piece_count: storage.piece_count,
            piece_len: storage.piece_len,
            last_piece_len: storage.last_piece_len,
            own: Bitfield::repeat(false, storage.piece_count),
            downloads: HashMap::new(),
            availability: vec![0; storage.piece_count],
            missing_count: storage.piece_count,
            endgame_threshold: conf.endgame_threshold,
            max_request_dup: conf.endgame_max_request_dup,
            request_timeout: conf.request_timeout,
            in_endgame: false,
            first_pick_made: false,
            pending_broadcast: Vec::new(),
            backpressured: false,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!(index < self.piece_count);
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// The bitfield of our verified pieces.
    pub fn own_bitfield(&self) -> &Bitfield {
        &self.own
    }

    /// True once every piece is verified.
    pub fn is_seed(&self) -> bool {
        self.missing_count == 0
    }

    pub fn in_endgame(&self) -> bool {
        self.in_endgame
    }

    /// The number of bytes still to download, announced to trackers as
    /// `left`.
    pub fn bytes_left(&self) -> u64 {
        (0..self.piece_count)
            .filter(|i| !self.own[*i])
            .map(|i| self.piece_len(i) as u64)
            .sum()
    }

    /// True if the remote has at least one piece that we don't.
    pub fn is_interested_in(&self, remote: &Bitfield) -> bool {
        remote
            .iter()
            .enumerate()
            .take(self.piece_count)
            .any(|(index, has)| *has && !self.own[index])
    }

    pub fn set_backpressure(&mut self, backpressured: bool) {
        self.backpressured = backpressured;
    }

    /// Registers a newly connected peer's full bitfield with the
    /// availability counts.
    pub fn register_availability(&mut self, remote: &Bitfield) {
        for (index, has) in remote.iter().enumerate().take(self.piece_count) {
            if *has {
                self.availability[index] += 1;
            }
        }
    }

    /// Registers that a connected peer announced one new piece. The caller
    /// guards against repeat announcements of the same piece by the same
    /// peer, so counting is exact.
    pub fn have_received(&mut self, index: PieceIndex) {
        if index < self.piece_count {
            self.availability[index] += 1;
        }
    }

    /// Removes a disconnecting peer's bitfield from the availability counts
    /// and releases every block request it held.
    pub fn peer_gone(&mut self, remote: &Bitfield, peer: SocketAddr) {
        for (index, has) in remote.iter().enumerate().take(self.piece_count) {
            if *has {
                debug_assert!(self.availability[index] > 0);
                self.availability[index] =
                    self.availability[index].saturating_sub(1);
            }
        }
        for download in self.downloads.values_mut() {
            for block in download.blocks.iter_mut() {
                if let BlockState::Requested { peers, .. } = block {
                    peers.retain(|p| *p != peer);
                    if peers.is_empty() {
                        *block = BlockState::NotRequested;
                    }
                }
            }
        }
    }

    /// Hands out the next block to request from a peer with the given piece
    /// availability, or `None` if the peer has nothing we currently need.
    ///
    /// Selection is Rarest First: among the peer's pieces that are not yet
    /// complete and have an eligible block, the piece with the lowest swarm
    /// availability wins, ties broken by the lowest index. For the very first
    /// piece of a fresh download the pick is randomized over the four rarest
    /// candidates so simultaneously started clients don't stampede the same
    /// piece. Within a piece, blocks are handed out in ascending offset
    /// order. In endgame mode a block already requested from other peers may
    /// be handed out again, up to `max_request_dup` concurrent holders.
    pub fn next_request(
        &mut self,
        remote: &Bitfield,
        peer: SocketAddr,
        now: Instant,
    ) -> Option<BlockInfo> {
        if self.backpressured {
            return None;
        }

        let piece_index = self.pick_piece(remote, peer)?;

        let piece_len = self.piece_len(piece_index);
        let download = self
            .downloads
            .entry(piece_index)
            .or_insert_with(|| PieceDownload::new(block_count(piece_len)));

        let block_index =
            Self::pick_block(download, peer, self.in_endgame, self.max_request_dup)?;

        let deadline = now + self.request_timeout;
        match &mut download.blocks[block_index] {
            state @ BlockState::NotRequested => {
                *state = BlockState::Requested {
                    peers: vec![peer],
                    deadline,
                };
            }
            BlockState::Requested { peers, .. } => peers.push(peer),
            BlockState::Received => unreachable!("picked a received block"),
        }

        self.first_pick_made = true;

        Some(BlockInfo {
            piece_index,
            offset: block_index as u32 * crate::BLOCK_LEN,
            len: block_len(piece_len, block_index),
        })
    }

    /// Picks the piece to request from, per the selection policy.
    fn pick_piece(
        &mut self,
        remote: &Bitfield,
        peer: SocketAddr,
    ) -> Option<PieceIndex> {
        let mut candidates: Vec<(u32, PieceIndex)> = Vec::new();
        for (index, has) in remote.iter().enumerate().take(self.piece_count) {
            if !*has || self.own[index] {
                continue;
            }
            if !self.has_eligible_block(index, peer) {
                continue;
            }
            candidates.push((self.availability[index], index));
        }
        // lowest availability first, ties by lowest index
        candidates.sort_unstable();

        if candidates.is_empty() {
            return None;
        }

        // Random First Piece: a fresh download picks uniformly among the four
        // rarest candidates
        if !self.first_pick_made && self.own.count_ones() == 0 {
            let pool = candidates.len().min(4);
            let pick = rand::thread_rng().gen_range(0..pool);
            return Some(candidates[pick].1);
        }

        Some(candidates[0].1)
    }

    /// Whether the piece has a block this peer could be asked for.
    fn has_eligible_block(&self, index: PieceIndex, peer: SocketAddr) -> bool {
        match self.downloads.get(&index) {
            None => true,
            Some(download) => {
                !download.verifying
                    && Self::pick_block(
                        download,
                        peer,
                        self.in_endgame,
                        self.max_request_dup,
                    )
                    .is_some()
            }
        }
    }

    /// Returns the index of the first requestable block in the piece, in
    /// ascending offset order. Not-yet-requested blocks are preferred; in
    /// endgame mode, blocks below the duplication cap that this peer doesn't
    /// already hold come next.
    fn pick_block(
        download: &PieceDownload,
        peer: SocketAddr,
        in_endgame: bool,
        max_request_dup: usize,
    ) -> Option<usize> {
        if download.verifying {
            return None;
        }
        let fresh = download
            .blocks
            .iter()
            .position(|b| matches!(b, BlockState::NotRequested));
        if fresh.is_some() || !in_endgame {
            return fresh;
        }
        download.blocks.iter().position(|b| match b {
            BlockState::Requested { peers, .. } => {
                peers.len() < max_request_dup && !peers.contains(&peer)
            }
            _ => false,
        })
    }

    /// Releases the peer's outstanding requests for the given blocks, e.g.
    /// when the peer chokes us or a request times out on the session's side.
    /// Received blocks are unaffected.
    pub fn release_requests(&mut self, peer: SocketAddr, blocks: &[BlockInfo]) {
        for block in blocks {
            if let Some(download) = self.downloads.get_mut(&block.piece_index)
            {
                if let Some(BlockState::Requested { peers, .. }) =
                    download.blocks.get_mut(block.index_in_piece())
                {
                    peers.retain(|p| *p != peer);
                    if peers.is_empty() {
                        download.blocks[block.index_in_piece()] =
                            BlockState::NotRequested;
                    }
                }
            }
        }
    }

    /// Resets requests whose deadline has passed so the blocks become
    /// requestable from other peers. Returns the number of reset blocks.
    pub fn expire_requests(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for download in self.downloads.values_mut() {
            for block in download.blocks.iter_mut() {
                if let BlockState::Requested { deadline, .. } = block {
                    if *deadline <= now {
                        *block = BlockState::NotRequested;
                        expired += 1;
                    }
                }
            }
        }
        expired
    }

    /// Offers a downloaded block. On `Accepted` the caller forwards the
    /// payload to the disk task; a `piece_complete` outcome means the disk
    /// task now has every block and will report the hash verdict, which the
    /// torrent feeds back through [`Self::on_piece_verified`].
    pub fn deliver(
        &mut self,
        block: BlockInfo,
        from: SocketAddr,
    ) -> DeliverOutcome {
        if block.piece_index >= self.piece_count
            || self.own[block.piece_index]
            || block.offset % crate::BLOCK_LEN != 0
        {
            return DeliverOutcome::Rejected;
        }
        let piece_len = self.piece_len(block.piece_index);
        let block_index = (block.offset / crate::BLOCK_LEN) as usize;
        if block_index >= block_count(piece_len)
            || block.len != block_len(piece_len, block_index)
        {
            return DeliverOutcome::Rejected;
        }

        let download = self
            .downloads
            .entry(block.piece_index)
            .or_insert_with(|| PieceDownload::new(block_count(piece_len)));

        let cancel_peers = match &download.blocks[block_index] {
            BlockState::Received => return DeliverOutcome::Duplicate,
            BlockState::Requested { peers, .. } => {
                peers.iter().filter(|p| **p != from).copied().collect()
            }
            BlockState::NotRequested => Vec::new(),
        };

        download.blocks[block_index] = BlockState::Received;
        if !download.contributors.contains(&from) {
            download.contributors.push(from);
        }

        let piece_complete =
            download.received_count() == download.blocks.len();
        if piece_complete {
            download.verifying = true;
        }

        DeliverOutcome::Accepted {
            piece_complete,
            cancel_peers,
        }
    }

    /// Applies the hash verdict for a fully received piece. On success the
    /// piece becomes complete and is queued for HAVE broadcast; on failure
    /// all its blocks are reset for re-download. Either way the peers that
    /// contributed blocks are returned, so a failed piece can be charged to
    /// them.
    pub fn on_piece_verified(
        &mut self,
        index: PieceIndex,
        valid: bool,
    ) -> Vec<SocketAddr> {
        let download = match self.downloads.remove(&index) {
            Some(download) => download,
            None => return Vec::new(),
        };
        let contributors = download.contributors;

        if valid {
            if !self.own[index] {
                self.own.set(index, true);
                self.missing_count -= 1;
                self.pending_broadcast.push(index);
            }
        } else {
            log::warn!("Piece {} failed hash check, resetting", index);
            let piece_len = self.piece_len(index);
            self.downloads
                .insert(index, PieceDownload::new(block_count(piece_len)));
        }

        self.update_endgame();
        contributors
    }

    /// Marks a piece complete without queuing a broadcast, used when
    /// restoring from a resume record after the on-disk data reverified.
    pub fn mark_complete_verified(&mut self, index: PieceIndex) {
        if !self.own[index] {
            self.own.set(index, true);
            self.missing_count -= 1;
            self.downloads.remove(&index);
            self.update_endgame();
        }
    }

    fn update_endgame(&mut self) {
        let was = self.in_endgame;
        self.in_endgame =
            self.missing_count > 0 && self.missing_count < self.endgame_threshold;
        if self.in_endgame != was {
            log::info!(
                "Endgame mode {} ({} pieces left)",
                if self.in_endgame { "on" } else { "off" },
                self.missing_count
            );
        }
    }

    /// Drains the queue of newly completed pieces for HAVE dissemination.
    pub fn pending_broadcast(&mut self) -> Vec<PieceIndex> {
        std::mem::take(&mut self.pending_broadcast)
    }

    /// The number of fully received pieces waiting for their hash verdict,
    /// the measure of the hash and commit backlog.
    pub fn verifying_count(&self) -> usize {
        self.downloads.values().filter(|d| d.verifying).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::TorrentConf, FileInfo, BLOCK_LEN};
    use std::path::PathBuf;

    fn storage(piece_count: usize, piece_len: u32, last_piece_len: u32) -> StorageInfo {
        let torrent_len =
            piece_len as u64 * (piece_count as u64 - 1) + last_piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            torrent_len,
            download_dir: PathBuf::from("/tmp"),
            files: vec![FileInfo {
                path: PathBuf::from("file"),
                len: torrent_len,
                torrent_offset: 0,
            }],
        }
    }

    fn conf() -> TorrentConf {
        TorrentConf::new("/tmp")
    }

    fn map(piece_count: usize) -> PieceMap {
        PieceMap::new(&storage(piece_count, BLOCK_LEN, BLOCK_LEN), &conf())
    }

    fn full_bitfield(piece_count: usize) -> Bitfield {
        Bitfield::repeat(true, piece_count)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Requests and delivers all blocks of the piece from the peer, then
    /// applies a passing hash verdict.
    fn complete_piece(map: &mut PieceMap, index: PieceIndex, peer: SocketAddr) {
        let blocks = block_count(map.piece_len(index));
        for block_index in 0..blocks {
            let block = BlockInfo {
                piece_index: index,
                offset: block_index as u32 * BLOCK_LEN,
                len: block_len(map.piece_len(index), block_index),
            };
            assert!(matches!(
                map.deliver(block, peer),
                DeliverOutcome::Accepted { .. }
            ));
        }
        map.on_piece_verified(index, true);
    }

    #[test]
    fn test_rarest_piece_wins() {
        let mut map = map(8);
        map.first_pick_made = true;
        // piece 5 is the rarest: everyone has everything except piece 5,
        // which only our peer has
        for _ in 0..3 {
            let mut bits = full_bitfield(8);
            bits.set(5, false);
            map.register_availability(&bits);
        }
        let remote = full_bitfield(8);
        map.register_availability(&remote);

        let block = map.next_request(&remote, addr(1), Instant::now()).unwrap();
        assert_eq!(block.piece_index, 5);
    }

    #[test]
    fn test_availability_tie_breaks_by_lowest_index() {
        let mut map = map(4);
        map.first_pick_made = true;
        let remote = full_bitfield(4);
        map.register_availability(&remote);
        let block = map.next_request(&remote, addr(1), Instant::now()).unwrap();
        assert_eq!(block.piece_index, 0);
    }

    #[test]
    fn test_random_first_piece_picks_among_four_rarest() {
        // pieces 0..4 availability 1, pieces 4..8 availability 2: the first
        // pick must always land in 0..4
        for _ in 0..20 {
            let mut map = map(8);
            let remote = full_bitfield(8);
            map.register_availability(&remote);
            let mut upper = Bitfield::repeat(false, 8);
            for i in 4..8 {
                upper.set(i, true);
            }
            map.register_availability(&upper);

            let block =
                map.next_request(&remote, addr(1), Instant::now()).unwrap();
            assert!(block.piece_index < 4);
        }
    }

    #[test]
    fn test_blocks_handed_out_in_ascending_offset_order() {
        let mut map = PieceMap::new(&storage(2, 3 * BLOCK_LEN, BLOCK_LEN), &conf());
        map.first_pick_made = true;
        let mut remote = Bitfield::repeat(false, 2);
        remote.set(0, true);
        map.register_availability(&remote);

        let now = Instant::now();
        let offsets: Vec<u32> = (0..3)
            .map(|_| map.next_request(&remote, addr(1), now).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, BLOCK_LEN, 2 * BLOCK_LEN]);
        // all three blocks of the only piece the peer has are now requested
        assert_eq!(map.next_request(&remote, addr(1), now), None);
    }

    #[test]
    fn test_no_duplicate_requests_outside_endgame() {
        let mut map = map(8);
        map.first_pick_made = true;
        let remote = full_bitfield(8);
        map.register_availability(&remote);
        map.register_availability(&remote);

        let now = Instant::now();
        let first = map.next_request(&remote, addr(1), now).unwrap();
        let second = map.next_request(&remote, addr(2), now).unwrap();
        assert_ne!(
            (first.piece_index, first.offset),
            (second.piece_index, second.offset)
        );
    }

    #[test]
    fn test_endgame_duplicates_up_to_cap() {
        let mut map = map(6);
        map.first_pick_made = true;
        let remote = full_bitfield(6);
        map.register_availability(&remote);

        // complete all but the last piece to cross the endgame threshold (5)
        for index in 0..5 {
            complete_piece(&mut map, index, addr(9));
        }
        assert!(map.in_endgame());

        let now = Instant::now();
        let first = map.next_request(&remote, addr(1), now).unwrap();
        assert_eq!(first.piece_index, 5);
        // the same peer must not be handed the block again
        assert_eq!(map.next_request(&remote, addr(1), now), None);
        // two more peers may duplicate the request, the cap is 3
        let second = map.next_request(&remote, addr(2), now).unwrap();
        let third = map.next_request(&remote, addr(3), now).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(map.next_request(&remote, addr(4), now), None);
    }

    #[test]
    fn test_endgame_delivery_reports_peers_to_cancel() {
        let mut map = map(6);
        map.first_pick_made = true;
        let remote = full_bitfield(6);
        map.register_availability(&remote);
        for index in 0..5 {
            complete_piece(&mut map, index, addr(9));
        }

        let now = Instant::now();
        let block = map.next_request(&remote, addr(1), now).unwrap();
        map.next_request(&remote, addr(2), now).unwrap();
        map.next_request(&remote, addr(3), now).unwrap();

        match map.deliver(block, addr(2)) {
            DeliverOutcome::Accepted {
                piece_complete,
                mut cancel_peers,
            } => {
                assert!(piece_complete);
                cancel_peers.sort();
                assert_eq!(cancel_peers, vec![addr(1), addr(3)]);
            }
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }
        // the duplicate copy from a raced peer is reported as such
        assert_eq!(map.deliver(block, addr(1)), DeliverOutcome::Duplicate);
    }

    #[test]
    fn test_deliver_rejects_invalid_blocks() {
        let mut map = map(2);
        let peer = addr(1);

        // out of bounds piece
        assert_eq!(
            map.deliver(
                BlockInfo {
                    piece_index: 2,
                    offset: 0,
                    len: BLOCK_LEN
                },
                peer
            ),
            DeliverOutcome::Rejected
        );
        // misaligned offset
        assert_eq!(
            map.deliver(
                BlockInfo {
                    piece_index: 0,
                    offset: 1,
                    len: BLOCK_LEN
                },
                peer
            ),
            DeliverOutcome::Rejected
        );
        // wrong length
        assert_eq!(
            map.deliver(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: BLOCK_LEN - 1
                },
                peer
            ),
            DeliverOutcome::Rejected
        );
        // complete piece
        complete_piece(&mut map, 0, peer);
        assert_eq!(
            map.deliver(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: BLOCK_LEN
                },
                peer
            ),
            DeliverOutcome::Rejected
        );
    }

    #[test]
    fn test_complete_piece_is_never_requested_again() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        complete_piece(&mut map, 0, addr(9));
        assert_eq!(map.pending_broadcast(), vec![0]);
        // draining twice yields nothing new
        assert!(map.pending_broadcast().is_empty());

        let block = map.next_request(&remote, addr(1), Instant::now()).unwrap();
        assert_eq!(block.piece_index, 1);
    }

    #[test]
    fn test_hash_failure_resets_piece_and_reports_contributors() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        let now = Instant::now();
        let block = map.next_request(&remote, addr(1), now).unwrap();
        match map.deliver(block, addr(1)) {
            DeliverOutcome::Accepted { piece_complete, .. } => {
                assert!(piece_complete)
            }
            outcome => panic!("unexpected outcome: {:?}", outcome),
        }

        let contributors = map.on_piece_verified(block.piece_index, false);
        assert_eq!(contributors, vec![addr(1)]);
        assert!(!map.own_bitfield()[block.piece_index]);
        assert!(map.pending_broadcast().is_empty());

        // the piece is requestable again
        let again = map.next_request(&remote, addr(2), now).unwrap();
        assert_eq!(again.piece_index, block.piece_index);
    }

    #[test]
    fn test_availability_accounting() {
        let mut map = map(3);
        let mut bits_a = Bitfield::repeat(false, 3);
        bits_a.set(0, true);
        bits_a.set(2, true);
        let bits_b = full_bitfield(3);

        map.register_availability(&bits_a);
        map.register_availability(&bits_b);
        assert_eq!(map.availability, vec![2, 1, 2]);

        map.have_received(1);
        assert_eq!(map.availability, vec![2, 2, 2]);

        map.peer_gone(&bits_a, addr(1));
        assert_eq!(map.availability, vec![1, 2, 1]);
    }

    #[test]
    fn test_peer_gone_releases_requests() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        let now = Instant::now();
        let block = map.next_request(&remote, addr(1), now).unwrap();
        map.peer_gone(&remote, addr(1));

        // another peer can immediately request the released block
        let again = map.next_request(&remote, addr(2), now).unwrap();
        assert_eq!(block, again);
    }

    #[test]
    fn test_request_expiry() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        let now = Instant::now();
        let block = map.next_request(&remote, addr(1), now).unwrap();
        assert_eq!(map.expire_requests(now), 0);
        let expired = map.expire_requests(now + Duration::from_secs(61));
        assert_eq!(expired, 1);

        let again = map.next_request(&remote, addr(2), now).unwrap();
        assert_eq!(block, again);
    }

    #[test]
    fn test_release_requests() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        let now = Instant::now();
        let block = map.next_request(&remote, addr(1), now).unwrap();
        map.release_requests(addr(1), &[block]);
        let again = map.next_request(&remote, addr(2), now).unwrap();
        assert_eq!(block, again);
    }

    #[test]
    fn test_backpressure_pauses_request_handout() {
        let mut map = map(2);
        map.first_pick_made = true;
        let remote = full_bitfield(2);
        map.register_availability(&remote);

        map.set_backpressure(true);
        assert_eq!(map.next_request(&remote, addr(1), Instant::now()), None);
        map.set_backpressure(false);
        assert!(map.next_request(&remote, addr(1), Instant::now()).is_some());
    }

    #[test]
    fn test_bytes_left_with_short_last_piece() {
        let mut map = PieceMap::new(&storage(3, BLOCK_LEN, 100), &conf());
        assert_eq!(map.bytes_left(), 2 * BLOCK_LEN as u64 + 100);
        map.mark_complete_verified(2);
        assert_eq!(map.bytes_left(), 2 * BLOCK_LEN as u64);
        map.mark_complete_verified(0);
        map.mark_complete_verified(1);
        assert_eq!(map.bytes_left(), 0);
        assert!(map.is_seed());
    }

    #[test]
    fn test_empty_remote_bitfield_is_never_selected() {
        let mut map = map(4);
        map.first_pick_made = true;
        let remote = Bitfield::repeat(false, 4);
        map.register_availability(&remote);
        assert_eq!(map.next_request(&remote, addr(1), Instant::now()), None);
        assert!(!map.is_interested_in(&remote));
    }
}
