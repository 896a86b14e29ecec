//! Bootstrapping the `info` dictionary from the swarm (BEP 9) when the
//! torrent was started from a magnet URI and only the info hash is known.
//!
//! The fetcher downloads the metadata in 16 KiB pieces from one peer at
//! a time. Fetching from a single source keeps a hash mismatch attributable:
//! the metadata has no per piece hashes, so a poisoned buffer can only be
//! blamed if it has exactly one author.

use std::{
    collections::HashSet,
    net::SocketAddr,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{peer::extension::METADATA_PIECE_LEN, Sha1Hash};

/// An advertised metadata size beyond this is nonsense and the peer offering
/// it is ignored.
const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// An unanswered metadata request fails over to another peer after this
/// long.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// What the torrent loop should do after feeding an event to the fetcher.
#[derive(Debug, PartialEq)]
pub(crate) enum MetadataEvent {
    /// Nothing to act on yet.
    Pending,
    /// The full metadata downloaded and hashed to the info hash: here is the
    /// raw `info` dictionary.
    Complete(Vec<u8>),
    /// The assembled metadata did not hash to the info hash. The named peer
    /// supplied all of it and must be banned; the download restarts with
    /// another peer.
    Poisoned { by: SocketAddr },
}

pub(crate) struct MetadataFetcher {
    info_hash: Sha1Hash,
    /// The agreed metadata size, set by the first usable peer.
    size: Option<usize>,
    /// Downloaded pieces, allocated once the size is known.
    pieces: Vec<Option<Vec<u8>>>,
    /// Peers that advertised `ut_metadata` and a size, in fail-over order.
    peers: Vec<SocketAddr>,
    banned: HashSet<SocketAddr>,
    /// The peer all current pieces come from.
    source: Option<SocketAddr>,
    /// The piece requested from `source` and when.
    outstanding: Option<(u32, Instant)>,
}

impl MetadataFetcher {
    pub fn new(info_hash: Sha1Hash) -> Self {
        Self {
            info_hash,
            size: None,
            pieces: Vec::new(),
            peers: Vec::new(),
            banned: HashSet::new(),
            source: None,
            outstanding: None,
        }
    }

    /// Registers a peer that negotiated `ut_metadata`. Peers whose size
    /// claim is absurd or contradicts the established size are ignored.
    pub fn add_peer(&mut self, addr: SocketAddr, metadata_size: i64) {
        if metadata_size <= 0
            || metadata_size as usize > MAX_METADATA_SIZE
            || self.banned.contains(&addr)
            || self.peers.contains(&addr)
        {
            return;
        }
        let metadata_size = metadata_size as usize;
        match self.size {
            None => {
                self.size = Some(metadata_size);
                self.pieces =
                    vec![None; piece_count_for(metadata_size)];
            }
            Some(size) if size != metadata_size => {
                log::warn!(
                    "Peer {} claims metadata size {} != {}",
                    addr,
                    metadata_size,
                    size
                );
                return;
            }
            Some(_) => {}
        }
        log::info!("Peer {} can serve metadata ({} bytes)", addr, metadata_size);
        self.peers.push(addr);
    }

    /// Forgets a disconnected peer, discarding partial data it sourced.
    pub fn peer_gone(&mut self, addr: SocketAddr) {
        self.peers.retain(|p| *p != addr);
        if self.source == Some(addr) {
            self.restart();
        }
    }

    /// A peer refused to serve a metadata piece: move it to the back of the
    /// fail-over order and restart with another source.
    pub fn on_reject(&mut self, addr: SocketAddr, piece: u32) {
        log::info!("Peer {} rejected metadata piece {}", addr, piece);
        if self.source == Some(addr) {
            if let Some(pos) = self.peers.iter().position(|p| *p == addr) {
                let peer = self.peers.remove(pos);
                self.peers.push(peer);
            }
            self.restart();
        }
    }

    /// Returns the next request to issue: the target peer and the metadata
    /// piece index. `None` while a request is outstanding or no peer can
    /// serve.
    pub fn next_request(&mut self, now: Instant) -> Option<(SocketAddr, u32)> {
        self.size?;

        if let Some((piece, sent_at)) = self.outstanding {
            if now.duration_since(sent_at) < REQUEST_TIMEOUT {
                return None;
            }
            log::warn!("Metadata piece {} request timed out", piece);
            self.restart();
        }

        // stick with the current source, or elect the next usable peer
        let source = match self.source {
            Some(source) => source,
            None => {
                let source = *self
                    .peers
                    .iter()
                    .find(|p| !self.banned.contains(p))?;
                self.source = Some(source);
                source
            }
        };

        let piece = self.pieces.iter().position(|p| p.is_none())? as u32;
        self.outstanding = Some((piece, now));
        Some((source, piece))
    }

    /// Feeds a received metadata piece. Data from peers other than the
    /// current source is stale (e.g. a late reply from a replaced peer) and
    /// ignored.
    pub fn on_data(
        &mut self,
        addr: SocketAddr,
        piece: u32,
        total_size: i64,
        data: Vec<u8>,
    ) -> MetadataEvent {
        let size = match self.size {
            Some(size) => size,
            None => return MetadataEvent::Pending,
        };
        if self.source != Some(addr) {
            return MetadataEvent::Pending;
        }
        let piece = piece as usize;
        if piece >= self.pieces.len()
            || total_size as usize != size
            || data.len() != piece_len_for(size, piece)
        {
            log::warn!("Peer {} sent bogus metadata piece {}", addr, piece);
            self.restart();
            return MetadataEvent::Pending;
        }

        self.pieces[piece] = Some(data);
        self.outstanding = None;

        if self.pieces.iter().any(|p| p.is_none()) {
            return MetadataEvent::Pending;
        }

        // assembled: the whole buffer must hash to the info hash
        let mut buf = Vec::with_capacity(size);
        for piece in self.pieces.iter_mut() {
            buf.extend_from_slice(piece.as_ref().unwrap());
        }
        let digest: [u8; 20] = Sha1::digest(&buf).into();
        if digest == self.info_hash {
            log::info!("Metadata complete, {} bytes", buf.len());
            MetadataEvent::Complete(buf)
        } else {
            log::warn!(
                "Metadata from {} hashes to {}, expected {}",
                addr,
                hex::encode(digest),
                hex::encode(self.info_hash)
            );
            self.banned.insert(addr);
            self.peers.retain(|p| *p != addr);
            self.restart();
            MetadataEvent::Poisoned { by: addr }
        }
    }

    /// Discards buffered pieces and the current source so the next
    /// `next_request` starts over with another peer.
    fn restart(&mut self) {
        for piece in self.pieces.iter_mut() {
            *piece = None;
        }
        self.source = None;
        self.outstanding = None;
    }
}

fn piece_count_for(size: usize) -> usize {
    (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN
}

fn piece_len_for(size: usize, piece: usize) -> usize {
    (size - piece * METADATA_PIECE_LEN).min(METADATA_PIECE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn info_hash_of(data: &[u8]) -> Sha1Hash {
        Sha1::digest(data).into()
    }

    #[test]
    fn test_single_piece_bootstrap() {
        // the magnet bootstrap happy path: 26 bytes of metadata in one piece
        let info = b"d4:name1:x6:lengthi16000ee";
        assert_eq!(info.len(), 26);
        let mut fetcher = MetadataFetcher::new(info_hash_of(info));

        fetcher.add_peer(addr(1), info.len() as i64);
        let now = Instant::now();
        assert_eq!(fetcher.next_request(now), Some((addr(1), 0)));
        // no concurrent double-request
        assert_eq!(fetcher.next_request(now), None);

        let event =
            fetcher.on_data(addr(1), 0, info.len() as i64, info.to_vec());
        assert_eq!(event, MetadataEvent::Complete(info.to_vec()));
    }

    #[test]
    fn test_multi_piece_assembly() {
        let mut data = vec![0xaa; METADATA_PIECE_LEN];
        data.extend_from_slice(&[0xbb; 100]);
        let mut fetcher = MetadataFetcher::new(info_hash_of(&data));

        fetcher.add_peer(addr(1), data.len() as i64);
        let now = Instant::now();

        let (peer, piece) = fetcher.next_request(now).unwrap();
        assert_eq!((peer, piece), (addr(1), 0));
        assert_eq!(
            fetcher.on_data(
                addr(1),
                0,
                data.len() as i64,
                data[..METADATA_PIECE_LEN].to_vec()
            ),
            MetadataEvent::Pending
        );

        let (_, piece) = fetcher.next_request(now).unwrap();
        assert_eq!(piece, 1);
        assert_eq!(
            fetcher.on_data(
                addr(1),
                1,
                data.len() as i64,
                data[METADATA_PIECE_LEN..].to_vec()
            ),
            MetadataEvent::Complete(data)
        );
    }

    #[test]
    fn test_poisoned_metadata_bans_source_and_fails_over() {
        let info = b"d4:name1:x6:lengthi16000ee";
        let mut fetcher = MetadataFetcher::new(info_hash_of(info));

        fetcher.add_peer(addr(1), info.len() as i64);
        fetcher.add_peer(addr(2), info.len() as i64);

        let now = Instant::now();
        assert_eq!(fetcher.next_request(now), Some((addr(1), 0)));
        let event = fetcher.on_data(
            addr(1),
            0,
            info.len() as i64,
            vec![0xff; info.len()],
        );
        assert_eq!(event, MetadataEvent::Poisoned { by: addr(1) });

        // the fetch restarts with the second peer; the banned one is never
        // asked again
        assert_eq!(fetcher.next_request(now), Some((addr(2), 0)));
        let event =
            fetcher.on_data(addr(2), 0, info.len() as i64, info.to_vec());
        assert_eq!(event, MetadataEvent::Complete(info.to_vec()));
    }

    #[test]
    fn test_reject_fails_over_to_next_peer() {
        let info = b"d4:name1:x6:lengthi16000ee";
        let mut fetcher = MetadataFetcher::new(info_hash_of(info));
        fetcher.add_peer(addr(1), info.len() as i64);
        fetcher.add_peer(addr(2), info.len() as i64);

        let now = Instant::now();
        assert_eq!(fetcher.next_request(now), Some((addr(1), 0)));
        fetcher.on_reject(addr(1), 0);
        assert_eq!(fetcher.next_request(now), Some((addr(2), 0)));
    }

    #[test]
    fn test_request_timeout_switches_source() {
        let info = b"d4:name1:x6:lengthi16000ee";
        let mut fetcher = MetadataFetcher::new(info_hash_of(info));
        fetcher.add_peer(addr(1), info.len() as i64);
        fetcher.add_peer(addr(2), info.len() as i64);

        let now = Instant::now();
        assert_eq!(fetcher.next_request(now), Some((addr(1), 0)));
        let later = now + REQUEST_TIMEOUT + Duration::from_secs(1);
        // after the timeout the request is reissued; source election restarts
        // from the front of the fail-over order
        assert!(fetcher.next_request(later).is_some());
    }

    #[test]
    fn test_contradictory_size_claims_are_ignored() {
        let mut fetcher = MetadataFetcher::new([0; 20]);
        fetcher.add_peer(addr(1), 100);
        fetcher.add_peer(addr(2), 200);
        assert_eq!(fetcher.peers, vec![addr(1)]);
        // absurd sizes don't register at all
        fetcher.add_peer(addr(3), -1);
        fetcher.add_peer(addr(4), MAX_METADATA_SIZE as i64 + 1);
        assert_eq!(fetcher.peers, vec![addr(1)]);
    }

    #[test]
    fn test_data_from_stale_source_is_ignored() {
        let info = b"d4:name1:x6:lengthi16000ee";
        let mut fetcher = MetadataFetcher::new(info_hash_of(info));
        fetcher.add_peer(addr(1), info.len() as i64);

        let now = Instant::now();
        fetcher.next_request(now);
        // a reply from a peer that isn't the elected source does nothing
        assert_eq!(
            fetcher.on_data(addr(9), 0, info.len() as i64, info.to_vec()),
            MetadataEvent::Pending
        );
    }
}
