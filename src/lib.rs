// the session and torrent event loops' `select!` blocks overflow the
// default macro recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

mod choker;
pub mod conf;
mod counter;
mod disk;
pub mod engine;
pub mod error;
mod metadata;
pub mod metainfo;
mod peer;
mod piece_map;
pub mod resume;
mod storage_info;
mod torrent;
mod tracker;

use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// Pieces are indexed as `usize` in memory; the wire carries them as 4 byte
/// big endian integers and the codec converts at that boundary.
pub type PieceIndex = usize;

/// Index of a file within the torrent's file list.
pub type FileIndex = usize;

/// Identifies one torrent within an engine instance. Assigned when the
/// torrent is added and never reused.
pub type TorrentId = u32;

/// The 20 byte id a client announces in the handshake. Ours follows the
/// Azureus convention (see [`conf::CLIENT_ID_PREFIX`]); remote ids are
/// treated as opaque bytes.
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest: piece hashes and info hashes alike.
pub type Sha1Hash = [u8; 20];

/// Piece possession as one bit per piece, most significant bit first, so
/// bit 7 of byte 0 is piece 0. This matches the wire layout of the bitfield
/// message; the unused low bits of the final byte must stay zero there.
pub type Bitfield = BitVec<Msb0, u8>;

/// The unit of wire transfer is a 16 KiB chunk of a piece. Every request we
/// issue or serve is at most this long.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// Identifies one block: which piece, where in the piece, and how long. The
/// length equals [`BLOCK_LEN`] everywhere except possibly the torrent's
/// final block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    pub piece_index: PieceIndex,
    /// Byte offset of the block within its piece. Always a multiple of
    /// [`BLOCK_LEN`] for blocks we produce.
    pub offset: u32,
    pub len: u32,
}

impl BlockInfo {
    /// The position of this block in its piece's block list.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len > 0);
        debug_assert!(self.len <= BLOCK_LEN);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// The length of the block at `block_index` in a piece of `piece_len`
/// bytes: a full 16 KiB, except for a piece's short tail block.
///
/// # Panics
///
/// Panics if the block would begin at or past the end of the piece.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    BLOCK_LEN.min(piece_len - block_offset)
}

/// How many blocks a piece of the given length splits into; a short tail
/// counts as one block.
pub(crate) fn block_count(piece_len: u32) -> usize {
    let full = (piece_len / BLOCK_LEN) as usize;
    if piece_len % BLOCK_LEN == 0 {
        full
    } else {
        full + 1
    }
}

/// Decodes a compact peer list (BEP 23): 6 bytes per peer, 4 for the IPv4
/// address and 2 for the port, both big endian. Trailing partial entries are
/// discarded.
pub(crate) fn decode_compact_peers(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|chunk| {
            let ip = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
        })
        .collect()
}

/// Encodes peer addresses into the compact 6 bytes per peer representation.
/// IPv6 addresses have no compact form and are skipped.
pub(crate) fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    // a piece that ends exactly on a block boundary
    const EVEN_PIECE_LEN: u32 = 4 * BLOCK_LEN;
    // a piece whose last block is 1000 bytes
    const TAIL_LEN: u32 = 1000;
    const RAGGED_PIECE_LEN: u32 = 2 * BLOCK_LEN + TAIL_LEN;

    #[test]
    fn test_block_geometry_of_even_piece() {
        assert_eq!(block_count(EVEN_PIECE_LEN), 4);
        for index in 0..4 {
            assert_eq!(block_len(EVEN_PIECE_LEN, index), BLOCK_LEN);
        }
    }

    #[test]
    fn test_block_geometry_of_ragged_piece() {
        assert_eq!(block_count(RAGGED_PIECE_LEN), 3);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(RAGGED_PIECE_LEN, 2), TAIL_LEN);
    }

    #[test]
    fn test_single_short_block_piece() {
        // a torrent smaller than one block still has one block
        assert_eq!(block_count(TAIL_LEN), 1);
        assert_eq!(block_len(TAIL_LEN, 0), TAIL_LEN);
    }

    #[test]
    #[should_panic]
    fn test_block_len_past_piece_end_panics() {
        block_len(EVEN_PIECE_LEN, 4);
    }

    #[test]
    fn test_block_index_in_piece() {
        let block = BlockInfo {
            piece_index: 7,
            offset: 5 * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(block.index_in_piece(), 5);

        let tail = BlockInfo {
            piece_index: 7,
            offset: 2 * BLOCK_LEN,
            len: TAIL_LEN,
        };
        assert_eq!(tail.index_in_piece(), 2);
    }

    #[test]
    fn test_compact_peers_roundtrip() {
        let peers: Vec<SocketAddr> = vec![
            "1.2.3.4:6881".parse().unwrap(),
            "255.0.255.0:51413".parse().unwrap(),
        ];
        let encoded = encode_compact_peers(&peers);
        assert_eq!(encoded.len(), 12);
        assert_eq!(decode_compact_peers(&encoded), peers);
    }

    #[test]
    fn test_compact_peers_discards_partial_entry() {
        let mut buf = encode_compact_peers(&["1.2.3.4:6881".parse().unwrap()]);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode_compact_peers(&buf).len(), 1);
    }
}
