//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The Azureus style prefix of the client id this engine announces itself
/// with. The remaining 12 bytes are filled with random digits per engine
/// instance.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-RD0010-";

/// Generates a fresh client id: the fixed prefix followed by random ASCII
/// digits.
pub fn gen_client_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = b'0' + rng.gen_range(0..10u8);
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// How the engine negotiates stream obfuscation (MSE) with peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionPolicy {
    /// Outgoing connections are attempted in plaintext first; if the peer
    /// drops the connection during the handshake, the connection is retried
    /// with the encrypted handshake. Incoming encrypted connections are always
    /// accepted.
    Fallback,
    /// Outgoing connections always use the encrypted handshake.
    Always,
    /// The encrypted handshake is never initiated. Incoming encrypted
    /// connections are still accepted.
    Never,
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The preferred TCP listen port for incoming connections. If `None`, the
    /// `BT_PORT` environment variable is consulted, and failing that an
    /// ephemeral port is used.
    pub listen_port: Option<u16>,
    /// Whether and when to use the MSE obfuscation handshake.
    pub encryption: EncryptionPolicy,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: gen_client_id(),
            listen_port: std::env::var("BT_PORT")
                .ok()
                .and_then(|port| port.parse().ok()),
            encryption: EncryptionPolicy::Fallback,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The path of the resume file. Defaults to
    /// `<download_dir>/.<info hash hex>.resume`.
    pub resume_path: Option<PathBuf>,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// The number of connected peers the torrent tries to maintain by dialing
    /// candidates. Always at most `max_connected_peer_count`.
    pub target_peer_count: usize,

    /// The cap on the deduplicated candidate address pool.
    pub max_candidate_count: usize,

    /// The number of unchoke slots. One slot is reserved for the optimistic
    /// unchoke, the rest go to the best reciprocating peers.
    pub upload_slot_count: usize,

    /// The length of one choke round. Every third round is an optimistic
    /// round.
    pub choke_interval: Duration,

    /// An unchoked peer that delivers no payload for this long is considered
    /// snubbed and loses its slot in the next round.
    pub snub_threshold: Duration,

    /// When fewer than this many pieces are not yet complete, the downloader
    /// enters endgame mode and duplicates the remaining block requests.
    pub endgame_threshold: usize,

    /// The number of peers that may concurrently hold a request for the same
    /// block in endgame mode.
    pub endgame_max_request_dup: usize,

    /// A block request not served within this deadline is re-assigned.
    pub request_timeout: Duration,

    /// A connection with no payload traffic in either direction for this long
    /// is closed.
    pub idle_timeout: Duration,

    /// The handshake (TCP connect included) must complete within this long.
    pub handshake_timeout: Duration,

    /// A keep-alive message is sent if nothing else was written for this long.
    pub keep_alive_interval: Duration,

    /// The shortest time between two PEX messages to the same peer.
    pub pex_interval: Duration,

    /// If the tracker doesn't provide an announce interval, we fall back to
    /// announcing this often.
    pub announce_interval: Duration,

    /// After this many consecutive errors, the torrent stops announcing to
    /// a tracker.
    pub tracker_error_threshold: usize,

    /// When more than this many completed pieces are queued for hashing and
    /// disk commit, new block requests are paused until the queue drains.
    pub hash_backlog: usize,

    /// This many hash failures attributed to one peer within an hour ban the
    /// peer for the rest of the session.
    pub ban_hash_failure_count: usize,

    /// The smallest reconnect backoff applied to a failed peer address.
    pub min_reconnect_backoff: Duration,

    /// The backoff doubles on every failure up to this cap.
    pub max_reconnect_backoff: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            resume_path: None,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            target_peer_count: 30,
            max_candidate_count: 10_000,
            upload_slot_count: 4,
            choke_interval: Duration::from_secs(10),
            snub_threshold: Duration::from_secs(30),
            endgame_threshold: 5,
            endgame_max_request_dup: 3,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(90),
            pex_interval: Duration::from_secs(60),
            announce_interval: Duration::from_secs(30 * 60),
            tracker_error_threshold: 15,
            hash_backlog: 32,
            ban_hash_failure_count: 3,
            min_reconnect_backoff: Duration::from_secs(30),
            max_reconnect_backoff: Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_shape() {
        let id = gen_client_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }
}
