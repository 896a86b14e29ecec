//! The resume record: a small bencoded snapshot of a torrent's progress,
//! written on shutdown (and periodically) and restored on startup so
//! verified pieces are not downloaded again.
//!
//! The schema is forward compatible: keys unknown to this version are
//! carried through a load/save cycle untouched. Encoding is canonical
//! (dictionary keys sorted), so saving an unchanged record reproduces the
//! input byte for byte.

use std::{
    collections::BTreeMap, convert::TryFrom, net::SocketAddr, path::Path,
};

use serde_bencode::value::Value;

use crate::{
    decode_compact_peers, encode_compact_peers,
    error::{Error, Result},
    Sha1Hash,
};

/// The largest number of recently good peer addresses persisted as a warm
/// start hint.
pub const MAX_PEER_HINTS: usize = 200;

#[derive(Clone, Debug, PartialEq)]
pub struct ResumeRecord {
    /// The torrent this record belongs to.
    pub info_hash: Sha1Hash,
    /// The nominal piece length, to detect a record for a different torrent
    /// layout.
    pub piece_len: u32,
    pub piece_count: usize,
    /// The raw possession bitfield, `ceil(piece_count / 8)` bytes.
    pub bitfield: Vec<u8>,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Recently good peer addresses in compact encoding, for a warm start.
    pub peers_hint: Vec<SocketAddr>,
    /// Keys from a newer schema version, preserved on re-save.
    unknown: BTreeMap<Vec<u8>, Value>,
}

impl ResumeRecord {
    pub fn new(
        info_hash: Sha1Hash,
        piece_len: u32,
        piece_count: usize,
        bitfield: Vec<u8>,
        uploaded: u64,
        downloaded: u64,
        mut peers_hint: Vec<SocketAddr>,
    ) -> Self {
        peers_hint.truncate(MAX_PEER_HINTS);
        Self {
            info_hash,
            piece_len,
            piece_count,
            bitfield,
            uploaded,
            downloaded,
            peers_hint,
            unknown: BTreeMap::new(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let invalid =
            || Error::Config("invalid resume record".into());
        let dict = match serde_bencode::from_bytes(buf)? {
            Value::Dict(dict) => dict,
            _ => return Err(invalid()),
        };

        let mut record = Self::new([0; 20], 0, 0, Vec::new(), 0, 0, Vec::new());
        for (key, value) in dict {
            match (key.as_slice(), value) {
                (b"infohash", Value::Bytes(bytes)) => {
                    if bytes.len() != 20 {
                        return Err(invalid());
                    }
                    record.info_hash.copy_from_slice(&bytes);
                }
                (b"piece_length", Value::Int(len)) => {
                    record.piece_len =
                        u32::try_from(len).map_err(|_| invalid())?;
                }
                (b"piece_count", Value::Int(count)) => {
                    record.piece_count =
                        usize::try_from(count).map_err(|_| invalid())?;
                }
                (b"bitfield", Value::Bytes(bytes)) => {
                    record.bitfield = bytes;
                }
                (b"uploaded", Value::Int(n)) => {
                    record.uploaded =
                        u64::try_from(n).map_err(|_| invalid())?;
                }
                (b"downloaded", Value::Int(n)) => {
                    record.downloaded =
                        u64::try_from(n).map_err(|_| invalid())?;
                }
                (b"peers_hint", Value::Bytes(bytes)) => {
                    record.peers_hint = decode_compact_peers(&bytes);
                }
                (key, value) => {
                    record.unknown.insert(key.to_vec(), value);
                }
            }
        }

        if record.piece_count == 0
            || record.bitfield.len() != (record.piece_count + 7) / 8
        {
            return Err(invalid());
        }
        Ok(record)
    }

    /// Encodes the record canonically: one dictionary, keys sorted.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries: BTreeMap<Vec<u8>, Value> = self.unknown.clone();
        entries.insert(
            b"infohash".to_vec(),
            Value::Bytes(self.info_hash.to_vec()),
        );
        entries.insert(
            b"piece_length".to_vec(),
            Value::Int(self.piece_len as i64),
        );
        entries.insert(
            b"piece_count".to_vec(),
            Value::Int(self.piece_count as i64),
        );
        entries.insert(
            b"bitfield".to_vec(),
            Value::Bytes(self.bitfield.clone()),
        );
        entries
            .insert(b"uploaded".to_vec(), Value::Int(self.uploaded as i64));
        entries.insert(
            b"downloaded".to_vec(),
            Value::Int(self.downloaded as i64),
        );
        entries.insert(
            b"peers_hint".to_vec(),
            Value::Bytes(encode_compact_peers(&self.peers_hint)),
        );

        let mut out = Vec::new();
        out.push(b'd');
        for (key, value) in &entries {
            write_bytes(&mut out, key);
            write_value(&mut out, value);
        }
        out.push(b'e');
        out
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path)?;
        Self::from_bytes(&buf)
    }

    /// Writes the record atomically: a torn write must not destroy the
    /// previous snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Canonical bencode encoding of a value: dictionary keys emitted in sorted
/// order regardless of their in-memory order.
fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bytes(bytes) => write_bytes(out, bytes),
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(list) => {
            out.push(b'l');
            for item in list {
                write_value(out, item);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            let sorted: BTreeMap<&Vec<u8>, &Value> = dict.iter().collect();
            out.push(b'd');
            for (key, value) in sorted {
                write_bytes(out, key);
                write_value(out, value);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
