//! Parsing of `.torrent` metainfo files and magnet URIs into the engine's
//! normalized torrent description.

use std::path::PathBuf;

use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::{Error, Result},
    storage_info::FileInfo,
    PieceIndex, Sha1Hash,
};

/// The parsed and validated content description of a torrent.
///
/// Constructed either from a `.torrent` file or from the raw `info` dictionary
/// downloaded from peers when bootstrapping from a magnet URI.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, used as the download file or directory name.
    pub name: String,
    /// The SHA-1 hash of the raw bencoded `info` dictionary, identifying the
    /// torrent in the swarm.
    pub info_hash: Sha1Hash,
    /// The concatenation of each piece's expected SHA-1 hash, 20 bytes per
    /// piece.
    pub piece_hashes: Vec<u8>,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// All files in the torrent in their canonical order, with their offsets
    /// in the single contiguous byte stream the pieces cover. A single file
    /// torrent has exactly one entry.
    pub files: Vec<FileInfo>,
    /// The flattened announce list. Empty when bootstrapped from the swarm.
    pub trackers: Vec<String>,
    /// The raw bencoded `info` dictionary, kept for serving the metadata
    /// extension to other magnet bootstrapped peers.
    pub info_bytes: Vec<u8>,
}

impl Metainfo {
    /// Parses a `.torrent` file's content.
    ///
    /// The info hash is computed over the raw bytes of the `info` value as it
    /// appears in the input, so dictionaries with keys unknown to us hash the
    /// same way other clients see them.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        let info_span = info_span(buf)?;
        let info_bytes = buf[info_span.0..info_span.1].to_vec();
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&Sha1::digest(&info_bytes));

        let mut trackers = Vec::new();
        if let Some(tiers) = raw.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(&url) {
                        trackers.push(url);
                    }
                }
            }
        }
        if let Some(announce) = raw.announce {
            if !trackers.contains(&announce) {
                trackers.push(announce);
            }
        }

        Self::build(raw.info, info_hash, trackers, info_bytes)
    }

    /// Constructs the metainfo from a raw bencoded `info` dictionary, as
    /// downloaded from peers via the metadata extension. The caller must have
    /// verified that the buffer hashes to the expected info hash.
    pub fn from_info_bytes(buf: &[u8]) -> Result<Self> {
        let info: RawInfo =
            serde_bencode::from_bytes(buf).map_err(|_| Error::MetadataInvalid)?;
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&Sha1::digest(buf));
        Self::build(info, info_hash, Vec::new(), buf.to_vec())
    }

    fn build(
        info: RawInfo,
        info_hash: Sha1Hash,
        trackers: Vec<String>,
        info_bytes: Vec<u8>,
    ) -> Result<Self> {
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::Config(
                "piece hash string length is not a multiple of 20".into(),
            ));
        }
        if info.piece_length == 0 || info.piece_length > u32::MAX as u64 {
            return Err(Error::Config("invalid piece length".into()));
        }
        let piece_len = info.piece_length as u32;
        let piece_count = info.pieces.len() / 20;

        let files = match (info.length, info.files) {
            (Some(len), None) => {
                if len == 0 {
                    return Err(Error::Config("torrent length is zero".into()));
                }
                vec![FileInfo {
                    path: sanitize_path(&[info.name.clone()])?,
                    len,
                    torrent_offset: 0,
                }]
            }
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(Error::Config("torrent has no files".into()));
                }
                let mut files = Vec::with_capacity(raw_files.len());
                let mut torrent_offset = 0;
                for file in raw_files {
                    if file.length == 0 {
                        return Err(Error::Config(
                            "file length is zero".into(),
                        ));
                    }
                    files.push(FileInfo {
                        path: sanitize_path(&file.path)?,
                        len: file.length,
                        torrent_offset,
                    });
                    torrent_offset += file.length;
                }
                files
            }
            _ => {
                return Err(Error::Config(
                    "exactly one of `length` and `files` must be present"
                        .into(),
                ))
            }
        };

        let total_len: u64 = files.iter().map(|f| f.len).sum();
        let expected_piece_count = (total_len + info.piece_length - 1)
            / info.piece_length;
        if expected_piece_count != piece_count as u64 {
            return Err(Error::Config(format!(
                "torrent length {} does not match {} pieces of length {}",
                total_len, piece_count, piece_len
            )));
        }

        Ok(Self {
            name: info.name,
            info_hash,
            piece_hashes: info.pieces,
            piece_len,
            files,
            trackers,
            info_bytes,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// The total length of the download, in bytes.
    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// The expected hash of the piece at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[index * 20..index * 20 + 20]);
        hash
    }

    /// True if the torrent contains more than one file, in which case the
    /// download is placed in its own directory named after the torrent.
    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

/// Joins and validates the path components of a torrent file entry. Absolute
/// components and parent directory references are rejected so a hostile
/// torrent cannot escape the download directory.
fn sanitize_path(components: &[String]) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for component in components {
        if component.is_empty()
            || component == ".."
            || component.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(Error::Config(format!(
                "invalid path component: {:?}",
                component
            )));
        }
        path.push(component);
    }
    if path.as_os_str().is_empty() {
        return Err(Error::Config("empty file path".into()));
    }
    Ok(path)
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

/// Returns the byte range `[start, end)` that the raw `info` value occupies in
/// a bencoded metainfo buffer.
fn info_span(buf: &[u8]) -> Result<(usize, usize)> {
    if buf.first() != Some(&b'd') {
        return Err(Error::Config("metainfo is not a dictionary".into()));
    }
    let mut pos = 1;
    while pos < buf.len() && buf[pos] != b'e' {
        let key_len = bencode_value_len(&buf[pos..])?;
        let key = &buf[pos..pos + key_len];
        pos += key_len;
        let value_len = bencode_value_len(&buf[pos..])?;
        if key == b"4:info" {
            return Ok((pos, pos + value_len));
        }
        pos += value_len;
    }
    Err(Error::Config("metainfo has no info dictionary".into()))
}

/// Returns the length in bytes of the first complete bencode value in the
/// buffer. Used to slice raw values out of a buffer without decoding them.
pub(crate) fn bencode_value_len(buf: &[u8]) -> Result<usize> {
    let malformed = || Error::Config("malformed bencode value".into());
    match buf.first().ok_or_else(malformed)? {
        b'i' => {
            let end =
                buf.iter().position(|&b| b == b'e').ok_or_else(malformed)?;
            Ok(end + 1)
        }
        b'l' | b'd' => {
            let mut pos = 1;
            while *buf.get(pos).ok_or_else(malformed)? != b'e' {
                pos += bencode_value_len(&buf[pos..])?;
            }
            Ok(pos + 1)
        }
        b'0'..=b'9' => {
            let colon =
                buf.iter().position(|&b| b == b':').ok_or_else(malformed)?;
            let len: usize = std::str::from_utf8(&buf[..colon])
                .map_err(|_| malformed())?
                .parse()
                .map_err(|_| malformed())?;
            if colon + 1 + len > buf.len() {
                return Err(malformed());
            }
            Ok(colon + 1 + len)
        }
        _ => Err(malformed()),
    }
}

/// The components of a parsed magnet URI (BEP 9): the info hash to bootstrap
/// from, an optional display name, and any tracker URLs.
#[derive(Clone, Debug)]
pub struct MagnetUri {
    pub info_hash: Sha1Hash,
    pub name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetUri {
    /// Parses a `magnet:?xt=urn:btih:...` URI. Both the 40 character hex and
    /// the 32 character base32 info hash encodings are accepted.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| Error::Config(format!("invalid magnet URI: {}", e)))?;
        if url.scheme() != "magnet" {
            return Err(Error::Config("not a magnet URI".into()));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let urn = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| {
                            Error::Config(format!("unsupported xt: {}", value))
                        })?;
                    info_hash = Some(parse_info_hash(urn)?);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                // x.pe, ws and friends are not supported
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| {
                Error::Config("magnet URI has no btih xt".into())
            })?,
            name,
            trackers,
        })
    }
}

fn parse_info_hash(urn: &str) -> Result<Sha1Hash> {
    let mut info_hash = [0; 20];
    match urn.len() {
        40 => {
            let bytes = hex::decode(urn).map_err(|_| {
                Error::Config("invalid hex info hash".into())
            })?;
            info_hash.copy_from_slice(&bytes);
        }
        32 => {
            let bytes = base32_decode(urn.as_bytes()).ok_or_else(|| {
                Error::Config("invalid base32 info hash".into())
            })?;
            info_hash.copy_from_slice(&bytes);
        }
        _ => {
            return Err(Error::Config(format!(
                "info hash has invalid length {}",
                urn.len()
            )))
        }
    }
    Ok(info_hash)
}

/// RFC 4648 base32 without padding, as used for magnet info hashes: 32
/// characters decode to exactly 20 bytes.
fn base32_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut bits = 0;
    for &c in input {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Hand-built single file metainfo: name "a", piece length 16384, one
    /// piece hash of 20 'x' bytes, length 16000.
    fn single_file_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker/here4:info");
        buf.extend_from_slice(&info_dict());
        buf.push(b'e');
        buf
    }

    fn info_dict() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi16000e4:name1:a12:piece lengthi16384e6:pieces20:");
        info.extend_from_slice(&[b'x'; 20]);
        info.push(b'e');
        info
    }

    #[test]
    fn test_parse_single_file() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(metainfo.name, "a");
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.total_len(), 16000);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.trackers, vec!["http://tracker/here"]);
        assert!(!metainfo.is_archive());
        assert_eq!(metainfo.piece_hash(0), [b'x'; 20]);
    }

    #[test]
    fn test_info_hash_covers_raw_info_bytes() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        let expected: [u8; 20] = Sha1::digest(&info_dict()).into();
        assert_eq!(metainfo.info_hash, expected);
        assert_eq!(metainfo.info_bytes, info_dict());
    }

    #[test]
    fn test_from_info_bytes_matches_file_parse() {
        let from_file = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        let from_info = Metainfo::from_info_bytes(&info_dict()).unwrap();
        assert_eq!(from_file.info_hash, from_info.info_hash);
        assert_eq!(from_file.name, from_info.name);
        assert_eq!(from_file.total_len(), from_info.total_len());
        assert!(from_info.trackers.is_empty());
    }

    #[test]
    fn test_multi_file_offsets() {
        let mut info = Vec::new();
        info.extend_from_slice(b"d5:filesl");
        info.extend_from_slice(b"d6:lengthi11e4:pathl1:a1:bee");
        info.extend_from_slice(b"d6:lengthi5e4:pathl1:cee");
        info.extend_from_slice(b"e4:name1:n12:piece lengthi16384e6:pieces20:");
        info.extend_from_slice(&[0u8; 20]);
        info.push(b'e');
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:info");
        buf.extend_from_slice(&info);
        buf.push(b'e');

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.is_archive());
        assert_eq!(metainfo.files.len(), 2);
        assert_eq!(metainfo.files[0].torrent_offset, 0);
        assert_eq!(metainfo.files[0].len, 11);
        assert_eq!(metainfo.files[1].torrent_offset, 11);
        assert_eq!(metainfo.total_len(), 16);
    }

    #[test]
    fn test_piece_count_mismatch_is_rejected() {
        // 40000 bytes need 3 pieces of 16384, but only one hash is present
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi40000e4:name1:a12:piece lengthi16384e6:pieces20:",
        );
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_hostile_path_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod5:filesl");
        buf.extend_from_slice(b"d6:lengthi5e4:pathl2:..1:aee");
        buf.extend_from_slice(b"e4:name1:n12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_bencode_value_len() {
        assert_eq!(bencode_value_len(b"i42e").unwrap(), 4);
        assert_eq!(bencode_value_len(b"4:spam").unwrap(), 6);
        assert_eq!(bencode_value_len(b"l4:spami42ee").unwrap(), 12);
        assert_eq!(bencode_value_len(b"d1:ai1ee trailing").unwrap(), 8);
        assert!(bencode_value_len(b"x").is_err());
        assert!(bencode_value_len(b"10:short").is_err());
    }

    #[test]
    fn test_parse_magnet_hex() {
        let uri = "magnet:?xt=urn:btih:000102030405060708090a0b0c0d0e0f10111213\
                   &dn=test+name&tr=http%3A%2F%2Ftracker%2Fannounce";
        let magnet = MagnetUri::parse(uri).unwrap();
        assert_eq!(
            magnet.info_hash,
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19]
        );
        assert_eq!(magnet.name.as_deref(), Some("test name"));
        assert_eq!(magnet.trackers, vec!["http://tracker/announce"]);
    }

    #[test]
    fn test_parse_magnet_base32() {
        // base32 of twenty zero bytes
        let uri = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let magnet = MagnetUri::parse(uri).unwrap();
        assert_eq!(magnet.info_hash, [0; 20]);
    }

    #[test]
    fn test_parse_magnet_without_xt_fails() {
        assert!(MagnetUri::parse("magnet:?dn=name").is_err());
    }
}
