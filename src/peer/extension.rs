//! The extension protocol handshake (BEP 10) and the two extensions the
//! engine speaks over it: metadata exchange (BEP 9, `ut_metadata`) and peer
//! exchange (BEP 11, `ut_pex`).

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

use serde_bytes::ByteBuf;

use crate::{
    decode_compact_peers, encode_compact_peers,
    error::{Error, ProtocolError, Result},
    metainfo::bencode_value_len,
};

/// The sub-id of the extended handshake itself.
pub(crate) const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The sub-ids under which we expose our extensions in the `m` map. The
/// remote addresses us with these; we address the remote with the ids from
/// its own handshake.
pub(crate) const LOCAL_UT_METADATA_ID: u8 = 1;
pub(crate) const LOCAL_UT_PEX_ID: u8 = 2;

/// The size of one metadata piece (BEP 9).
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// The bencoded dictionary exchanged in the extended handshake.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the sub-ids the sender listens on. An id of
    /// 0 disables the extension.
    #[serde(default)]
    pub m: HashMap<String, u8>,
    /// The size of the `info` dictionary, sent by peers that have it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    /// The sender's listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// The number of requests the sender queues without dropping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
    /// Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// The address the sender sees us at, in compact form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yourip: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// Our side of the extended handshake.
    pub fn new_local(
        listen_port: Option<u16>,
        remote_ip: Option<IpAddr>,
        metadata_size: Option<i64>,
    ) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_metadata".into(), LOCAL_UT_METADATA_ID);
        m.insert("ut_pex".into(), LOCAL_UT_PEX_ID);
        Self {
            m,
            metadata_size,
            p: listen_port,
            reqq: Some(super::MAX_PEER_REQUEST_QUEUE_LEN as i64),
            v: Some(concat!("riptide ", env!("CARGO_PKG_VERSION")).into()),
            yourip: remote_ip.map(|ip| {
                ByteBuf::from(match ip {
                    IpAddr::V4(ip) => ip.octets().to_vec(),
                    IpAddr::V6(ip) => ip.octets().to_vec(),
                })
            }),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|_| ProtocolError::InvalidExtendedPayload.into())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    /// The sub-id the remote accepts metadata messages on, if any.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied().filter(|id| *id != 0)
    }

    /// The sub-id the remote accepts PEX messages on, if any.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.m.get("ut_pex").copied().filter(|id| *id != 0)
    }
}

/// A metadata exchange message (BEP 9). A `Data` message is a bencoded
/// header directly followed by the raw piece bytes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum UtMetadataMsg {
    Request {
        piece: u32,
    },
    Data {
        piece: u32,
        total_size: i64,
        payload: Vec<u8>,
    },
    Reject {
        piece: u32,
    },
}

#[derive(Deserialize, Serialize)]
struct UtMetadataHeader {
    msg_type: u8,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

impl UtMetadataMsg {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let malformed =
            || Error::from(ProtocolError::InvalidExtendedPayload);
        let header_len = bencode_value_len(buf)
            .map_err(|_| malformed())?;
        let header: UtMetadataHeader =
            serde_bencode::from_bytes(&buf[..header_len])
                .map_err(|_| malformed())?;
        match header.msg_type {
            0 => Ok(Self::Request {
                piece: header.piece,
            }),
            1 => Ok(Self::Data {
                piece: header.piece,
                total_size: header.total_size.ok_or_else(malformed)?,
                payload: buf[header_len..].to_vec(),
            }),
            2 => Ok(Self::Reject {
                piece: header.piece,
            }),
            _ => Err(malformed()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (header, payload) = match self {
            Self::Request { piece } => (
                UtMetadataHeader {
                    msg_type: 0,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
            Self::Data {
                piece,
                total_size,
                payload,
            } => (
                UtMetadataHeader {
                    msg_type: 1,
                    piece: *piece,
                    total_size: Some(*total_size),
                },
                Some(payload),
            ),
            Self::Reject { piece } => (
                UtMetadataHeader {
                    msg_type: 2,
                    piece: *piece,
                    total_size: None,
                },
                None,
            ),
        };
        let mut buf = serde_bencode::to_bytes(&header)?;
        if let Some(payload) = payload {
            buf.extend_from_slice(payload);
        }
        Ok(buf)
    }
}

/// A peer exchange message (BEP 11) with compact 6 byte address encoding.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct PexMessage {
    #[serde(default)]
    added: ByteBuf,
    /// One flag byte per added peer. We send zeroes and ignore incoming
    /// flags.
    #[serde(rename = "added.f", default)]
    added_f: ByteBuf,
    #[serde(default)]
    dropped: ByteBuf,
}

impl PexMessage {
    pub fn new(added: &[SocketAddr], dropped: &[SocketAddr]) -> Self {
        let added_compact = encode_compact_peers(added);
        Self {
            added_f: ByteBuf::from(vec![0u8; added_compact.len() / 6]),
            added: ByteBuf::from(added_compact),
            dropped: ByteBuf::from(encode_compact_peers(dropped)),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf)
            .map_err(|_| ProtocolError::InvalidExtendedPayload.into())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn added_peers(&self) -> Vec<SocketAddr> {
        decode_compact_peers(&self.added)
    }

    pub fn dropped_peers(&self) -> Vec<SocketAddr> {
        decode_compact_peers(&self.dropped)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extended_handshake_roundtrip() {
        let local = ExtendedHandshake::new_local(
            Some(6881),
            Some("10.0.0.1".parse().unwrap()),
            None,
        );
        let bytes = local.to_bytes().unwrap();
        let parsed = ExtendedHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ut_metadata_id(), Some(LOCAL_UT_METADATA_ID));
        assert_eq!(parsed.ut_pex_id(), Some(LOCAL_UT_PEX_ID));
        assert_eq!(parsed.p, Some(6881));
        assert_eq!(
            parsed.yourip.as_ref().unwrap().as_slice(),
            &[10, 0, 0, 1]
        );
    }

    #[test]
    fn test_extended_handshake_from_foreign_client() {
        // a typical handshake with keys we don't model, which must not break
        // parsing
        let raw = b"d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei31235e4:reqqi250e1:v4:test6:yourip4:\x7f\x00\x00\x01e";
        let parsed = ExtendedHandshake::from_bytes(raw).unwrap();
        assert_eq!(parsed.ut_metadata_id(), Some(3));
        assert_eq!(parsed.ut_pex_id(), Some(1));
        assert_eq!(parsed.metadata_size, Some(31235));
        assert_eq!(parsed.reqq, Some(250));
        assert_eq!(parsed.v.as_deref(), Some("test"));
    }

    #[test]
    fn test_zero_extension_id_means_disabled() {
        let raw = b"d1:md11:ut_metadatai0eee";
        let parsed = ExtendedHandshake::from_bytes(raw).unwrap();
        assert_eq!(parsed.ut_metadata_id(), None);
    }

    #[test]
    fn test_ut_metadata_request_roundtrip() {
        let msg = UtMetadataMsg::Request { piece: 2 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(&bytes[..], b"d8:msg_typei0e5:piecei2ee");
        assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ut_metadata_data_carries_trailing_payload() {
        let msg = UtMetadataMsg::Data {
            piece: 0,
            total_size: 5,
            payload: b"hello".to_vec(),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &b"d8:msg_typei1e5:piecei0e10:total_sizei5eehello"[..]
        );
        assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ut_metadata_reject_roundtrip() {
        let msg = UtMetadataMsg::Reject { piece: 1 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(UtMetadataMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ut_metadata_data_without_total_size_is_rejected() {
        assert!(UtMetadataMsg::from_bytes(b"d8:msg_typei1e5:piecei0ee").is_err());
    }

    #[test]
    fn test_pex_roundtrip() {
        let added: Vec<SocketAddr> =
            vec!["1.2.3.4:6881".parse().unwrap(), "5.6.7.8:51413".parse().unwrap()];
        let dropped: Vec<SocketAddr> = vec!["9.9.9.9:9999".parse().unwrap()];
        let msg = PexMessage::new(&added, &dropped);
        let bytes = msg.to_bytes().unwrap();
        let parsed = PexMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.added_peers(), added);
        assert_eq!(parsed.dropped_peers(), dropped);
        assert_eq!(parsed.added_f.len(), 2);
    }

    #[test]
    fn test_pex_empty() {
        let msg = PexMessage::new(&[], &[]);
        assert!(msg.is_empty());
        let parsed = PexMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(parsed.added_peers().is_empty());
    }
}
