//! The framed codecs for the BitTorrent wire protocol: the fixed layout
//! handshake and the length prefixed peer messages (BEP 3), including the
//! extended message envelope (BEP 10).

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, ProtocolError},
    Bitfield, BlockInfo, PeerId, Sha1Hash,
};

/// The protocol string of the standard BitTorrent handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// No legitimate message comes close to this: the largest regular messages
/// are blocks (16 KiB + 13 bytes) and bitfields of large torrents. Anything
/// beyond this is treated as a protocol violation rather than buffered.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// The reserved byte/mask of the extension protocol bit (bit 20 counted from
/// the most significant bit of the eight reserved bytes).
const EXTENDED_BYTE: usize = 5;
const EXTENDED_MASK: u8 = 0x10;

#[derive(Clone, Copy)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved capability bits.
    pub reserved: [u8; 8],
    /// The torrent's info hash.
    pub info_hash: Sha1Hash,
    /// The remote's arbitrary peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake, advertising the extension protocol.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENDED_BYTE] |= EXTENDED_MASK;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote supports BEP 10 extended messages.
    pub fn supports_extended(&self) -> bool {
        self.reserved[EXTENDED_BYTE] & EXTENDED_MASK != 0
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("reserved", &hex::encode(self.reserved))
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.extend_from_slice(&handshake.prot);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash);
        buf.extend_from_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // reject before waiting for the full message so garbage doesn't sit
        // in the buffer until the handshake timeout
        if buf[0] != 19 {
            return Err(ProtocolError::InvalidHandshake.into());
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(ProtocolError::InvalidHandshake.into());
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids of BEP 3 plus the DHT port and BEP 10 extended messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            20 => Ok(Self::Extended),
            id => Err(id),
        }
    }
}

/// A decoded wire message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The remote's DHT node port (BEP 5). Parsed but unused as the engine
    /// doesn't run a DHT node.
    Port(u16),
    /// A BEP 10 extended message: the sub-id from the negotiated `m` map and
    /// the raw payload.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have(_) => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                // the variants above all have an id
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Self::Error> {
        // messages with ids unknown to us are consumed and skipped without
        // surfacing, so this loops until a known message or an incomplete
        // frame is found
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let msg_len =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if msg_len > MAX_FRAME_LEN {
                return Err(ProtocolError::MessageTooLarge.into());
            }
            if (buf.len() as u32) < 4 + msg_len {
                buf.reserve(4 + msg_len as usize - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            if msg_len == 0 {
                return Ok(Some(Message::KeepAlive));
            }

            let id = buf.get_u8();
            let payload_len = msg_len as usize - 1;
            let id = match MessageId::try_from(id) {
                Ok(id) => id,
                Err(id) => {
                    log::debug!("Dropping message with unknown id {}", id);
                    buf.advance(payload_len);
                    continue;
                }
            };

            let check_len = |expected: usize| {
                if payload_len == expected {
                    Ok(())
                } else {
                    Err(Error::from(ProtocolError::InvalidMessage))
                }
            };

            let msg = match id {
                MessageId::Choke => {
                    check_len(0)?;
                    Message::Choke
                }
                MessageId::Unchoke => {
                    check_len(0)?;
                    Message::Unchoke
                }
                MessageId::Interested => {
                    check_len(0)?;
                    Message::Interested
                }
                MessageId::NotInterested => {
                    check_len(0)?;
                    Message::NotInterested
                }
                MessageId::Have => {
                    check_len(4)?;
                    Message::Have(buf.get_u32())
                }
                MessageId::Bitfield => {
                    let mut bytes = vec![0; payload_len];
                    buf.copy_to_slice(&mut bytes);
                    Message::Bitfield(Bitfield::from_vec(bytes))
                }
                MessageId::Request => {
                    check_len(12)?;
                    Message::Request(BlockInfo {
                        piece_index: buf.get_u32() as usize,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                MessageId::Block => {
                    if payload_len < 8 {
                        return Err(ProtocolError::InvalidMessage.into());
                    }
                    let piece_index = buf.get_u32();
                    let offset = buf.get_u32();
                    let mut data = vec![0; payload_len - 8];
                    buf.copy_to_slice(&mut data);
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                MessageId::Cancel => {
                    check_len(12)?;
                    Message::Cancel(BlockInfo {
                        piece_index: buf.get_u32() as usize,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                MessageId::Port => {
                    check_len(2)?;
                    Message::Port(buf.get_u16())
                }
                MessageId::Extended => {
                    if payload_len < 1 {
                        return Err(ProtocolError::InvalidMessage.into());
                    }
                    let id = buf.get_u8();
                    let mut payload = vec![0; payload_len - 1];
                    buf.copy_to_slice(&mut payload);
                    Message::Extended { id, payload }
                }
            };
            return Ok(Some(msg));
        }
    }
}
