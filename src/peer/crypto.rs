//! The message stream encryption handshake (MSE/PE) and the RC4 stream
//! wrapper it produces.
//!
//! The handshake is a Diffie-Hellman exchange over a fixed 768 bit group
//! followed by an RC4 obfuscated negotiation, keyed per direction and tied to
//! the torrent's info hash (the "SKEY"). Once negotiated, the wrapper is
//! transparent to the peer session: it reads and writes plaintext BitTorrent
//! messages and the wire carries RC4 output.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BufMut, BytesMut};
use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, ProtocolError, Result},
    Sha1Hash,
};

/// The 768 bit safe prime all MSE implementations share, big endian.
const DH_PRIME: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

const DH_GENERATOR: u32 = 2;

/// The length of a serialized public key.
const DH_PUBKEY_LEN: usize = 96;

/// The verification constant, eight zero bytes.
const VC: [u8; 8] = [0; 8];

/// Crypto method bits exchanged in `crypto_provide`/`crypto_select`.
const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Both directions discard this much RC4 keystream before use, guarding
/// against the known weak start of the cipher.
const KEYSTREAM_DISCARD: usize = 1024;

/// Padding fields of the handshake are at most this long.
const MAX_PAD_LEN: usize = 512;

/// A plain RC4 cipher. Encryption and decryption are the same operation.
#[derive(Clone)]
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, b) in state.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    /// Creates the cipher and discards the first part of its keystream.
    fn new_discarded(key: &[u8]) -> Self {
        let mut rc4 = Self::new(key);
        let mut discard = [0u8; KEYSTREAM_DISCARD];
        rc4.apply(&mut discard);
        rc4
    }

    fn apply(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[(self
                .state[self.i as usize]
                .wrapping_add(self.state[self.j as usize]))
                as usize];
            *b ^= k;
        }
    }
}

fn sha1(parts: &[&[u8]]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0; 20];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Derives one direction's RC4 key: SHA1(prefix || S || SKEY).
fn derive_key(prefix: &[u8], secret: &[u8], skey: &[u8]) -> Sha1Hash {
    sha1(&[prefix, secret, skey])
}

/// Generates a private exponent and the corresponding serialized public key.
fn dh_keypair() -> (BigUint, [u8; DH_PUBKEY_LEN]) {
    // 160 bits of private key are sufficient for this group
    let mut private = [0u8; 20];
    rand::thread_rng().fill(&mut private[..]);
    let private = BigUint::from_bytes_be(&private);
    let public = BigUint::from(DH_GENERATOR)
        .modpow(&private, &BigUint::from_bytes_be(&DH_PRIME));
    (private, to_fixed_len(&public))
}

/// Computes the shared secret from our private exponent and the remote's
/// public key, serialized to the fixed 96 byte length.
fn dh_shared_secret(
    private: &BigUint,
    remote_public: &[u8],
) -> [u8; DH_PUBKEY_LEN] {
    let secret = BigUint::from_bytes_be(remote_public)
        .modpow(private, &BigUint::from_bytes_be(&DH_PRIME));
    to_fixed_len(&secret)
}

fn to_fixed_len(n: &BigUint) -> [u8; DH_PUBKEY_LEN] {
    let bytes = n.to_bytes_be();
    debug_assert!(bytes.len() <= DH_PUBKEY_LEN);
    let mut out = [0u8; DH_PUBKEY_LEN];
    out[DH_PUBKEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn random_pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=MAX_PAD_LEN);
    let mut pad = vec![0u8; len];
    rng.fill(&mut pad[..]);
    pad
}

/// Runs the initiator side of the handshake. `ia` is the initial payload
/// carried inside the handshake, in our case the plaintext BitTorrent
/// handshake, so no extra round trip is spent on it.
pub(crate) async fn initiate<S>(
    mut stream: S,
    info_hash: Sha1Hash,
    ia: &[u8],
) -> Result<EncryptedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // step 1: exchange public keys
    let (private, public) = dh_keypair();
    let mut first = public.to_vec();
    first.extend_from_slice(&random_pad());
    stream.write_all(&first).await?;

    let mut remote_public = [0u8; DH_PUBKEY_LEN];
    stream.read_exact(&mut remote_public).await?;
    let secret = dh_shared_secret(&private, &remote_public);

    // step 2: send the obfuscated negotiation
    let mut send = Rc4::new_discarded(&derive_key(b"keyA", &secret, &info_hash));
    let recv_base =
        Rc4::new_discarded(&derive_key(b"keyB", &secret, &info_hash));

    let mut msg = Vec::with_capacity(40 + 16 + 4 + ia.len());
    msg.extend_from_slice(&sha1(&[b"req1", &secret]));
    let mut obfuscated_skey = sha1(&[b"req2", &info_hash]);
    for (b, x) in obfuscated_skey
        .iter_mut()
        .zip(sha1(&[b"req3", &secret]).iter())
    {
        *b ^= x;
    }
    msg.extend_from_slice(&obfuscated_skey);

    let mut crypt = Vec::with_capacity(16 + ia.len());
    crypt.extend_from_slice(&VC);
    crypt.extend_from_slice(&(CRYPTO_RC4 | CRYPTO_PLAINTEXT).to_be_bytes());
    // PadC is unused
    crypt.extend_from_slice(&0u16.to_be_bytes());
    crypt.extend_from_slice(&(ia.len() as u16).to_be_bytes());
    crypt.extend_from_slice(ia);
    send.apply(&mut crypt);
    msg.extend_from_slice(&crypt);
    stream.write_all(&msg).await?;
    stream.flush().await?;

    // step 3: find the encrypted VC in the reply. The remote's PadB may
    // still precede it and its length is unknown, so try every offset within
    // the padding window, each with a fresh keystream.
    let mut buf = BytesMut::with_capacity(MAX_PAD_LEN + 64);
    let mut recv = None;
    'sync: loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        let search_end = buf.len().min(MAX_PAD_LEN + VC.len());
        for offset in 0..=search_end.saturating_sub(VC.len()) {
            let mut candidate = recv_base.clone();
            let mut vc = [0u8; 8];
            vc.copy_from_slice(&buf[offset..offset + VC.len()]);
            candidate.apply(&mut vc);
            if vc == VC {
                buf.advance(offset + VC.len());
                recv = Some(candidate);
                break 'sync;
            }
        }
        if buf.len() >= MAX_PAD_LEN + VC.len() {
            return Err(ProtocolError::InvalidHandshake.into());
        }
    }
    let mut recv = recv.expect("synced without cipher");

    // crypto_select and PadD
    ensure(&mut stream, &mut buf, 4 + 2).await?;
    let mut tail = [0u8; 6];
    tail.copy_from_slice(&buf[..6]);
    buf.advance(6);
    recv.apply(&mut tail);
    let crypto_select = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let pad_len = u16::from_be_bytes([tail[4], tail[5]]) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(ProtocolError::InvalidHandshake.into());
    }
    ensure(&mut stream, &mut buf, pad_len).await?;
    let mut pad = vec![0u8; pad_len];
    pad.copy_from_slice(&buf[..pad_len]);
    buf.advance(pad_len);
    recv.apply(&mut pad);

    match crypto_select {
        CRYPTO_RC4 => {
            // any already buffered bytes are ciphertext of the message stream
            let mut read_ahead = buf.to_vec();
            recv.apply(&mut read_ahead);
            Ok(EncryptedStream::encrypted(stream, send, recv, read_ahead))
        }
        CRYPTO_PLAINTEXT => {
            Ok(EncryptedStream::plaintext(stream, buf.to_vec()))
        }
        _ => Err(ProtocolError::InvalidHandshake.into()),
    }
}

/// The result of accepting an encrypted incoming connection.
pub(crate) struct Accepted<S> {
    pub stream: EncryptedStream<S>,
    /// The info hash whose SKEY matched the handshake.
    pub info_hash: Sha1Hash,
    /// The decrypted initial payload, normally the remote's plaintext
    /// BitTorrent handshake. May be empty.
    pub initial_payload: Vec<u8>,
}

/// Runs the receiver side of the handshake for an incoming connection that
/// did not start with the plaintext protocol header. `skeys` are the info
/// hashes of all torrents we serve; the handshake identifies which one the
/// remote means.
pub(crate) async fn accept<S>(
    mut stream: S,
    skeys: &[Sha1Hash],
) -> Result<Accepted<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // step 1: exchange public keys
    let mut buf = BytesMut::with_capacity(DH_PUBKEY_LEN + MAX_PAD_LEN);
    ensure(&mut stream, &mut buf, DH_PUBKEY_LEN).await?;
    let mut remote_public = [0u8; DH_PUBKEY_LEN];
    remote_public.copy_from_slice(&buf[..DH_PUBKEY_LEN]);
    buf.advance(DH_PUBKEY_LEN);

    let (private, public) = dh_keypair();
    let mut reply = public.to_vec();
    reply.extend_from_slice(&random_pad());
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let secret = dh_shared_secret(&private, &remote_public);

    // step 2: locate the req1 marker that ends PadA
    let marker = sha1(&[b"req1", &secret]);
    let mut marker_pos = None;
    loop {
        if let Some(pos) = find(&buf, &marker) {
            if pos > MAX_PAD_LEN {
                return Err(ProtocolError::InvalidHandshake.into());
            }
            marker_pos = Some(pos);
            break;
        }
        if buf.len() >= MAX_PAD_LEN + marker.len() {
            break;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
    }
    let marker_pos =
        marker_pos.ok_or(Error::from(ProtocolError::InvalidHandshake))?;
    buf.advance(marker_pos + marker.len());

    // the obfuscated SKEY identifies the torrent
    ensure(&mut stream, &mut buf, 20).await?;
    let mut obfuscated_skey = [0u8; 20];
    obfuscated_skey.copy_from_slice(&buf[..20]);
    buf.advance(20);
    let req3 = sha1(&[b"req3", &secret]);
    for (b, x) in obfuscated_skey.iter_mut().zip(req3.iter()) {
        *b ^= x;
    }
    let info_hash = *skeys
        .iter()
        .find(|skey| sha1(&[b"req2", &skey[..]]) == obfuscated_skey)
        .ok_or(Error::from(ProtocolError::InvalidInfoHash))?;

    // the initiator encrypts with keyA, we decrypt with it and send keyB
    let mut recv =
        Rc4::new_discarded(&derive_key(b"keyA", &secret, &info_hash));
    let mut send =
        Rc4::new_discarded(&derive_key(b"keyB", &secret, &info_hash));

    // VC, crypto_provide, PadC
    ensure(&mut stream, &mut buf, 8 + 4 + 2).await?;
    let mut head = [0u8; 14];
    head.copy_from_slice(&buf[..14]);
    buf.advance(14);
    recv.apply(&mut head);
    if head[..8] != VC {
        return Err(ProtocolError::InvalidHandshake.into());
    }
    let crypto_provide =
        u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    let pad_len = u16::from_be_bytes([head[12], head[13]]) as usize;
    if pad_len > MAX_PAD_LEN {
        return Err(ProtocolError::InvalidHandshake.into());
    }
    ensure(&mut stream, &mut buf, pad_len + 2).await?;
    let mut pad = vec![0u8; pad_len + 2];
    pad.copy_from_slice(&buf[..pad_len + 2]);
    buf.advance(pad_len + 2);
    recv.apply(&mut pad);
    let ia_len =
        u16::from_be_bytes([pad[pad_len], pad[pad_len + 1]]) as usize;

    ensure(&mut stream, &mut buf, ia_len).await?;
    let mut initial_payload = vec![0u8; ia_len];
    initial_payload.copy_from_slice(&buf[..ia_len]);
    buf.advance(ia_len);
    recv.apply(&mut initial_payload);

    // prefer RC4, tolerate a plaintext-only initiator
    let crypto_select = if crypto_provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if crypto_provide & CRYPTO_PLAINTEXT != 0 {
        CRYPTO_PLAINTEXT
    } else {
        return Err(ProtocolError::InvalidHandshake.into());
    };

    // step 3: our reply is always RC4 encrypted, whatever was selected
    let mut reply = Vec::with_capacity(14);
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&crypto_select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    send.apply(&mut reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let stream = if crypto_select == CRYPTO_RC4 {
        let mut read_ahead = buf.to_vec();
        recv.apply(&mut read_ahead);
        EncryptedStream::encrypted(stream, send, recv, read_ahead)
    } else {
        EncryptedStream::plaintext(stream, buf.to_vec())
    };

    Ok(Accepted {
        stream,
        info_hash,
        initial_payload,
    })
}

/// Reads from the stream until the buffer holds at least `n` bytes.
async fn ensure<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    n: usize,
) -> Result<()> {
    while buf.len() < n {
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
        }
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A byte stream that transparently applies the negotiated obfuscation. In
/// plaintext mode (the remote selected no encryption) it only replays the
/// bytes buffered during the handshake.
pub(crate) struct EncryptedStream<S> {
    inner: S,
    send: Option<Rc4>,
    recv: Option<Rc4>,
    /// Plaintext bytes that were read past the end of the handshake.
    read_ahead: BytesMut,
    /// Ciphertext accepted by `poll_write` but not yet written through.
    write_buf: BytesMut,
}

impl<S> EncryptedStream<S> {
    fn encrypted(inner: S, send: Rc4, recv: Rc4, read_ahead: Vec<u8>) -> Self {
        Self {
            inner,
            send: Some(send),
            recv: Some(recv),
            read_ahead: BytesMut::from(&read_ahead[..]),
            write_buf: BytesMut::new(),
        }
    }

    fn plaintext(inner: S, read_ahead: Vec<u8>) -> Self {
        Self {
            inner,
            send: None,
            recv: None,
            read_ahead: BytesMut::from(&read_ahead[..]),
            write_buf: BytesMut::new(),
        }
    }

    /// Wraps a stream without any transformation. Used so sessions can treat
    /// plaintext and obfuscated connections uniformly.
    pub fn passthrough(inner: S) -> Self {
        Self::plaintext(inner, Vec::new())
    }
}

impl<S: AsyncWrite + Unpin> EncryptedStream<S> {
    /// Writes out as much of the pending ciphertext as the inner stream
    /// accepts.
    fn poll_drain(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = futures::ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.write_buf)
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for EncryptedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.read_ahead.is_empty() {
            let n = this.read_ahead.len().min(buf.len());
            buf[..n].copy_from_slice(&this.read_ahead[..n]);
            this.read_ahead.advance(n);
            return Poll::Ready(Ok(n));
        }
        let n = futures::ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(recv) = &mut this.recv {
            recv.apply(&mut buf[..n]);
        }
        Poll::Ready(Ok(n))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for EncryptedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // don't accept new bytes while previously encrypted ones are still
        // pending, so every byte passes the cipher exactly once and in order
        if !this.write_buf.is_empty() {
            futures::ready!(this.poll_drain(cx))?;
        }
        match &mut this.send {
            Some(send) => {
                let mut chunk = buf.to_vec();
                send.apply(&mut chunk);
                this.write_buf.extend_from_slice(&chunk);
                // best effort drain; the ciphertext is committed either way
                // and flushed by the next poll_write or poll_flush
                let _ = this.poll_drain(cx)?;
                Poll::Ready(Ok(buf.len()))
            }
            None => Pin::new(&mut this.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_rc4_known_vector() {
        // the classic "Key"/"Plaintext" RC4 test vector
        let mut rc4 = Rc4::new(b"Key");
        let mut data = *b"Plaintext";
        rc4.apply(&mut data);
        assert_eq!(
            data,
            [0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]
        );
    }

    #[test]
    fn test_rc4_roundtrip() {
        let mut enc = Rc4::new_discarded(b"some key");
        let mut dec = Rc4::new_discarded(b"some key");
        let mut data = b"the quick brown fox".to_vec();
        enc.apply(&mut data);
        assert_ne!(&data, b"the quick brown fox");
        dec.apply(&mut data);
        assert_eq!(&data, b"the quick brown fox");
    }

    #[test]
    fn test_key_derivation_is_directional() {
        let secret = [1u8; 96];
        let skey = [2u8; 20];
        let key_a = derive_key(b"keyA", &secret, &skey);
        let key_b = derive_key(b"keyB", &secret, &skey);
        assert_ne!(key_a, key_b);
        assert_eq!(key_a, derive_key(b"keyA", &secret, &skey));
    }

    #[test]
    fn test_dh_exchange_agrees() {
        let (private_a, public_a) = dh_keypair();
        let (private_b, public_b) = dh_keypair();
        assert_eq!(
            dh_shared_secret(&private_a, &public_b),
            dh_shared_secret(&private_b, &public_a)
        );
    }

    #[tokio::test]
    async fn test_handshake_end_to_end() {
        let info_hash = [7u8; 20];
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut accepted =
                accept(socket, &[[9u8; 20], info_hash]).await.unwrap();
            assert_eq!(accepted.info_hash, info_hash);
            assert_eq!(accepted.initial_payload, b"bt handshake stand-in");

            let mut buf = [0u8; 5];
            accepted.stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            accepted.stream.write_all(b"world").await.unwrap();
            accepted.stream.flush().await.unwrap();
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut stream =
            initiate(socket, info_hash, b"bt handshake stand-in")
                .await
                .unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_with_unknown_skey_fails() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            accept(socket, &[[9u8; 20]]).await
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        // ignore our own outcome, the interesting side is the acceptor
        let _ = initiate(socket, [7u8; 20], b"ia").await;
        assert!(acceptor.await.unwrap().is_err());
    }
}
