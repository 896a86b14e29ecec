//! Tracker announce clients: HTTP (BEP 3, compact peer lists) and UDP
//! (BEP 15).
//!
//! Trackers are one of several peer address sources and are allowed to
//! fail; the torrent keeps a per tracker error streak and stops bothering
//! a tracker that keeps erroring.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use rand::Rng;
use tokio::{net::UdpSocket, time};
use url::Url;

use crate::{
    decode_compact_peers,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The BEP 15 magic constant identifying the UDP tracker protocol.
const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// A UDP tracker connection id may be reused for this long.
const UDP_CONNECTION_TTL: Duration = Duration::from_secs(60);

/// The retry schedule is 15 * 2^n seconds for n in 0..=MAX, per BEP 15.
const UDP_MAX_RETRANSMITS: u32 = 8;

const UDP_ACTION_CONNECT: u32 = 0;
const UDP_ACTION_ANNOUNCE: u32 = 1;
const UDP_ACTION_ERROR: u32 = 3;

/// How many peers we ask for in one announce.
const NUMWANT: u32 = 50;

/// The announce lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// A periodic re-announce.
    None,
    /// The torrent was just opened.
    Started,
    /// All pieces completed for the first time.
    Completed,
    /// Graceful shutdown.
    Stopped,
}

impl Event {
    fn http_value(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
        }
    }

    fn udp_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// One announce's parameters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we accept connections on.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

#[derive(Debug)]
pub(crate) struct AnnounceResponse {
    /// How long to wait before the next periodic announce.
    pub interval: Duration,
    /// A lower bound the tracker asks us to honor even for event announces.
    pub min_interval: Option<Duration>,
    pub peers: Vec<SocketAddr>,
}

enum Transport {
    Http,
    Udp,
}

/// One announce endpoint of a torrent.
pub(crate) struct Tracker {
    url: Url,
    transport: Transport,
    http_client: reqwest::Client,
    /// The cached BEP 15 connection id and when it was obtained.
    udp_connection: Option<(u64, Instant)>,
    /// Consecutive failed announces; the torrent gives up on a tracker past
    /// a threshold.
    pub error_streak: usize,
    /// The earliest time the tracker wants to hear from us again.
    pub next_announce: Option<Instant>,
}

impl Tracker {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid tracker url: {}", e)))?;
        let transport = match url.scheme() {
            "http" | "https" => Transport::Http,
            "udp" => Transport::Udp,
            scheme => {
                return Err(Error::Config(format!(
                    "unsupported tracker scheme: {}",
                    scheme
                )))
            }
        };
        Ok(Self {
            url,
            transport,
            http_client: reqwest::Client::new(),
            udp_connection: None,
            error_streak: 0,
            next_announce: None,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub async fn announce(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        let result = match self.transport {
            Transport::Http => self.announce_http(announce).await,
            Transport::Udp => self.announce_udp(announce).await,
        };
        match &result {
            Ok(response) => {
                log::info!(
                    "Tracker {} returned {} peers, interval {:?}",
                    self.url,
                    response.peers.len(),
                    response.interval
                );
                self.error_streak = 0;
            }
            Err(e) => {
                self.error_streak += 1;
                log::warn!(
                    "Tracker {} announce error ({} in a row): {}",
                    self.url,
                    self.error_streak,
                    e
                );
            }
        }
        result
    }

    async fn announce_http(
        &self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        // the info hash and peer id are raw bytes and must be percent
        // encoded by hand; serializing them through a query builder would
        // mangle them
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1&numwant={}",
            percent_encode(&announce.info_hash, NON_ALPHANUMERIC),
            percent_encode(&announce.peer_id, NON_ALPHANUMERIC),
            announce.port,
            announce.uploaded,
            announce.downloaded,
            announce.left,
            NUMWANT,
        );
        if let Some(event) = announce.event.http_value() {
            query.push_str("&event=");
            query.push_str(event);
        }

        let separator = if self.url.query().is_some() { '&' } else { '?' };
        let url = format!("{}{}{}", self.url, separator, query);

        let body = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| Error::Tracker(e.to_string()))?;

        let response: HttpResponse = serde_bencode::from_bytes(&body)
            .map_err(|e| Error::Tracker(format!("malformed response: {}", e)))?;

        if let Some(reason) = response.failure_reason {
            return Err(Error::Tracker(reason));
        }

        let peers = response
            .peers
            .as_ref()
            .map(|compact| decode_compact_peers(compact))
            .unwrap_or_default();
        Ok(AnnounceResponse {
            interval: Duration::from_secs(
                response.interval.unwrap_or(1800).max(0) as u64,
            ),
            min_interval: response
                .min_interval
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
            peers,
        })
    }

    async fn announce_udp(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::Tracker("url has no host".into()))?;
        let port = self
            .url
            .port()
            .ok_or_else(|| Error::Tracker("url has no port".into()))?;
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::Tracker("host did not resolve".into()))?;

        let mut socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&addr).await?;

        let connection_id = self.udp_connect(&mut socket).await?;

        let request = |txn: u32| {
            let mut buf = Vec::with_capacity(98);
            buf.extend_from_slice(&connection_id.to_be_bytes());
            buf.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
            buf.extend_from_slice(&txn.to_be_bytes());
            buf.extend_from_slice(&announce.info_hash);
            buf.extend_from_slice(&announce.peer_id);
            buf.extend_from_slice(&announce.downloaded.to_be_bytes());
            buf.extend_from_slice(&announce.left.to_be_bytes());
            buf.extend_from_slice(&announce.uploaded.to_be_bytes());
            buf.extend_from_slice(&announce.event.udp_value().to_be_bytes());
            // ip 0 (use the sender address), a random key, numwant, port
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&rand::thread_rng().gen::<u32>().to_be_bytes());
            buf.extend_from_slice(&NUMWANT.to_be_bytes());
            buf.extend_from_slice(&announce.port.to_be_bytes());
            buf
        };

        let payload =
            udp_exchange(&mut socket, request, UDP_ACTION_ANNOUNCE).await?;
        if payload.len() < 12 {
            return Err(Error::Tracker("short announce response".into()));
        }
        let interval = u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]);
        // leechers and seeders counts are informational only
        let peers = decode_compact_peers(&payload[12..]);
        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval as u64),
            min_interval: None,
            peers,
        })
    }

    /// Obtains (or reuses) a BEP 15 connection id.
    async fn udp_connect(&mut self, socket: &mut UdpSocket) -> Result<u64> {
        if let Some((id, obtained_at)) = self.udp_connection {
            if obtained_at.elapsed() < UDP_CONNECTION_TTL {
                return Ok(id);
            }
        }

        let request = |txn: u32| {
            let mut buf = Vec::with_capacity(16);
            buf.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
            buf.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
            buf.extend_from_slice(&txn.to_be_bytes());
            buf
        };
        let payload =
            udp_exchange(socket, request, UDP_ACTION_CONNECT).await?;
        if payload.len() < 8 {
            return Err(Error::Tracker("short connect response".into()));
        }
        let connection_id = u64::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4],
            payload[5], payload[6], payload[7],
        ]);
        self.udp_connection = Some((connection_id, Instant::now()));
        Ok(connection_id)
    }
}

/// Sends a request and awaits the matching response, retransmitting on the
/// BEP 15 schedule (15 * 2^n seconds). Each attempt uses a fresh random
/// transaction id; responses with a stale id are dropped.
async fn udp_exchange(
    socket: &mut UdpSocket,
    mut request: impl FnMut(u32) -> Vec<u8>,
    expected_action: u32,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    for n in 0..=UDP_MAX_RETRANSMITS {
        let transaction_id: u32 = rand::thread_rng().gen();
        let packet = request(transaction_id);
        socket.send(&packet).await?;

        let deadline = Duration::from_secs(15 * (1 << n));
        let received = loop {
            match time::timeout(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    if len < 8 {
                        continue;
                    }
                    let action = u32::from_be_bytes([
                        buf[0], buf[1], buf[2], buf[3],
                    ]);
                    let txn = u32::from_be_bytes([
                        buf[4], buf[5], buf[6], buf[7],
                    ]);
                    if txn != transaction_id {
                        // a delayed response to an earlier attempt
                        continue;
                    }
                    if action == UDP_ACTION_ERROR {
                        let message =
                            String::from_utf8_lossy(&buf[8..len]).into_owned();
                        return Err(Error::Tracker(message));
                    }
                    if action != expected_action {
                        return Err(Error::Tracker(format!(
                            "unexpected action {}",
                            action
                        )));
                    }
                    break Some(buf[8..len].to_vec());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break None,
            }
        };
        if let Some(payload) = received {
            return Ok(payload);
        }
        log::debug!("UDP tracker attempt {} timed out", n);
    }
    Err(Error::Timeout)
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    /// The compact peer list: 6 bytes per peer.
    peers: Option<serde_bytes::ByteBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn announce_params() -> Announce {
        Announce {
            info_hash: [0x12; 20],
            peer_id: *b"-RD0010-012345678901",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Event::Started,
        }
    }

    #[tokio::test]
    async fn test_http_announce_compact_peers() {
        let body = b"d8:intervali1800e12:min intervali900e5:peers12:\
                     \x01\x02\x03\x04\x1a\xe1\x05\x06\x07\x08\xc8\xd5e";
        let _mock = mockito::mock("GET", mockito::Matcher::Regex(
            "/announce.*".into(),
        ))
        .match_query(mockito::Matcher::Regex("event=started".into()))
        .with_body(&body[..])
        .create();

        let mut tracker =
            Tracker::new(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let response = tracker.announce(&announce_params()).await.unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.min_interval, Some(Duration::from_secs(900)));
        assert_eq!(
            response.peers,
            vec![
                "1.2.3.4:6881".parse::<SocketAddr>().unwrap(),
                "5.6.7.8:51413".parse().unwrap(),
            ]
        );
        assert_eq!(tracker.error_streak, 0);
    }

    #[tokio::test]
    async fn test_http_announce_failure_reason() {
        let _mock = mockito::mock(
            "GET",
            mockito::Matcher::Regex("/announce.*".into()),
        )
        .with_body(&b"d14:failure reason12:unregisterede"[..])
        .create();

        let mut tracker =
            Tracker::new(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        match tracker.announce(&announce_params()).await {
            Err(Error::Tracker(reason)) => {
                assert_eq!(reason, "unregistered")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(tracker.error_streak, 1);
    }

    #[tokio::test]
    async fn test_udp_announce_roundtrip() {
        // a miniature BEP 15 tracker serving exactly one client
        let mut server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let served = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];

            // connect round
            let (len, client) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buf[..8], &UDP_PROTOCOL_ID.to_be_bytes());
            assert_eq!(&buf[8..12], &UDP_ACTION_CONNECT.to_be_bytes());
            let txn = buf[12..16].to_vec();
            let mut reply = Vec::new();
            reply.extend_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&txn);
            reply.extend_from_slice(&0xdead_beef_u64.to_be_bytes());
            server.send_to(&reply, &client).await.unwrap();

            // announce round
            let (len, client) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            assert_eq!(&buf[..8], &0xdead_beef_u64.to_be_bytes());
            assert_eq!(&buf[8..12], &UDP_ACTION_ANNOUNCE.to_be_bytes());
            // event "started" is code 2
            assert_eq!(&buf[80..84], &2u32.to_be_bytes());
            let txn = buf[12..16].to_vec();
            let mut reply = Vec::new();
            reply.extend_from_slice(&UDP_ACTION_ANNOUNCE.to_be_bytes());
            reply.extend_from_slice(&txn);
            reply.extend_from_slice(&900u32.to_be_bytes()); // interval
            reply.extend_from_slice(&1u32.to_be_bytes()); // leechers
            reply.extend_from_slice(&2u32.to_be_bytes()); // seeders
            reply.extend_from_slice(&[9, 9, 9, 9, 0x1a, 0xe1]);
            server.send_to(&reply, &client).await.unwrap();
        });

        let mut tracker =
            Tracker::new(&format!("udp://{}", server_addr)).unwrap();
        let response = tracker.announce(&announce_params()).await.unwrap();

        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(
            response.peers,
            vec!["9.9.9.9:6881".parse::<SocketAddr>().unwrap()]
        );
        served.await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_tracker_error_response() {
        let mut server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (_, client) = server.recv_from(&mut buf).await.unwrap();
            let txn = buf[12..16].to_vec();
            let mut reply = Vec::new();
            reply.extend_from_slice(&UDP_ACTION_ERROR.to_be_bytes());
            reply.extend_from_slice(&txn);
            reply.extend_from_slice(b"go away");
            server.send_to(&reply, &client).await.unwrap();
        });

        let mut tracker =
            Tracker::new(&format!("udp://{}", server_addr)).unwrap();
        match tracker.announce(&announce_params()).await {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "go away"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        assert!(Tracker::new("ws://tracker/announce").is_err());
        assert!(Tracker::new("not a url").is_err());
    }
}
