//! The engine: owner of the disk task, the inbound connection listener and
//! all torrents, and the crate's public entry point.
//!
//! ```no_run
//! use riptide::{conf::Conf, engine, metainfo::Metainfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conf = Conf::new("/tmp/downloads");
//!     let (handle, mut alerts) = engine::start(conf).await?;
//!
//!     let metainfo = Metainfo::from_bytes(&std::fs::read("a.torrent")?)?;
//!     handle.add_torrent(engine::TorrentSource::Metainfo(metainfo), vec![])?;
//!
//!     while let Some(alert) = alerts.recv().await {
//!         println!("{:?}", alert);
//!     }
//!     Ok(())
//! }
//! ```

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures::{select, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::Conf,
    disk,
    error::{Error, Result},
    metainfo::{MagnetUri, Metainfo},
    peer::{
        codec::{Handshake, HandshakeCodec},
        crypto, Socket,
    },
    torrent::{Torrent, TorrentMsg, TorrentParams},
    Sha1Hash, TorrentId,
};

/// Where a torrent comes from: a parsed metainfo file, or a magnet link
/// whose metadata will be fetched from the swarm.
#[derive(Debug)]
pub enum TorrentSource {
    Metainfo(Metainfo),
    Magnet(MagnetUri),
}

/// The engine's user facing notifications.
#[derive(Debug)]
pub enum Alert {
    /// A torrent was registered and assigned an id.
    TorrentAdded { id: TorrentId, info_hash: Sha1Hash },
    /// A magnet bootstrapped torrent resolved its metadata.
    MetadataResolved { id: TorrentId, name: String },
    /// All pieces of the torrent completed and verified.
    TorrentCompleted { id: TorrentId },
    /// The torrent stopped, cleanly or due to a fatal error.
    TorrentStopped {
        id: TorrentId,
        error: Option<String>,
    },
    /// The whole engine finished shutting down.
    EngineStopped,
}

pub type AlertReceiver = UnboundedReceiver<Alert>;

enum EngineCommand {
    AddTorrent {
        source: TorrentSource,
        initial_peers: Vec<SocketAddr>,
    },
    /// Feeds addresses to a torrent from an external source (e.g. a DHT
    /// subscription driven by the caller).
    AddPeers {
        info_hash: Sha1Hash,
        peers: Vec<SocketAddr>,
    },
    Shutdown,
}

/// A cheaply cloneable handle for controlling a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Registers a new torrent for download and seeding.
    pub fn add_torrent(
        &self,
        source: TorrentSource,
        initial_peers: Vec<SocketAddr>,
    ) -> Result<()> {
        self.cmd_tx.send(EngineCommand::AddTorrent {
            source,
            initial_peers,
        })?;
        Ok(())
    }

    /// Injects peer addresses for a torrent, deduplicated against the
    /// torrent's candidate pool.
    pub fn add_peers(
        &self,
        info_hash: Sha1Hash,
        peers: Vec<SocketAddr>,
    ) -> Result<()> {
        self.cmd_tx
            .send(EngineCommand::AddPeers { info_hash, peers })?;
        Ok(())
    }

    /// Starts a graceful shutdown: every torrent flushes its disk state and
    /// resume record and announces `stopped`. The final alert is
    /// [`Alert::EngineStopped`].
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_tx.send(EngineCommand::Shutdown)?;
        Ok(())
    }
}

/// The info hash to torrent channel registry, shared with the inbound
/// connection handshakers.
type TorrentRegistry =
    Arc<RwLock<HashMap<Sha1Hash, UnboundedSender<TorrentMsg>>>>;

/// Starts the engine: spawns the disk task, binds the listen socket and
/// returns the control handle plus the alert stream.
pub async fn start(conf: Conf) -> Result<(EngineHandle, AlertReceiver)> {
    let disk = disk::spawn()?;

    let listen_port = conf.engine.listen_port.unwrap_or(0);
    let listener =
        TcpListener::bind(("0.0.0.0", listen_port)).await?;
    let listen_port = listener.local_addr()?.port();
    log::info!("Engine listening on port {}", listen_port);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (user_alert_tx, user_alert_rx) = mpsc::unbounded_channel();
    let registry: TorrentRegistry = Arc::new(RwLock::new(HashMap::new()));

    tokio::spawn(run_listener(listener, Arc::clone(&registry)));

    let engine = Engine {
        conf,
        disk,
        listen_port,
        registry,
        torrents: HashMap::new(),
        next_id: 1,
        user_alert_tx,
        stopping: false,
    };
    tokio::spawn(engine.run(cmd_rx));

    Ok((EngineHandle { cmd_tx }, user_alert_rx))
}

struct TorrentEntry {
    info_hash: Sha1Hash,
    msg_tx: UnboundedSender<TorrentMsg>,
}

struct Engine {
    conf: Conf,
    disk: disk::DiskHandle,
    listen_port: u16,
    registry: TorrentRegistry,
    torrents: HashMap<TorrentId, TorrentEntry>,
    next_id: TorrentId,
    user_alert_tx: UnboundedSender<Alert>,
    stopping: bool,
}

impl Engine {
    async fn run(mut self, cmd_rx: UnboundedReceiver<EngineCommand>) {
        // torrents alert through this internal channel so the engine can
        // observe lifecycle events before forwarding them to the user
        let (torrent_alert_tx, torrent_alert_rx) = mpsc::unbounded_channel();
        let mut cmd_rx = cmd_rx.fuse();
        let mut torrent_alert_rx = torrent_alert_rx.fuse();

        loop {
            select! {
                cmd = cmd_rx.select_next_some() => {
                    if self.handle_cmd(cmd, &torrent_alert_tx).await {
                        break;
                    }
                }
                alert = torrent_alert_rx.select_next_some() => {
                    if self.handle_torrent_alert(alert).await {
                        break;
                    }
                }
            }
        }

        self.disk.shutdown();
        let _ = self.user_alert_tx.send(Alert::EngineStopped);
        log::info!("Engine stopped");
    }

    /// Returns true when the engine loop should exit.
    async fn handle_cmd(
        &mut self,
        cmd: EngineCommand,
        torrent_alert_tx: &UnboundedSender<Alert>,
    ) -> bool {
        match cmd {
            EngineCommand::AddTorrent {
                source,
                initial_peers,
            } => {
                if !self.stopping {
                    self.add_torrent(source, initial_peers, torrent_alert_tx)
                        .await;
                }
            }
            EngineCommand::AddPeers { info_hash, peers } => {
                if let Some(tx) = self.registry.read().await.get(&info_hash)
                {
                    let _ = tx.send(TorrentMsg::AddPeers(peers));
                }
            }
            EngineCommand::Shutdown => {
                log::info!("Engine shutting down");
                self.stopping = true;
                for entry in self.torrents.values() {
                    let _ = entry.msg_tx.send(TorrentMsg::Shutdown);
                }
                return self.torrents.is_empty();
            }
        }
        false
    }

    async fn add_torrent(
        &mut self,
        source: TorrentSource,
        initial_peers: Vec<SocketAddr>,
        torrent_alert_tx: &UnboundedSender<Alert>,
    ) {
        let (metainfo, info_hash, trackers) = match source {
            TorrentSource::Metainfo(metainfo) => {
                let info_hash = metainfo.info_hash;
                let trackers = metainfo.trackers.clone();
                (Some(metainfo), info_hash, trackers)
            }
            TorrentSource::Magnet(magnet) => {
                (None, magnet.info_hash, magnet.trackers)
            }
        };

        if self.registry.read().await.contains_key(&info_hash) {
            log::warn!(
                "Torrent {} already registered",
                hex::encode(info_hash)
            );
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let (mut torrent, msg_tx) = Torrent::new(TorrentParams {
            id,
            conf: self.conf.torrent.clone(),
            encryption: self.conf.engine.encryption,
            client_id: self.conf.engine.client_id,
            listen_port: Some(self.listen_port),
            disk: self.disk.clone(),
            metainfo,
            info_hash,
            trackers,
            initial_peers,
            alert_tx: torrent_alert_tx.clone(),
        });

        self.registry
            .write()
            .await
            .insert(info_hash, msg_tx.clone());
        self.torrents.insert(
            id,
            TorrentEntry {
                info_hash,
                msg_tx,
            },
        );

        tokio::spawn(async move {
            if let Err(e) = torrent.run().await {
                log::error!("Torrent {} failed: {}", id, e);
            }
        });

        let _ = self
            .user_alert_tx
            .send(Alert::TorrentAdded { id, info_hash });
        log::info!("Added torrent {} ({})", id, hex::encode(info_hash));
    }

    /// Forwards a torrent's alert to the user; returns true when the engine
    /// loop should exit (shutdown finished).
    async fn handle_torrent_alert(&mut self, alert: Alert) -> bool {
        if let Alert::TorrentStopped { id, .. } = &alert {
            if let Some(entry) = self.torrents.remove(id) {
                self.registry.write().await.remove(&entry.info_hash);
            }
        }
        let _ = self.user_alert_tx.send(alert);
        self.stopping && self.torrents.is_empty()
    }
}

/// Accepts inbound connections and hands each to its own handshaker task.
async fn run_listener(mut listener: TcpListener, registry: TorrentRegistry) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                log::debug!("Inbound connection from {}", addr);
                tokio::spawn(handle_inbound(
                    socket,
                    addr,
                    Arc::clone(&registry),
                ));
            }
            Err(e) => {
                log::warn!("Accept error: {}", e);
                time::delay_for(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Sniffs plaintext vs MSE on an accepted socket, reads the BitTorrent
/// handshake and routes the connection to the torrent it addresses.
async fn handle_inbound(
    socket: TcpStream,
    addr: SocketAddr,
    registry: TorrentRegistry,
) {
    // the whole identification dance is bounded like a handshake
    let result = time::timeout(
        Duration::from_secs(30),
        identify_inbound(socket, &registry),
    )
    .await;
    match result {
        Ok(Ok((socket, handshake))) => {
            let tx = {
                let registry = registry.read().await;
                registry.get(&handshake.info_hash).cloned()
            };
            match tx {
                Some(tx) => {
                    let _ = tx.send(TorrentMsg::IncomingPeer {
                        addr,
                        socket,
                        handshake,
                    });
                }
                None => {
                    log::debug!(
                        "Inbound {} addressed unknown torrent {}",
                        addr,
                        hex::encode(handshake.info_hash)
                    );
                }
            }
        }
        Ok(Err(e)) => {
            log::debug!("Inbound {} handshake failed: {}", addr, e);
        }
        Err(_) => {
            log::debug!("Inbound {} handshake timed out", addr);
        }
    }
}

async fn identify_inbound(
    mut socket: TcpStream,
    registry: &TorrentRegistry,
) -> Result<(Framed<Socket, HandshakeCodec>, Handshake)> {
    // a plaintext connection leads with pstrlen 19; anything else is an MSE
    // key exchange
    let mut first = [0u8; 1];
    let n = socket.peek(&mut first).await?;
    if n == 0 {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let mut framed = if first[0] == 19 {
        Framed::new(
            crypto::EncryptedStream::passthrough(socket),
            HandshakeCodec,
        )
    } else {
        let skeys: Vec<Sha1Hash> =
            registry.read().await.keys().copied().collect();
        let accepted = crypto::accept(socket, &skeys).await?;
        // the decrypted initial payload normally already carries the
        // BitTorrent handshake; prime the codec's read buffer with it
        let mut parts =
            FramedParts::new(accepted.stream, HandshakeCodec);
        parts.read_buf =
            bytes::BytesMut::from(&accepted.initial_payload[..]);
        Framed::from_parts(parts)
    };

    let handshake = match framed.next().await {
        Some(handshake) => handshake?,
        None => {
            return Err(Error::Io(
                std::io::ErrorKind::UnexpectedEof.into(),
            ))
        }
    };
    Ok((framed, handshake))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;

    fn test_conf(name: &str) -> Conf {
        let dir = std::env::temp_dir()
            .join("riptide-engine-test")
            .join(format!("{}-{}", name, std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        Conf::new(dir)
    }

    fn tiny_metainfo() -> Metainfo {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi16000e4:name1:a12:piece lengthi16384e6:pieces20:",
        );
        buf.extend_from_slice(&[b'x'; 20]);
        buf.extend_from_slice(b"ee");
        Metainfo::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_add_torrent_and_shutdown() {
        let conf = test_conf("lifecycle");
        let (handle, mut alerts) = start(conf).await.unwrap();

        handle
            .add_torrent(
                TorrentSource::Metainfo(tiny_metainfo()),
                Vec::new(),
            )
            .unwrap();

        match alerts.recv().await.unwrap() {
            Alert::TorrentAdded { id, .. } => assert_eq!(id, 1),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        handle.shutdown().unwrap();
        // the torrent stops, then the engine
        loop {
            match alerts.recv().await.unwrap() {
                Alert::TorrentStopped { id, error } => {
                    assert_eq!(id, 1);
                    assert!(error.is_none());
                }
                Alert::EngineStopped => break,
                alert => panic!("unexpected alert: {:?}", alert),
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_torrent_is_rejected() {
        let conf = test_conf("dup");
        let (handle, mut alerts) = start(conf).await.unwrap();

        handle
            .add_torrent(
                TorrentSource::Metainfo(tiny_metainfo()),
                Vec::new(),
            )
            .unwrap();
        handle
            .add_torrent(
                TorrentSource::Metainfo(tiny_metainfo()),
                Vec::new(),
            )
            .unwrap();
        handle.shutdown().unwrap();

        let mut added = 0;
        loop {
            match alerts.recv().await.unwrap() {
                Alert::TorrentAdded { .. } => added += 1,
                Alert::EngineStopped => break,
                _ => {}
            }
        }
        assert_eq!(added, 1);
    }
}
