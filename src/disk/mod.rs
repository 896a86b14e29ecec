//! The disk task: the single owner of torrent file handles, the in-memory
//! write buffer for in-progress pieces, hashing of completed pieces and the
//! read cache serving upload requests.
//!
//! Sessions and the torrent loop talk to it through a command channel; the
//! hash verdicts and IO failures flow back on a per torrent alert channel.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The commands the disk task receives.
pub(crate) enum Command {
    /// Sets up the file system structure of a torrent and registers its
    /// alert channel.
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    },
    /// Buffers a downloaded block. When it completes its piece, the piece is
    /// hashed and, if valid, committed to disk; the verdict is alerted.
    WriteBlock {
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block of a committed piece, for serving a peer request.
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Reads a whole piece back and compares it against its expected hash,
    /// used when restoring a resume record.
    CheckPiece {
        id: TorrentId,
        piece_index: PieceIndex,
        tx: oneshot::Sender<Result<bool>>,
    },
    /// Syncs all of the torrent's files to durable storage.
    Flush {
        id: TorrentId,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Drops a torrent's file handles and write buffer.
    RemoveTorrent { id: TorrentId },
    Shutdown,
}

/// The alerts a torrent receives from the disk task.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// A piece was fully assembled and hashed. If valid, it is on disk by
    /// the time this alert is seen.
    PieceCompleted { piece_index: PieceIndex, valid: bool },
    /// A piece could not be committed due to an IO failure. Data loss is not
    /// silently tolerable, the torrent must escalate this.
    WriteFailure { piece_index: PieceIndex },
}

/// A cheaply cloneable handle for sending commands to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    ) -> Result<()> {
        self.0.send(Command::NewTorrent {
            id,
            storage,
            piece_hashes,
            alert_chan,
        })?;
        Ok(())
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0.send(Command::WriteBlock { id, block, data })?;
        Ok(())
    }

    pub async fn read_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::ReadBlock { id, block, tx })?;
        rx.await?
    }

    pub async fn check_piece(
        &self,
        id: TorrentId,
        piece_index: PieceIndex,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::CheckPiece {
            id,
            piece_index,
            tx,
        })?;
        rx.await?
    }

    pub async fn flush(&self, id: TorrentId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Flush { id, tx })?;
        rx.await?
    }

    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.0.send(Command::RemoveTorrent { id })?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.0.send(Command::Shutdown);
    }
}

/// Spawns the disk task and returns the handle used to command it.
pub(crate) fn spawn() -> Result<DiskHandle, Error> {
    let (mut disk, cmd_chan) = io::Disk::new();
    tokio::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk task failed: {}", e);
        }
    });
    Ok(DiskHandle(cmd_chan))
}
