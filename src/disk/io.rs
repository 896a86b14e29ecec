use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    ops::Range,
    os::unix::io::AsRawFd,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::task;

use super::{
    Command, CommandReceiver, CommandSender, TorrentAlert, TorrentAlertSender,
};
use crate::{
    block_count,
    error::{Error, Result},
    storage_info::StorageInfo,
    BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
};

/// The number of committed pieces kept in memory for serving peer requests.
const READ_CACHE_PIECE_COUNT: usize = 64;

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and reading blocks back
/// for seeding.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    /// Creates a new `Disk` instance and returns its command sender.
    pub(super) fn new() -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                    alert_chan,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        continue;
                    }
                    // NOTE: do _not_ return on failure, we don't want to
                    // kill the disk task due to IO errors for one torrent
                    match Torrent::new(storage, piece_hashes, alert_chan) {
                        Ok(torrent) => {
                            log::info!("Torrent {} allocated on disk", id);
                            self.torrents.insert(id, torrent);
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                        }
                    }
                }
                Command::WriteBlock { id, block, data } => {
                    if let Some(torrent) = self.torrents.get_mut(&id) {
                        torrent.write_block(block, data).await?;
                    } else {
                        log::warn!("Torrent {} not found", id);
                    }
                }
                Command::ReadBlock { id, block, tx } => {
                    let result = match self.torrents.get_mut(&id) {
                        Some(torrent) => torrent.read_block(block).await,
                        None => Err(Error::ChannelClosed),
                    };
                    let _ = tx.send(result);
                }
                Command::CheckPiece {
                    id,
                    piece_index,
                    tx,
                } => {
                    let result = match self.torrents.get_mut(&id) {
                        Some(torrent) => {
                            torrent.check_piece(piece_index).await
                        }
                        None => Err(Error::ChannelClosed),
                    };
                    let _ = tx.send(result);
                }
                Command::Flush { id, tx } => {
                    let result = match self.torrents.get(&id) {
                        Some(torrent) => torrent.flush(),
                        None => Err(Error::ChannelClosed),
                    };
                    let _ = tx.send(result);
                }
                Command::RemoveTorrent { id } => {
                    self.torrents.remove(&id);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    for torrent in self.torrents.values() {
                        let _ = torrent.flush();
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Torrent information related to disk IO: the in-progress piece write
/// buffer, the opened file handles and the piece read cache.
struct Torrent {
    /// All information concerning this torrent's storage.
    storage: StorageInfo,
    /// The channel used to alert the torrent of hash verdicts and IO
    /// failures.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads, the torrent's write buffer. Each
    /// piece is mapped to its index for fast lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// The hasher/writer thread gets exclusive access to the file handles it
    /// needs through the mutexes, while the event loop stays responsive.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Recently read or committed pieces, serving peer requests without
    /// touching the disk.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// Existing files are kept as they are, so a resumed torrent reuses its
    /// partial download. New files are created sparse at their final size.
    fn new(
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: TorrentAlertSender,
    ) -> Result<Self> {
        if !storage.download_dir.exists() {
            fs::create_dir_all(&storage.download_dir)?;
        }

        let mut files = Vec::with_capacity(storage.files.len());
        for file in storage.files.iter() {
            let path = storage.download_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::debug!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(subdir)?;
                }
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    Error::from(e)
                })?;
            // the file is allocated sparse up front, so writes into the
            // middle of pieces land at their final offsets
            if handle.metadata()?.len() < file.len {
                handle.set_len(file.len)?;
            }
            files.push(Mutex::new(TorrentFile {
                info: file.clone(),
                handle,
            }));
        }

        Ok(Self {
            storage,
            alert_chan,
            write_buf: HashMap::new(),
            files: Arc::new(files),
            piece_hashes,
            read_cache: LruCache::new(READ_CACHE_PIECE_COUNT),
        })
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Buffering block {:?}", info);

        let piece_index = info.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            self.start_new_piece(info)?;
        }
        let piece = match self.write_buf.get_mut(&piece_index) {
            Some(piece) => piece,
            // an invalid block index; the piece map upstream should have
            // rejected it already
            None => return Ok(()),
        };

        piece.enqueue_block(info.offset, data);

        // if the piece has all its blocks, we can hash it, and if it's
        // valid, save it to disk
        if piece.is_complete() {
            let piece = self
                .write_buf
                .remove(&piece_index)
                .expect("piece buffer disappeared");
            let piece_offset = self.storage.piece_torrent_offset(piece_index);
            let files = Arc::clone(&self.files);

            // don't block the event loop with the hashing and sync file
            // writing
            let result = task::spawn_blocking(move || {
                let data = piece.assemble();
                if !piece.matches_hash(&data) {
                    return Ok((false, Vec::new()));
                }
                write_piece_to_files(
                    &files[piece.files.clone()],
                    piece_offset,
                    &data,
                )?;
                Ok::<_, Error>((true, data))
            })
            .await
            .expect("disk IO write task panicked");

            match result {
                Ok((valid, data)) => {
                    if valid {
                        log::info!("Piece {} committed to disk", piece_index);
                        self.read_cache.put(piece_index, Arc::new(data));
                    } else {
                        log::warn!("Piece {} is NOT valid", piece_index);
                    }
                    self.alert_chan.send(TorrentAlert::PieceCompleted {
                        piece_index,
                        valid,
                    })?;
                }
                Err(e) => {
                    log::error!("Piece {} write error: {}", piece_index, e);
                    self.alert_chan.send(TorrentAlert::WriteFailure {
                        piece_index,
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, looking up its expected hash, length
    /// and the files it intersects.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<()> {
        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Ok(());
        }
        let mut expected_hash = [0; 20];
        expected_hash
            .copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);

        let len = self.storage.piece_len(info.piece_index)?;
        let files = self.storage.files_intersecting_piece(info.piece_index)?;
        log::trace!(
            "Piece {} write buffer created ({} bytes, files {:?})",
            info.piece_index,
            len,
            files
        );

        self.write_buf.insert(
            info.piece_index,
            Piece {
                expected_hash,
                len,
                blocks: BTreeMap::new(),
                files,
            },
        );
        Ok(())
    }

    /// Reads a block of a committed piece, through the piece level read
    /// cache.
    async fn read_block(&mut self, info: BlockInfo) -> Result<Vec<u8>> {
        let piece_index = info.piece_index;
        let piece_len = self.storage.piece_len(piece_index)?;
        if info.offset + info.len > piece_len {
            return Err(Error::Protocol(
                crate::error::ProtocolError::InvalidBlockInfo,
            ));
        }

        let data = match self.read_cache.get(&piece_index) {
            Some(data) => Arc::clone(data),
            None => {
                let data = self.read_piece(piece_index).await?;
                let data = Arc::new(data);
                self.read_cache.put(piece_index, Arc::clone(&data));
                data
            }
        };

        let offset = info.offset as usize;
        Ok(data[offset..offset + info.len as usize].to_vec())
    }

    /// Reads a whole piece back from disk and compares its hash, used to
    /// reverify resume state.
    async fn check_piece(&mut self, piece_index: PieceIndex) -> Result<bool> {
        let hash_pos = piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            return Ok(false);
        }
        let mut expected_hash: Sha1Hash = [0; 20];
        expected_hash
            .copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);

        let data = self.read_piece(piece_index).await?;
        let digest: Sha1Hash = Sha1::digest(&data).into();
        Ok(digest == expected_hash)
    }

    async fn read_piece(&self, piece_index: PieceIndex) -> Result<Vec<u8>> {
        let len = self.storage.piece_len(piece_index)? as usize;
        let piece_offset = self.storage.piece_torrent_offset(piece_index);
        let file_range = self.storage.files_intersecting_piece(piece_index)?;
        let files = Arc::clone(&self.files);

        task::spawn_blocking(move || {
            read_piece_from_files(&files[file_range], piece_offset, len)
        })
        .await
        .expect("disk IO read task panicked")
    }

    fn flush(&self) -> Result<()> {
        for file in self.files.iter() {
            let file = file.lock().expect("file mutex poisoned");
            file.handle.sync_all()?;
        }
        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the buffer to the file at the offset, handling partial writes.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            let n = nix::sys::uio::pwrite(
                self.handle.as_raw_fd(),
                buf,
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                nix_to_io(e)
            })?;
            if n == 0 {
                return Err(Error::Io(
                    std::io::ErrorKind::WriteZero.into(),
                ));
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes from the file at the offset.
    fn read_all_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            let n = nix::sys::uio::pread(
                self.handle.as_raw_fd(),
                buf,
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} read error: {}", self.info.path, e);
                nix_to_io(e)
            })?;
            if n == 0 {
                return Err(Error::Io(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ));
            }
            buf = &mut buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> Error {
    match e.as_errno() {
        Some(errno) => {
            Error::Io(std::io::Error::from_raw_os_error(errno as i32))
        }
        None => Error::Io(std::io::ErrorKind::Other.into()),
    }
}

/// Writes an assembled piece across the files it overlaps with.
fn write_piece_to_files(
    files: &[Mutex<TorrentFile>],
    piece_offset: u64,
    data: &[u8],
) -> Result<()> {
    debug_assert!(!files.is_empty());
    let mut torrent_offset = piece_offset;
    let mut written = 0;
    for file in files {
        let file = file.lock().expect("file mutex poisoned");
        let slice = file
            .info
            .slice_at(torrent_offset, (data.len() - written) as u64);
        debug_assert!(slice.len > 0);
        file.write_all_at(
            &data[written..written + slice.len as usize],
            slice.offset,
        )?;
        torrent_offset += slice.len;
        written += slice.len as usize;
        if written == data.len() {
            break;
        }
    }
    debug_assert_eq!(written, data.len());
    Ok(())
}

/// Reads a whole piece from the files it overlaps with.
fn read_piece_from_files(
    files: &[Mutex<TorrentFile>],
    piece_offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let mut data = vec![0; len];
    let mut torrent_offset = piece_offset;
    let mut read = 0;
    for file in files {
        let file = file.lock().expect("file mutex poisoned");
        let slice =
            file.info.slice_at(torrent_offset, (len - read) as u64);
        file.read_all_at(
            &mut data[read..read + slice.len as usize],
            slice.offset,
        )?;
        torrent_offset += slice.len;
        read += slice.len as usize;
        if read == len {
            break;
        }
    }
    debug_assert_eq!(read, len);
    Ok(data)
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash is
    /// correct, saved to disk.
    ///
    /// Blocks are mapped to their offset within piece, in a sorted map so
    /// assembly and hashing can iterate them in order.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files the piece overlaps with, as a range indexing
    /// `Torrent::files`.
    files: Range<FileIndex>,
}

impl Piece {
    /// Places block into piece's write buffer if it doesn't exist.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Concatenates the blocks into the contiguous piece.
    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            data.extend_from_slice(block);
        }
        data
    }

    /// Whether the assembled piece matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread
    /// pool and not the executor.
    fn matches_hash(&self, data: &[u8]) -> bool {
        let digest: Sha1Hash = Sha1::digest(data).into();
        digest == self.expected_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("riptide-test")
            .join(format!("{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn single_file_storage(dir: PathBuf, piece_count: usize) -> StorageInfo {
        let torrent_len = piece_count as u64 * BLOCK_LEN as u64;
        StorageInfo {
            piece_count,
            piece_len: BLOCK_LEN,
            last_piece_len: BLOCK_LEN,
            torrent_len,
            download_dir: dir,
            files: vec![FileInfo {
                path: PathBuf::from("data"),
                len: torrent_len,
                torrent_offset: 0,
            }],
        }
    }

    fn hash_of(data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }

    #[tokio::test]
    async fn test_valid_piece_is_committed_and_readable() {
        let dir = temp_dir("commit");
        let storage = single_file_storage(dir.clone(), 2);

        let piece0 = vec![0x00; BLOCK_LEN as usize];
        let piece1 = vec![0x01; BLOCK_LEN as usize];
        let mut hashes = hash_of(&piece0);
        hashes.extend(hash_of(&piece1));

        let (alert_chan, mut alert_port) =
            tokio::sync::mpsc::unbounded_channel();
        let mut torrent =
            Torrent::new(storage, hashes, alert_chan).unwrap();

        for (index, data) in [piece0.clone(), piece1.clone()]
            .iter()
            .enumerate()
        {
            torrent
                .write_block(
                    BlockInfo {
                        piece_index: index,
                        offset: 0,
                        len: BLOCK_LEN,
                    },
                    data.clone(),
                )
                .await
                .unwrap();
            match alert_port.recv().await.unwrap() {
                TorrentAlert::PieceCompleted {
                    piece_index,
                    valid,
                } => {
                    assert_eq!(piece_index, index);
                    assert!(valid);
                }
                alert => panic!("unexpected alert: {:?}", alert),
            }
        }

        // the file on disk is the concatenation of the pieces
        let on_disk = fs::read(dir.join("data")).unwrap();
        let mut expected = piece0;
        expected.extend(piece1);
        assert_eq!(on_disk, expected);

        // blocks read back through the cache
        let block = torrent
            .read_block(BlockInfo {
                piece_index: 1,
                offset: 0,
                len: 100,
            })
            .await
            .unwrap();
        assert_eq!(block, vec![0x01; 100]);

        // resume reverification passes
        assert!(torrent.check_piece(0).await.unwrap());
        assert!(torrent.check_piece(1).await.unwrap());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_not_written() {
        let dir = temp_dir("corrupt");
        let storage = single_file_storage(dir.clone(), 1);
        let hashes = hash_of(&vec![0xaa; BLOCK_LEN as usize]);

        let (alert_chan, mut alert_port) =
            tokio::sync::mpsc::unbounded_channel();
        let mut torrent =
            Torrent::new(storage, hashes, alert_chan).unwrap();

        torrent
            .write_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: BLOCK_LEN,
                },
                vec![0xbb; BLOCK_LEN as usize],
            )
            .await
            .unwrap();

        match alert_port.recv().await.unwrap() {
            TorrentAlert::PieceCompleted { valid, .. } => assert!(!valid),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        // the sparse file exists but holds no piece data
        let on_disk = fs::read(dir.join("data")).unwrap();
        assert!(on_disk.iter().all(|b| *b == 0));

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_piece_spanning_multiple_files() {
        let dir = temp_dir("multifile");
        // one piece of 2 blocks spanning three files
        let piece_len = 2 * BLOCK_LEN;
        let storage = StorageInfo {
            piece_count: 1,
            piece_len,
            last_piece_len: piece_len,
            torrent_len: piece_len as u64,
            download_dir: dir.clone(),
            files: vec![
                FileInfo {
                    path: PathBuf::from("a"),
                    len: 1000,
                    torrent_offset: 0,
                },
                FileInfo {
                    path: PathBuf::from("b"),
                    len: 20000,
                    torrent_offset: 1000,
                },
                FileInfo {
                    path: PathBuf::from("c"),
                    len: piece_len as u64 - 21000,
                    torrent_offset: 21000,
                },
            ],
        };

        let data: Vec<u8> =
            (0..piece_len).map(|i| (i % 251) as u8).collect();
        let hashes = hash_of(&data);

        let (alert_chan, mut alert_port) =
            tokio::sync::mpsc::unbounded_channel();
        let mut torrent =
            Torrent::new(storage, hashes, alert_chan).unwrap();

        for block_index in 0..2 {
            let offset = block_index * BLOCK_LEN;
            torrent
                .write_block(
                    BlockInfo {
                        piece_index: 0,
                        offset,
                        len: BLOCK_LEN,
                    },
                    data[offset as usize..(offset + BLOCK_LEN) as usize]
                        .to_vec(),
                )
                .await
                .unwrap();
        }

        match alert_port.recv().await.unwrap() {
            TorrentAlert::PieceCompleted { valid, .. } => assert!(valid),
            alert => panic!("unexpected alert: {:?}", alert),
        }

        let mut on_disk = fs::read(dir.join("a")).unwrap();
        on_disk.extend(fs::read(dir.join("b")).unwrap());
        on_disk.extend(fs::read(dir.join("c")).unwrap());
        assert_eq!(on_disk, data);

        // a read crossing the file boundaries comes back intact
        let block = torrent
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            })
            .await
            .unwrap();
        assert_eq!(block, &data[..BLOCK_LEN as usize]);

        let _ = fs::remove_dir_all(&dir);
    }
}
