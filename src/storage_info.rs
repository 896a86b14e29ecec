//! The torrent's storage geometry: where each file sits in the torrent's
//! flat byte stream and how pieces map onto files.
//!
//! Piece hashes are defined over the concatenation of all files, so a piece
//! near a file boundary spans two or more files. The disk code works in
//! torrent coordinates and uses this module to translate them into per file
//! offsets.

use std::{cmp::Ordering, ops::Range, path::PathBuf};

use crate::{error::*, metainfo::Metainfo, FileIndex, PieceIndex};

/// One file of the torrent and its position in the torrent's byte stream.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Path relative to the download directory.
    pub path: PathBuf,
    /// Length in bytes.
    pub len: u64,
    /// Where the file begins in the torrent's byte stream. Zero for the
    /// first (or only) file.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// One past the file's last byte, in torrent coordinates.
    pub(crate) fn end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Maps a torrent coordinate range onto this file: the offset within
    /// the file and how many of the `len` bytes land inside it. Bytes past
    /// the end of the file belong to the following files and are not
    /// counted.
    ///
    /// # Panics
    ///
    /// The range must start inside the file.
    pub(crate) fn slice_at(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "range starts before the file"
        );
        assert!(
            torrent_offset < self.end_offset(),
            "range starts past the file"
        );
        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(self.end_offset() - torrent_offset),
        }
    }
}

/// A contiguous byte range within one file, in file coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// Everything the engine needs to know about a torrent's on-disk layout:
/// piece sizes and count, the total length, the destination directory and
/// the ordered file list.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    pub piece_count: usize,
    /// The nominal piece length; every piece but possibly the last has it.
    pub piece_len: u32,
    /// The final piece's length: equal to `piece_len` only when the torrent
    /// length is an exact multiple of it.
    pub last_piece_len: u32,
    /// The sum of all file lengths.
    pub torrent_len: u64,
    /// Where the download lands. A multi file torrent gets a directory of
    /// its own under the configured download directory, so its entries
    /// don't scatter.
    pub download_dir: PathBuf,
    /// The files in torrent order. A single file torrent has one entry.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Derives the storage layout from the parsed metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.piece_count();
        let piece_len = metainfo.piece_len;
        let torrent_len = metainfo.total_len();
        // whatever the last piece doesn't fill of a nominal piece is missing
        // from the torrent's tail
        let last_piece_len =
            (torrent_len - (piece_count as u64 - 1) * piece_len as u64) as u32;

        let download_dir = if metainfo.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            torrent_len,
            download_dir,
            files: metainfo.files.clone(),
        }
    }

    /// The indices of the files the piece overlaps with.
    pub fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let start = self.piece_torrent_offset(index);
        let end = start + self.piece_len(index)? as u64;
        Ok(self.files_intersecting_bytes(start..end))
    }

    /// The indices of the files overlapping the given torrent byte range
    /// (start inclusive, end exclusive). Empty if the start byte lies
    /// outside every file.
    pub fn files_intersecting_bytes(
        &self,
        bytes: Range<u64>,
    ) -> Range<FileIndex> {
        let first = match self.files.iter().position(|file| {
            file.torrent_offset <= bytes.start
                && bytes.start < file.end_offset()
        }) {
            Some(first) => first,
            None => return 0..0,
        };
        // take every following file that begins before the range ends
        let mut end = first + 1;
        while end < self.files.len()
            && self.files[end].torrent_offset < bytes.end
        {
            end += 1;
        }
        first..end
    }

    /// The length of the piece at the given index, or an error for an index
    /// past the torrent.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        match (index + 1).cmp(&self.piece_count) {
            Ordering::Less => Ok(self.piece_len),
            Ordering::Equal => Ok(self.last_piece_len),
            Ordering::Greater => {
                log::error!(
                    "Piece {} out of bounds ({} pieces)",
                    index,
                    self.piece_count
                );
                Err(Error::Protocol(
                    crate::error::ProtocolError::InvalidBlockInfo,
                ))
            }
        }
    }

    /// The byte offset of the piece in the torrent.
    pub fn piece_torrent_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(name),
            torrent_offset,
            len,
        }
    }

    /// Three pieces of 8 bytes over four files:
    ///
    /// ```text
    /// bytes:  0         8         16        24
    /// pieces: [    0    ][    1   ][    2   ]
    /// files:  [ a  ][b ][ c        ][ d     ]
    ///         0     5   8           17
    /// ```
    fn four_file_storage() -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 8,
            last_piece_len: 8,
            torrent_len: 24,
            download_dir: PathBuf::from("/downloads"),
            files: vec![
                file("a", 0, 5),
                file("b", 5, 3),
                file("c", 8, 9),
                file("d", 17, 7),
            ],
        }
    }

    #[test]
    fn test_slice_at() {
        let f = file("f", 100, 50);

        // a range fully inside the file keeps its length
        assert_eq!(
            f.slice_at(120, 10),
            FileSlice {
                offset: 20,
                len: 10
            }
        );
        // a range running past the file is clipped to the file's tail
        assert_eq!(
            f.slice_at(120, 1000),
            FileSlice {
                offset: 20,
                len: 30
            }
        );
        // the whole file
        assert_eq!(f.slice_at(100, 50), FileSlice { offset: 0, len: 50 });
        // the last byte
        assert_eq!(f.slice_at(149, 8), FileSlice { offset: 49, len: 1 });
    }

    #[test]
    #[should_panic(expected = "range starts before the file")]
    fn test_slice_at_before_file_panics() {
        file("f", 100, 50).slice_at(99, 5);
    }

    #[test]
    #[should_panic(expected = "range starts past the file")]
    fn test_slice_at_past_file_panics() {
        file("f", 100, 50).slice_at(150, 5);
    }

    #[test]
    fn test_files_intersecting_piece() {
        let info = four_file_storage();
        // piece 0 covers files a and b entirely
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // piece 1 lies inside file c
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 2..3);
        // piece 2 takes c's last byte and all of d
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 2..4);
        // one piece past the end errors
        assert!(info.files_intersecting_piece(3).is_err());
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let info = four_file_storage();
        // exactly the first file
        assert_eq!(info.files_intersecting_bytes(0..5), 0..1);
        // straddling the a/b boundary
        assert_eq!(info.files_intersecting_bytes(4..6), 0..2);
        // a single byte in the middle of c
        assert_eq!(info.files_intersecting_bytes(10..11), 2..3);
        // from inside b to inside d
        assert_eq!(info.files_intersecting_bytes(6..20), 1..4);
        // the torrent's last byte
        assert_eq!(info.files_intersecting_bytes(23..24), 3..4);
        // an empty range still names the file containing its start byte
        assert_eq!(info.files_intersecting_bytes(8..8), 2..3);
        // wholly past the end of the torrent
        assert_eq!(info.files_intersecting_bytes(30..40), 0..0);
    }

    #[test]
    fn test_piece_len_with_short_tail() {
        let mut info = four_file_storage();
        info.last_piece_len = 3;
        info.torrent_len = 19;

        assert_eq!(info.piece_len(0).unwrap(), 8);
        assert_eq!(info.piece_len(1).unwrap(), 8);
        assert_eq!(info.piece_len(2).unwrap(), 3);
        assert!(info.piece_len(3).is_err());
    }

    #[test]
    fn test_piece_offsets() {
        let info = four_file_storage();
        assert_eq!(info.piece_torrent_offset(0), 0);
        assert_eq!(info.piece_torrent_offset(2), 16);
    }
}
