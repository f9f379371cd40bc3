//! File storage
//!
//! Presents the torrent's content as one linear address space
//! `[0, total_length)` mapped onto the declared files in order. Construction
//! creates the directory tree, opens every file read-write, and sizes each to
//! its declared length so positional writes never extend a file. Reads and
//! writes are decomposed into per-file segments; a read that comes up short
//! at end-of-file returns the bytes it got (piece verification will fail
//! naturally), while a short write is always an error.
//!
//! Multiple readers may proceed concurrently; writers are exclusive.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::bitfield::Bitfield;
use crate::error::{ClientError, Result, StorageErrorKind};
use crate::metainfo::{Metainfo, Sha1Hash};

/// One file in the linear layout
struct StoredFile {
    path: PathBuf,
    /// Offset of this file in the logical concatenation
    offset: u64,
    length: u64,
    file: File,
}

/// File-backed storage for a single torrent
pub struct FileStorage {
    metainfo: Arc<Metainfo>,
    files: Vec<StoredFile>,
    total_length: u64,
    lock: RwLock<()>,
}

impl FileStorage {
    /// Create the destination tree and open all files, pre-sized to their
    /// declared lengths.
    ///
    /// Single-file layout: `<output_dir>/<name>`. Multi-file layout:
    /// `<output_dir>/<name>/<path components…>`.
    pub fn create(metainfo: Arc<Metainfo>, output_dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let mut offset = 0u64;

        for (relative, length) in metainfo.file_layout() {
            let path = output_dir.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ClientError::storage(
                        StorageErrorKind::Io,
                        parent,
                        format!("failed to create directory: {}", e),
                    )
                })?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| {
                    ClientError::storage(
                        StorageErrorKind::Io,
                        &path,
                        format!("failed to open: {}", e),
                    )
                })?;

            // Both truncates an oversized leftover and extends a fresh file,
            // so offset writes stay inside the declared length.
            file.set_len(length).map_err(|e| {
                ClientError::storage(
                    StorageErrorKind::Io,
                    &path,
                    format!("failed to size to {} bytes: {}", length, e),
                )
            })?;

            files.push(StoredFile {
                path,
                offset,
                length,
                file,
            });
            offset += length;
        }

        Ok(Self {
            total_length: metainfo.info.total_length(),
            metainfo,
            files,
            lock: RwLock::new(()),
        })
    }

    /// Total content length in bytes
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Read into `buf` starting at a linear offset. Returns the number of
    /// bytes read, which is less than `buf.len()` only when a file ended
    /// early on disk.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_range(offset, buf.len())?;
        let _guard = self.lock.read();
        self.read_segments(offset, buf)
    }

    /// Write `data` at a linear offset. Short writes are errors.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let _guard = self.lock.write();
        self.write_segments(offset, data)
    }

    /// Read a whole piece. The returned buffer is truncated if the backing
    /// files end early.
    pub fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let (start, length) = self.piece_bounds(index)?;
        let mut buf = vec![0u8; length as usize];
        let n = self.read_at(start, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write a whole piece; `data` must match the piece's length exactly.
    pub fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let (start, length) = self.piece_bounds(index)?;
        if data.len() as u64 != length {
            return Err(ClientError::invalid_input(
                "piece_data",
                format!(
                    "piece {} is {} bytes, got {}",
                    index,
                    length,
                    data.len()
                ),
            ));
        }
        self.write_at(start, data)
    }

    /// Read a block out of a piece, bounds-checked against the piece length.
    pub fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let start = self.block_start(index, offset, length as u64)?;
        let mut buf = vec![0u8; length as usize];
        let n = self.read_at(start, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write a block into a piece, bounds-checked against the piece length.
    pub fn write_block(&self, index: u32, offset: u32, data: &[u8]) -> Result<()> {
        let start = self.block_start(index, offset, data.len() as u64)?;
        self.write_at(start, data)
    }

    /// Flush all open files to disk
    pub fn sync(&self) -> Result<()> {
        let _guard = self.lock.write();
        for stored in &self.files {
            stored.file.sync_all().map_err(|e| {
                ClientError::storage(
                    StorageErrorKind::Io,
                    &stored.path,
                    format!("failed to sync: {}", e),
                )
            })?;
        }
        Ok(())
    }

    /// Hash-scan every piece on disk and report which ones verify against
    /// the expected digests. Expensive; intended for a one-time resume check
    /// before any peer activity.
    pub fn completion_bitfield(&self) -> Result<Bitfield> {
        let num_pieces = self.metainfo.info.num_pieces();
        let mut bitfield = Bitfield::new(num_pieces);

        for index in 0..num_pieces {
            let expected = match self.metainfo.piece_hash(index) {
                Some(hash) => hash,
                None => continue,
            };
            let data = self.read_piece(index as u32)?;
            let actual: Sha1Hash = Sha1::digest(&data).into();
            if actual == *expected {
                bitfield.set(index)?;
            }
        }

        Ok(bitfield)
    }

    fn piece_bounds(&self, index: u32) -> Result<(u64, u64)> {
        let length = self.metainfo.piece_length_at(index as usize).ok_or_else(|| {
            ClientError::invalid_input(
                "piece_index",
                format!("piece {} out of range", index),
            )
        })?;
        Ok((index as u64 * self.metainfo.info.piece_length, length))
    }

    fn block_start(&self, index: u32, offset: u32, length: u64) -> Result<u64> {
        let (start, piece_length) = self.piece_bounds(index)?;
        if offset as u64 + length > piece_length {
            return Err(ClientError::invalid_input(
                "block",
                format!(
                    "block [{}, {}) exceeds piece {} length {}",
                    offset,
                    offset as u64 + length,
                    index,
                    piece_length
                ),
            ));
        }
        Ok(start + offset as u64)
    }

    /// A range is valid when it lies inside `[0, total_length]`; an empty
    /// transfer at the very end is 0 bytes, not an error.
    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.checked_add(len as u64).ok_or_else(|| {
            ClientError::storage(
                StorageErrorKind::OutOfRange,
                PathBuf::new(),
                "offset overflow".to_string(),
            )
        })?;
        if end > self.total_length {
            return Err(ClientError::storage(
                StorageErrorKind::OutOfRange,
                PathBuf::new(),
                format!(
                    "range [{}, {}) outside [0, {})",
                    offset, end, self.total_length
                ),
            ));
        }
        Ok(())
    }

    fn read_segments(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        let mut pos = offset;

        for stored in &self.files {
            if done == buf.len() {
                break;
            }
            if pos >= stored.offset + stored.length {
                continue;
            }

            let file_offset = pos - stored.offset;
            let available = (stored.length - file_offset) as usize;
            let want = (buf.len() - done).min(available);

            let n = pread(&stored.file, &mut buf[done..done + want], file_offset).map_err(|e| {
                ClientError::storage(
                    StorageErrorKind::Io,
                    &stored.path,
                    format!("read at {} failed: {}", file_offset, e),
                )
            })?;

            done += n;
            pos += n as u64;

            if n < want {
                // File shorter on disk than declared; not a storage error.
                return Ok(done);
            }
        }

        Ok(done)
    }

    fn write_segments(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0usize;
        let mut pos = offset;

        for stored in &self.files {
            if done == data.len() {
                break;
            }
            if pos >= stored.offset + stored.length {
                continue;
            }

            let file_offset = pos - stored.offset;
            let available = (stored.length - file_offset) as usize;
            let want = (data.len() - done).min(available);

            pwrite_all(&stored.file, &data[done..done + want], file_offset).map_err(|e| {
                ClientError::storage(
                    StorageErrorKind::Io,
                    &stored.path,
                    format!("write at {} failed: {}", file_offset, e),
                )
            })?;

            done += want;
            pos += want as u64;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;

    /// Multi-file fixture: "pack" with a (10 bytes) and b (30 bytes),
    /// piece length 16 → pieces of 16, 16 and 8 bytes.
    fn two_file_metainfo() -> Arc<Metainfo> {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url4:infod5:filesl");
        data.extend_from_slice(b"d6:lengthi10e4:pathl1:aee");
        data.extend_from_slice(b"d6:lengthi30e4:pathl1:bee");
        data.extend_from_slice(b"e4:name4:pack12:piece lengthi16e");
        data.extend_from_slice(b"6:pieces60:");
        data.extend_from_slice(&[0u8; 60]);
        data.extend_from_slice(b"ee");
        Arc::new(Metainfo::parse(&data).unwrap())
    }

    #[test]
    fn test_creates_and_sizes_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();
        assert_eq!(storage.total_length(), 40);

        let a = dir.path().join("pack/a");
        let b = dir.path().join("pack/b");
        assert_eq!(std::fs::metadata(&a).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(&b).unwrap().len(), 30);
    }

    #[test]
    fn test_virtual_address_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();

        // Address 8 lands in file a at offset 8
        storage.write_at(8, &[0xAA]).unwrap();
        let a = std::fs::read(dir.path().join("pack/a")).unwrap();
        assert_eq!(a[8], 0xAA);

        // Address 12 lands in file b at offset 2 (a ends at 10)
        storage.write_at(12, &[0xBB]).unwrap();
        let b = std::fs::read(dir.path().join("pack/b")).unwrap();
        assert_eq!(b[2], 0xBB);
    }

    #[test]
    fn test_write_spanning_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();

        // Piece 1 covers [16, 32): 6 bytes into b[6..12], 10 into b[12..22].
        // All of it lands in b since a ends at 10.
        let payload: Vec<u8> = (0..16).map(|i| i as u8 + 1).collect();
        storage.write_piece(1, &payload).unwrap();

        let b = std::fs::read(dir.path().join("pack/b")).unwrap();
        assert_eq!(&b[6..22], payload.as_slice());

        // And a write spanning the a/b boundary
        let spanning: Vec<u8> = (0..8).map(|i| 0x40 + i).collect();
        storage.write_at(6, &spanning).unwrap();
        let a = std::fs::read(dir.path().join("pack/a")).unwrap();
        let b = std::fs::read(dir.path().join("pack/b")).unwrap();
        assert_eq!(&a[6..10], &spanning[..4]);
        assert_eq!(&b[0..4], &spanning[4..]);
    }

    #[test]
    fn test_read_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();

        let data: Vec<u8> = (0..40).map(|i| i as u8).collect();
        storage.write_at(0, &data).unwrap();

        let mut buf = vec![0u8; 40];
        let n = storage.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 40);
        assert_eq!(buf, data);

        // Sub-range spanning the file boundary
        let mut buf = vec![0u8; 10];
        let n = storage.read_at(5, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buf, &data[5..15]);
    }

    #[test]
    fn test_boundary_offset() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();

        // Zero-length transfer at exactly total_length is 0 bytes, no error
        let mut empty = [0u8; 0];
        assert_eq!(storage.read_at(40, &mut empty).unwrap(), 0);
        storage.write_at(40, &[]).unwrap();

        // Anything past that is out of range
        assert!(storage.read_at(41, &mut empty).is_err());
        assert!(storage.write_at(39, &[0, 0]).is_err());
        let mut two = [0u8; 2];
        assert!(storage.read_at(39, &mut two).is_err());
    }

    #[test]
    fn test_block_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(two_file_metainfo(), dir.path()).unwrap();

        storage.write_block(0, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(storage.read_block(0, 4, 4).unwrap(), vec![1, 2, 3, 4]);

        // Last piece is 8 bytes; block must not extend past it
        assert!(storage.write_block(2, 4, &[0u8; 8]).is_err());
        assert!(storage.read_block(2, 0, 9).is_err());
        assert!(storage.read_block(3, 0, 1).is_err());
    }

    #[test]
    fn test_completion_bitfield_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        // Build a torrent whose piece hashes match known content
        let content: Vec<u8> = (0..40u8).collect();
        let mut pieces = Vec::new();
        for chunk in content.chunks(16) {
            let hash: Sha1Hash = Sha1::digest(chunk).into();
            pieces.extend_from_slice(&hash);
        }
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url4:infod6:lengthi40e4:name5:c.bin");
        data.extend_from_slice(b"12:piece lengthi16e6:pieces60:");
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        let metainfo = Arc::new(Metainfo::parse(&data).unwrap());

        let storage = FileStorage::create(metainfo, dir.path()).unwrap();

        // Freshly sized files are all zero: nothing verifies
        let empty = storage.completion_bitfield().unwrap();
        assert_eq!(empty.count_complete(), 0);

        // Write pieces 0 and 2; the scan should find exactly those
        storage.write_piece(0, &content[0..16]).unwrap();
        storage.write_piece(2, &content[32..40]).unwrap();

        let scanned = storage.completion_bitfield().unwrap();
        assert!(scanned.has(0));
        assert!(!scanned.has(1));
        assert!(scanned.has(2));
    }
}
