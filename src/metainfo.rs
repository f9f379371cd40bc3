//! Metainfo loader
//!
//! Converts a .torrent file into the typed, immutable [`Metainfo`] model and
//! derives the piece table. The info hash, the swarm identifier carried in
//! every tracker announce and peer handshake, is the SHA-1 of the canonical
//! re-encoding of the parsed info dictionary, which the strict decoder and
//! sorted encoder guarantee matches the source bytes.

use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::bencode::{self, BencodeValue};
use crate::error::{ClientError, ProtocolErrorKind, Result};

/// SHA-1 digest (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Primary announce URL
    pub announce: String,
    /// Announce list: ordered tiers, each an ordered list of tracker URLs
    pub announce_list: Vec<Vec<String>>,
    /// Free-form comment
    pub comment: Option<String>,
    /// Creating client name
    pub created_by: Option<String>,
    /// Creation timestamp (Unix epoch)
    pub creation_date: Option<i64>,
    /// The parsed info dictionary
    pub info: Info,
    /// SHA-1 of the canonically encoded info dictionary
    pub info_hash: Sha1Hash,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file (single) or directory (multi)
    pub name: String,
    /// Bytes per piece (uniform except the last piece)
    pub piece_length: u64,
    /// Per-piece SHA-1 digests
    pub pieces: Vec<Sha1Hash>,
    /// Private flag
    pub private: bool,
    /// Single-file or multi-file layout
    pub mode: FileMode,
}

/// File layout discriminator
#[derive(Debug, Clone)]
pub enum FileMode {
    /// One file of the given length, named by `info.name`
    Single { length: u64 },
    /// Ordered list of files under the `info.name` directory
    Multi { files: Vec<FileEntry> },
}

/// One file in a multi-file torrent
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File size in bytes
    pub length: u64,
    /// Path components below the torrent's name directory
    pub path: Vec<String>,
}

impl Metainfo {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = bencode::decode(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| invalid("root must be a dictionary"))?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing or invalid 'announce'"))?
            .to_string();

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or_else(|| invalid("missing 'info' dictionary"))?;

        // The swarm identifier is the digest of the canonical encoding of
        // the info record, which round-trips the source bytes exactly.
        let info_hash: Sha1Hash = Sha1::digest(bencode::encode(info_value)).into();

        let info = Self::parse_info(info_value)?;

        let announce_list = Self::parse_announce_list(dict.get(b"announce-list".as_slice()));

        let comment = dict
            .get(b"comment".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let created_by = dict
            .get(b"created by".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let creation_date = dict
            .get(b"creation date".as_slice())
            .and_then(|v| v.as_int());

        Ok(Metainfo {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info,
            info_hash,
        })
    }

    fn parse_info(value: &BencodeValue) -> Result<Info> {
        let dict = value
            .as_dict()
            .ok_or_else(|| invalid("'info' must be a dictionary"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("missing or invalid 'name' in info"))?
            .to_string();
        validate_path_component(&name)?;

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| invalid("missing or invalid 'piece length'"))?;
        if piece_length == 0 {
            return Err(invalid("'piece length' must be positive"));
        }

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("missing or invalid 'pieces'"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(invalid(format!(
                "'pieces' length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let private = dict
            .get(b"private".as_slice())
            .and_then(|v| v.as_int())
            .map(|v| v == 1)
            .unwrap_or(false);

        let mode = match (
            dict.get(b"length".as_slice()),
            dict.get(b"files".as_slice()),
        ) {
            (Some(length), None) => {
                let length = length
                    .as_uint()
                    .ok_or_else(|| invalid("invalid 'length' in info"))?;
                FileMode::Single { length }
            }
            (None, Some(files)) => FileMode::Multi {
                files: Self::parse_files(files)?,
            },
            (Some(_), Some(_)) => {
                return Err(invalid("info has both 'length' and 'files'"));
            }
            (None, None) => {
                return Err(invalid(
                    "info needs 'length' (single-file) or 'files' (multi-file)",
                ));
            }
        };

        let info = Info {
            name,
            piece_length,
            pieces,
            private,
            mode,
        };

        // Digest count must cover the content exactly.
        let expected = info.total_length().div_ceil(piece_length);
        if info.pieces.len() as u64 != expected {
            return Err(invalid(format!(
                "piece count mismatch: have {}, expected {} for {} bytes in {}-byte pieces",
                info.pieces.len(),
                expected,
                info.total_length(),
                piece_length
            )));
        }

        Ok(info)
    }

    fn parse_files(value: &BencodeValue) -> Result<Vec<FileEntry>> {
        let list = value
            .as_list()
            .ok_or_else(|| invalid("'files' must be a list"))?;
        if list.is_empty() {
            return Err(invalid("'files' must not be empty"));
        }

        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let dict = entry
                .as_dict()
                .ok_or_else(|| invalid("file entry must be a dictionary"))?;

            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_uint())
                .ok_or_else(|| invalid("missing or invalid 'length' in file entry"))?;

            let path_list = dict
                .get(b"path".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| invalid("missing or invalid 'path' in file entry"))?;
            if path_list.is_empty() {
                return Err(invalid("file 'path' must not be empty"));
            }

            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let component = component
                    .as_str()
                    .ok_or_else(|| invalid("path component must be a string"))?;
                validate_path_component(component)?;
                path.push(component.to_string());
            }

            files.push(FileEntry { length, path });
        }

        Ok(files)
    }

    fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
        let Some(tiers) = value.and_then(|v| v.as_list()) else {
            return Vec::new();
        };

        tiers
            .iter()
            .filter_map(|tier| {
                tier.as_list().map(|urls| {
                    urls.iter()
                        .filter_map(|url| url.as_str().map(String::from))
                        .collect::<Vec<String>>()
                })
            })
            .filter(|tier| !tier.is_empty())
            .collect()
    }

    /// Info hash as a lowercase hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Piece digest for a given index
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.info.pieces.get(index)
    }

    /// Byte range `[start, end)` of a piece in the logical concatenation
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.info.pieces.len() {
            return None;
        }
        let start = index as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.info.total_length());
        Some((start, end))
    }

    /// Length of a piece (shorter for the last one)
    pub fn piece_length_at(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Length of the final piece
    pub fn last_piece_length(&self) -> u64 {
        let rem = self.info.total_length() % self.info.piece_length;
        if rem == 0 {
            self.info.piece_length
        } else {
            rem
        }
    }

    /// All tracker URLs: the primary announce first, then the announce-list
    /// tiers in order, deduplicated.
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers = vec![self.announce.clone()];
        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }

    /// On-disk file layout relative to the output directory:
    /// `(relative path, length)` in declared order.
    pub fn file_layout(&self) -> Vec<(PathBuf, u64)> {
        match &self.info.mode {
            FileMode::Single { length } => vec![(PathBuf::from(&self.info.name), *length)],
            FileMode::Multi { files } => files
                .iter()
                .map(|file| {
                    let mut path = PathBuf::from(&self.info.name);
                    for component in &file.path {
                        path.push(component);
                    }
                    (path, file.length)
                })
                .collect(),
        }
    }
}

impl Info {
    /// Total content length (sum of file lengths)
    pub fn total_length(&self) -> u64 {
        match &self.mode {
            FileMode::Single { length } => *length,
            FileMode::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    /// Number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// True for single-file torrents
    pub fn is_single_file(&self) -> bool {
        matches!(self.mode, FileMode::Single { .. })
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.info.name)?;
        writeln!(f, "Announce: {}", self.announce)?;
        writeln!(f, "Info hash: {}", self.info_hash_hex())?;
        writeln!(f, "Piece length: {} bytes", self.info.piece_length)?;
        writeln!(f, "Pieces: {}", self.info.num_pieces())?;
        writeln!(f, "Total size: {} bytes", self.info.total_length())?;
        match &self.info.mode {
            FileMode::Single { .. } => writeln!(f, "Single file torrent")?,
            FileMode::Multi { files } => {
                writeln!(f, "Files: {}", files.len())?;
                for (i, file) in files.iter().enumerate() {
                    writeln!(f, "  {}. {} ({} bytes)", i + 1, file.path.join("/"), file.length)?;
                }
            }
        }
        if let Some(ref comment) = self.comment {
            writeln!(f, "Comment: {}", comment)?;
        }
        if let Some(ref created_by) = self.created_by {
            writeln!(f, "Created by: {}", created_by)?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::InvalidTorrent, message)
}

/// Reject path components that would escape or no-op the layout.
fn validate_path_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(invalid("empty path component"));
    }
    if component == "." || component == ".." {
        return Err(invalid(format!(
            "path component {:?} not allowed",
            component
        )));
    }
    if component.contains('/') || component.contains('\\') {
        return Err(invalid(format!(
            "path component {:?} contains a separator",
            component
        )));
    }
    Ok(())
}
