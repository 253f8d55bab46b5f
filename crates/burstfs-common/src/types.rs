//! Core type definitions for BurstFS
//!
//! Identifiers for files (local and global), the POSIX-like attribute
//! record published to the metadata service, and open flags.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::BitOr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest path a file entry can hold, terminator included
pub const MAX_FILENAME: usize = 128;

/// Block size reported for every file
pub const DEFAULT_BLKSIZE: u32 = 4096;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;

/// Process-local file id, the index of a file's slot in the superblock
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
    Into,
)]
#[display("{_0}")]
pub struct Fid(u32);

impl Fid {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Slot index in the per-file tables
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Cluster-wide file id, derived deterministically from the path
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct Gfid(u32);

impl Gfid {
    /// Hash a path into its global id.
    ///
    /// Every process computes the same value for the same path. The id is
    /// the first four bytes of the SHA-256 digest, little endian.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let digest = Sha256::digest(path.as_bytes());
        Self(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfid({:08x})", self.0)
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// POSIX-like file attributes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileAttr {
    /// Attributes for a newly created regular file
    #[must_use]
    pub fn regular(gfid: Gfid) -> Self {
        Self::with_mode(gfid, S_IFREG | 0o644)
    }

    /// Attributes for a newly created directory
    #[must_use]
    pub fn directory(gfid: Gfid) -> Self {
        Self::with_mode(gfid, S_IFDIR | 0o755)
    }

    fn with_mode(gfid: Gfid, mode: u32) -> Self {
        let now = unix_now();
        Self {
            ino: u64::from(gfid.as_u32()),
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            size: 0,
            blksize: DEFAULT_BLKSIZE,
            blocks: 1,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// A file's attributes as known to the metadata service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalFileAttr {
    pub gfid: Gfid,
    /// Local id in the process that published or mirrored the entry
    pub fid: Fid,
    pub path: String,
    pub attr: FileAttr,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Flags passed to `open`, using the host's `O_*` values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const RDONLY: Self = Self(libc::O_RDONLY);
    pub const WRONLY: Self = Self(libc::O_WRONLY);
    pub const RDWR: Self = Self(libc::O_RDWR);
    pub const CREAT: Self = Self(libc::O_CREAT);
    pub const EXCL: Self = Self(libc::O_EXCL);
    pub const TRUNC: Self = Self(libc::O_TRUNC);
    pub const APPEND: Self = Self(libc::O_APPEND);
    pub const DIRECTORY: Self = Self(libc::O_DIRECTORY);

    #[must_use]
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the access mode permits writing
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & libc::O_ACCMODE != libc::O_RDONLY
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gfid_is_deterministic() {
        let a = Gfid::from_path("/burst/data/file0");
        let b = Gfid::from_path("/burst/data/file0");
        let c = Gfid::from_path("/burst/data/file1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn test_default_attrs() {
        let gfid = Gfid::from_path("/burst/a");
        let file = FileAttr::regular(gfid);
        assert!(!file.is_dir());
        assert_eq!(file.mode, S_IFREG | 0o644);
        assert_eq!(file.ino, u64::from(gfid.as_u32()));
        assert_eq!(file.blksize, DEFAULT_BLKSIZE);

        let dir = FileAttr::directory(gfid);
        assert!(dir.is_dir());
        assert_eq!(dir.mode & 0o777, 0o755);
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::RDWR;
        assert!(flags.contains(OpenFlags::CREAT));
        assert!(flags.contains(OpenFlags::EXCL));
        assert!(!flags.contains(OpenFlags::TRUNC));
        assert!(flags.is_writable());
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(OpenFlags::WRONLY.is_writable());
    }

    #[test]
    fn test_fid_index() {
        let fid = Fid::from(7);
        assert_eq!(fid.index(), 7);
        assert_eq!(u32::from(fid), 7);
        assert_eq!(fid.to_string(), "7");
    }
}
