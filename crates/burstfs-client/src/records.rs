//! Fixed-size records stored in the superblock
//!
//! All records are little endian and padded to a fixed `SIZE`, so tables of
//! them can be indexed directly:
//!
//! | Record                    | Size | Where                     |
//! |---------------------------|------|---------------------------|
//! | name slot                 | 132  | file name table           |
//! | [`FileMeta`]              | 32   | file meta table           |
//! | `Option<ChunkLocation>`   | 8    | per-file chunk lists      |
//! | [`LogIndexEntry`]         | 32   | log index region          |
//! | [`GlobalFileAttr`]        | 216  | file attribute mirror     |

use burstfs_common::{Error, FileAttr, Fid, Gfid, GlobalFileAttr, MAX_FILENAME, Result};
use bytes::{Buf, BufMut};

/// A value with a fixed-size little-endian encoding
pub trait Record: Sized {
    const SIZE: usize;

    /// Encode into `slot`, which is exactly `SIZE` bytes
    fn encode(&self, slot: &mut [u8]);

    fn decode(slot: &[u8]) -> Result<Self>;
}

/// Encoded size of a path field: u16 length plus the byte buffer
pub const PATH_FIELD_SIZE: usize = 2 + MAX_FILENAME;

/// Size of one entry in the file name table
pub const NAME_SLOT_SIZE: usize = 2 + PATH_FIELD_SIZE;

/// Check a path fits a path field
pub fn check_path(path: &str) -> Result<()> {
    if path.len() >= MAX_FILENAME {
        return Err(Error::NameTooLong {
            len: path.len(),
            max: MAX_FILENAME - 1,
        });
    }
    Ok(())
}

pub(crate) fn put_path(buf: &mut impl BufMut, path: &str) {
    let len = path.len().min(MAX_FILENAME - 1);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16_le(len as u16);
    buf.put_slice(&path.as_bytes()[..len]);
    buf.put_bytes(0, MAX_FILENAME - len);
}

pub(crate) fn get_path(buf: &mut impl Buf) -> Result<String> {
    let len = usize::from(buf.get_u16_le());
    if len >= MAX_FILENAME {
        return Err(Error::Layout(format!("path field claims {len} bytes")));
    }
    let mut raw = vec![0u8; MAX_FILENAME];
    buf.copy_to_slice(&mut raw);
    raw.truncate(len);
    String::from_utf8(raw).map_err(|e| Error::Layout(format!("path field is not UTF-8: {e}")))
}

/// How a file's bytes are stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Storage {
    /// No data storage (directories, freed slots)
    #[default]
    None,
    FixedChunk,
    LogStructured {
        /// End of the furthest write recorded in the log index
        log_size: u64,
    },
}

impl Storage {
    #[must_use]
    pub const fn is_chunked(self) -> bool {
        !matches!(self, Self::None)
    }

    const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::FixedChunk => 1,
            Self::LogStructured { .. } => 2,
        }
    }
}

/// Advisory lock state of a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Unlocked,
    Shared,
    Exclusive,
}

impl LockState {
    const fn tag(self) -> u8 {
        match self {
            Self::Unlocked => 0,
            Self::Shared => 1,
            Self::Exclusive => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Unlocked),
            1 => Ok(Self::Shared),
            2 => Ok(Self::Exclusive),
            other => Err(Error::Layout(format!("unknown lock state {other}"))),
        }
    }
}

/// Per-file bookkeeping, one per fid slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileMeta {
    /// Logical size in bytes
    pub size: u64,
    /// Number of chunks currently reserved
    pub chunks: u64,
    pub is_dir: bool,
    pub storage: Storage,
    pub lock: LockState,
    /// Holders of a shared lock
    pub shared_holders: u32,
}

impl Record for FileMeta {
    const SIZE: usize = 32;

    fn encode(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..Self::SIZE];
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.chunks);
        buf.put_u64_le(match self.storage {
            Storage::LogStructured { log_size } => log_size,
            _ => 0,
        });
        buf.put_u8(self.storage.tag());
        buf.put_u8(u8::from(self.is_dir));
        buf.put_u8(self.lock.tag());
        buf.put_u8(0);
        buf.put_u32_le(self.shared_holders);
    }

    fn decode(slot: &[u8]) -> Result<Self> {
        let mut buf = &slot[..Self::SIZE];
        let size = buf.get_u64_le();
        let chunks = buf.get_u64_le();
        let log_size = buf.get_u64_le();
        let storage = match buf.get_u8() {
            0 => Storage::None,
            1 => Storage::FixedChunk,
            2 => Storage::LogStructured { log_size },
            other => return Err(Error::Layout(format!("unknown storage kind {other}"))),
        };
        let is_dir = buf.get_u8() != 0;
        let lock = LockState::from_tag(buf.get_u8())?;
        buf.advance(1);
        let shared_holders = buf.get_u32_le();
        Ok(Self {
            size,
            chunks,
            is_dir,
            storage,
            lock,
            shared_holders,
        })
    }
}

/// Which tier holds a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Memory,
    Spillover,
}

impl ChunkKind {
    const fn tag(self) -> u8 {
        match self {
            Self::Memory => 1,
            Self::Spillover => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Memory),
            2 => Ok(Self::Spillover),
            other => Err(Error::Layout(format!("unknown chunk kind {other}"))),
        }
    }
}

/// Physical placement of one chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkLocation {
    /// Index into the in-memory data region
    Memory(u32),
    /// Index into the spillover file
    Spillover(u32),
}

impl ChunkLocation {
    #[must_use]
    pub const fn kind(self) -> ChunkKind {
        match self {
            Self::Memory(_) => ChunkKind::Memory,
            Self::Spillover(_) => ChunkKind::Spillover,
        }
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Memory(id) | Self::Spillover(id) => id,
        }
    }
}

impl Record for Option<ChunkLocation> {
    const SIZE: usize = 8;

    fn encode(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..Self::SIZE];
        match self {
            None => buf.put_bytes(0, Self::SIZE),
            Some(loc) => {
                buf.put_u8(loc.kind().tag());
                buf.put_bytes(0, 3);
                buf.put_u32_le(loc.id());
            }
        }
    }

    fn decode(slot: &[u8]) -> Result<Self> {
        let mut buf = &slot[..Self::SIZE];
        let tag = buf.get_u8();
        buf.advance(3);
        let id = buf.get_u32_le();
        if tag == 0 {
            return Ok(None);
        }
        Ok(Some(match ChunkKind::from_tag(tag)? {
            ChunkKind::Memory => ChunkLocation::Memory(id),
            ChunkKind::Spillover => ChunkLocation::Spillover(id),
        }))
    }
}

/// One write piece of a log-structured file, readable by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndexEntry {
    pub fid: Fid,
    /// Logical offset in the file
    pub file_pos: u64,
    /// Byte offset in the backing tier (data region or spillover file)
    pub phys_pos: u64,
    pub length: u64,
    pub kind: ChunkKind,
}

impl Record for LogIndexEntry {
    const SIZE: usize = 32;

    fn encode(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..Self::SIZE];
        buf.put_u32_le(self.fid.as_u32());
        buf.put_u8(self.kind.tag());
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.file_pos);
        buf.put_u64_le(self.phys_pos);
        buf.put_u64_le(self.length);
    }

    fn decode(slot: &[u8]) -> Result<Self> {
        let mut buf = &slot[..Self::SIZE];
        let fid = Fid::new(buf.get_u32_le());
        let kind = ChunkKind::from_tag(buf.get_u8())?;
        buf.advance(3);
        Ok(Self {
            fid,
            file_pos: buf.get_u64_le(),
            phys_pos: buf.get_u64_le(),
            length: buf.get_u64_le(),
            kind,
        })
    }
}

impl Record for GlobalFileAttr {
    const SIZE: usize = 216;

    fn encode(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..Self::SIZE];
        buf.put_u32_le(self.gfid.as_u32());
        buf.put_u32_le(self.fid.as_u32());
        put_path(&mut buf, &self.path);
        buf.put_bytes(0, 6);

        let attr = &self.attr;
        buf.put_u64_le(attr.ino);
        buf.put_u32_le(attr.mode);
        buf.put_u32_le(attr.nlink);
        buf.put_u32_le(attr.uid);
        buf.put_u32_le(attr.gid);
        buf.put_u64_le(attr.size);
        buf.put_u32_le(attr.blksize);
        buf.put_u32_le(0);
        buf.put_u64_le(attr.blocks);
        buf.put_i64_le(attr.atime);
        buf.put_i64_le(attr.mtime);
        buf.put_i64_le(attr.ctime);
    }

    fn decode(slot: &[u8]) -> Result<Self> {
        let mut buf = &slot[..Self::SIZE];
        let gfid = Gfid::from_raw(buf.get_u32_le());
        let fid = Fid::new(buf.get_u32_le());
        let path = get_path(&mut buf)?;
        buf.advance(6);

        let ino = buf.get_u64_le();
        let mode = buf.get_u32_le();
        let nlink = buf.get_u32_le();
        let uid = buf.get_u32_le();
        let gid = buf.get_u32_le();
        let size = buf.get_u64_le();
        let blksize = buf.get_u32_le();
        buf.advance(4);
        let attr = FileAttr {
            ino,
            mode,
            nlink,
            uid,
            gid,
            size,
            blksize,
            blocks: buf.get_u64_le(),
            atime: buf.get_i64_le(),
            mtime: buf.get_i64_le(),
            ctime: buf.get_i64_le(),
        };
        Ok(Self {
            gfid,
            fid,
            path,
            attr,
        })
    }
}
