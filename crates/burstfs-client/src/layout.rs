//! Superblock layout
//!
//! The superblock is one contiguous region, carved in a fixed order:
//!
//! ```text
//! ┌─────────────────────────┐ 0
//! │ header (32 B)           │ magic, version, size, geometry checksum
//! ├─────────────────────────┤
//! │ fid stack               │ max_files ids
//! ├─────────────────────────┤
//! │ file name table         │ max_files × name slot
//! ├─────────────────────────┤
//! │ file meta table         │ max_files × FileMeta
//! ├─────────────────────────┤
//! │ chunk lists             │ max_files × (mem + spill chunks) × slot
//! ├─────────────────────────┤
//! │ memory chunk stack      │
//! ├─────────────────────────┤
//! │ spillover chunk stack   │ only with spillover
//! ├─────────────────────────┤ page aligned
//! │ chunk data              │ only with memory storage
//! ├─────────────────────────┤
//! │ index header (1 page)   │ entry count
//! │ index entries           │
//! ├─────────────────────────┤
//! │ attr header (1 page)    │ entry count
//! │ attr entries            │
//! └─────────────────────────┘ total
//! ```
//!
//! [`Layout::compute`] is the only place offsets are derived, so the size a
//! region is created with always matches how it is carved.

use crate::records::{ChunkLocation, FileMeta, LogIndexEntry, NAME_SLOT_SIZE, Record};
use crate::stack::FreeStack;
use burstfs_common::{ClientConfig, Error, GlobalFileAttr, Result};
use std::ops::Range;

/// Size of the superblock header
pub const HEADER_SIZE: usize = 32;

/// Page size used when the system cannot report one
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// The host's memory page size
#[must_use]
pub fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    #[allow(unsafe_code)]
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|s| s.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

/// Counts and sizes that determine the superblock layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: usize,
    pub max_files: usize,
    pub chunk_bits: u32,
    /// Memory chunks, zero when memory storage is off
    pub max_chunks: usize,
    /// Spillover chunks, zero when spillover is off
    pub spill_max_chunks: usize,
    pub memfs: bool,
    pub spillover: bool,
    pub max_index_entries: usize,
    pub max_fattr_entries: usize,
}

impl Geometry {
    /// Geometry for `config` on this host
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::with_page_size(config, system_page_size())
    }

    pub fn with_page_size(config: &ClientConfig, page_size: usize) -> Result<Self> {
        config.validate()?;
        if !page_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        let to_usize = |v: u64, what: &str| {
            usize::try_from(v).map_err(|_| Error::Configuration(format!("{what} {v} too large")))
        };
        let max_index_entries =
            to_usize(config.index_buf_size, "index_buf_size")? / LogIndexEntry::SIZE;
        let max_fattr_entries =
            to_usize(config.fattr_buf_size, "fattr_buf_size")? / GlobalFileAttr::SIZE;
        if max_index_entries == 0 || max_fattr_entries == 0 {
            return Err(Error::Configuration(
                "index or attribute buffer too small for one entry".into(),
            ));
        }
        if max_fattr_entries < config.max_files {
            return Err(Error::Configuration(format!(
                "attribute buffer holds {max_fattr_entries} entries, fewer than {} files",
                config.max_files
            )));
        }

        Ok(Self {
            page_size,
            max_files: config.max_files,
            chunk_bits: config.chunk_bits,
            max_chunks: to_usize(config.max_chunks(), "max_chunks")?,
            spill_max_chunks: to_usize(config.spillover_max_chunks(), "spillover chunks")?,
            memfs: config.memfs_enabled,
            spillover: config.spillover_enabled,
            max_index_entries,
            max_fattr_entries,
        })
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        1 << self.chunk_bits
    }

    /// Length of every file's chunk list
    #[must_use]
    pub const fn chunks_per_file(&self) -> usize {
        self.max_chunks + self.spill_max_chunks
    }

    /// Largest size a single file can reach
    #[must_use]
    pub const fn max_file_size(&self) -> u64 {
        (self.chunks_per_file() as u64) << self.chunk_bits
    }

    /// Checksum stored in the header to detect re-attaching with a
    /// different configuration
    #[must_use]
    pub fn fingerprint(&self) -> u32 {
        let fields = [
            self.page_size as u64,
            self.max_files as u64,
            u64::from(self.chunk_bits),
            self.max_chunks as u64,
            self.spill_max_chunks as u64,
            u64::from(self.memfs),
            u64::from(self.spillover),
            self.max_index_entries as u64,
            self.max_fattr_entries as u64,
        ];
        let bytes: Vec<u8> = fields.iter().flat_map(|f| f.to_le_bytes()).collect();
        crc32c::crc32c(&bytes)
    }
}

/// A byte range inside the superblock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Offsets of every sub-region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub header: Span,
    pub fid_stack: Span,
    pub names: Span,
    pub metas: Span,
    pub chunk_metas: Span,
    pub chunk_stack: Span,
    pub spill_stack: Option<Span>,
    pub chunks: Option<Span>,
    pub index_header: Span,
    pub index_entries: Span,
    pub attr_header: Span,
    pub attr_entries: Span,
    pub total: usize,
}

struct Cursor {
    offset: usize,
}

impl Cursor {
    fn take(&mut self, len: usize) -> Result<Span> {
        let span = Span {
            offset: self.offset,
            len,
        };
        self.offset = self
            .offset
            .checked_add(len)
            .ok_or_else(|| Error::Configuration("superblock size overflows".into()))?;
        Ok(span)
    }

    fn align(&mut self, align: usize) -> Result<()> {
        self.offset = self
            .offset
            .checked_next_multiple_of(align)
            .ok_or_else(|| Error::Configuration("superblock size overflows".into()))?;
        Ok(())
    }
}

fn table(count: usize, record: usize) -> Result<usize> {
    count
        .checked_mul(record)
        .ok_or_else(|| Error::Configuration(format!("table of {count} × {record} overflows")))
}

impl Layout {
    pub fn compute(geo: &Geometry) -> Result<Self> {
        let mut cursor = Cursor { offset: 0 };

        let header = cursor.take(HEADER_SIZE)?;
        let fid_stack = cursor.take(FreeStack::bytes(geo.max_files))?;
        let names = cursor.take(table(geo.max_files, NAME_SLOT_SIZE)?)?;
        let metas = cursor.take(table(geo.max_files, FileMeta::SIZE)?)?;
        let chunk_metas = cursor.take(table(
            table(geo.max_files, geo.chunks_per_file())?,
            <Option<ChunkLocation>>::SIZE,
        )?)?;
        let chunk_stack = cursor.take(FreeStack::bytes(geo.max_chunks))?;
        let spill_stack = if geo.spillover {
            Some(cursor.take(FreeStack::bytes(geo.spill_max_chunks))?)
        } else {
            None
        };
        let chunks = if geo.memfs {
            cursor.align(geo.page_size)?;
            Some(cursor.take(table(geo.max_chunks, 1 << geo.chunk_bits)?)?)
        } else {
            None
        };

        let index_header = cursor.take(geo.page_size)?;
        let index_entries = cursor.take(table(geo.max_index_entries, LogIndexEntry::SIZE)?)?;
        let attr_header = cursor.take(geo.page_size)?;
        let attr_entries = cursor.take(table(geo.max_fattr_entries, GlobalFileAttr::SIZE)?)?;

        Ok(Self {
            header,
            fid_stack,
            names,
            metas,
            chunk_metas,
            chunk_stack,
            spill_stack,
            chunks,
            index_header,
            index_entries,
            attr_header,
            attr_entries,
            total: cursor.offset,
        })
    }

    /// Sub-regions in carving order
    #[must_use]
    pub fn spans(&self) -> Vec<Span> {
        let mut spans = vec![
            self.header,
            self.fid_stack,
            self.names,
            self.metas,
            self.chunk_metas,
            self.chunk_stack,
        ];
        spans.extend(self.spill_stack);
        spans.extend(self.chunks);
        spans.extend([
            self.index_header,
            self.index_entries,
            self.attr_header,
            self.attr_entries,
        ]);
        spans
    }
}

/// Bytes needed for a superblock of this geometry
pub fn compute_size(geo: &Geometry) -> Result<usize> {
    Layout::compute(geo).map(|layout| layout.total)
}
