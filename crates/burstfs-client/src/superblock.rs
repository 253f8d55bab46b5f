//! The client superblock
//!
//! Owns the mapped region and hands out typed, non-overlapping views of its
//! sub-regions through [`Superblock::regions`]. A fresh region is
//! initialized once; a region that already carries a valid header for the
//! same geometry is re-attached untouched.

use crate::index::{AttrLog, IndexLog};
use crate::layout::{Geometry, HEADER_SIZE, Layout, Span};
use crate::records::{ChunkLocation, FileMeta, NAME_SLOT_SIZE, Record, check_path, get_path, put_path};
use crate::region::Region;
use crate::stack::FreeStack;
use burstfs_common::{Error, Fid, Result};
use bytes::{Buf, BufMut};
use std::fs::File;
use tracing::{debug, info};

const MAGIC: u32 = 0x4253_4653; // "BSFS"
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    total_size: u64,
    geometry: u32,
}

impl Header {
    fn encode(&self, slot: &mut [u8]) {
        let mut buf = &mut slot[..HEADER_SIZE];
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u64_le(self.total_size);
        buf.put_u32_le(self.geometry);
        let checksum = crc32c::crc32c(&slot[..20]);
        slot[20..24].copy_from_slice(&checksum.to_le_bytes());
        slot[24..HEADER_SIZE].fill(0);
    }

    /// `None` if the slot does not hold a valid header
    fn decode(slot: &[u8]) -> Option<Self> {
        let mut buf = &slot[..HEADER_SIZE];
        if buf.get_u32_le() != MAGIC || buf.get_u32_le() != FORMAT_VERSION {
            return None;
        }
        let total_size = buf.get_u64_le();
        let geometry = buf.get_u32_le();
        if buf.get_u32_le() != crc32c::crc32c(&slot[..20]) {
            return None;
        }
        Some(Self {
            total_size,
            geometry,
        })
    }
}

/// Name of the shared-memory superblock for one client
#[must_use]
pub fn shm_name(app_id: u32, local_rank: u32) -> String {
    format!("{app_id}-super-{local_rank}")
}

pub struct Superblock {
    region: Region,
    geometry: Geometry,
    layout: Layout,
    fresh: bool,
}

impl Superblock {
    /// A superblock in private memory
    pub fn anonymous(geometry: Geometry) -> Result<Self> {
        let layout = Layout::compute(&geometry)?;
        let region = Region::anonymous(layout.total)?;
        Self::from_region(region, geometry, layout)
    }

    /// Create or re-attach the shared-memory superblock `name`
    pub fn open_shm(name: &str, geometry: Geometry) -> Result<Self> {
        let layout = Layout::compute(&geometry)?;
        let region = Region::shm(name, layout.total)?;
        Self::from_region(region, geometry, layout)
    }

    /// Remove a shared-memory superblock
    pub fn unlink(name: &str) -> Result<()> {
        Region::unlink(name)
    }

    fn from_region(region: Region, geometry: Geometry, layout: Layout) -> Result<Self> {
        if region.len() != layout.total {
            return Err(Error::Layout(format!(
                "region is {} bytes, layout needs {}",
                region.len(),
                layout.total
            )));
        }

        let mut sb = Self {
            region,
            geometry,
            layout,
            fresh: false,
        };
        let fingerprint = sb.geometry.fingerprint();
        let header = Header::decode(&sb.region.as_slice()[sb.layout.header.range()]);

        match header {
            Some(h) if h.total_size == sb.layout.total as u64 && h.geometry == fingerprint => {
                info!(
                    "Re-attached superblock {} ({} bytes)",
                    sb.region.name().unwrap_or("<anonymous>"),
                    sb.layout.total
                );
            }
            Some(_) => {
                return Err(Error::Layout(
                    "superblock was formatted with a different geometry".into(),
                ));
            }
            None => {
                sb.init_structures()?;
                let header = Header {
                    total_size: sb.layout.total as u64,
                    geometry: fingerprint,
                };
                let span = sb.layout.header;
                header.encode(&mut sb.region.as_mut_slice()[span.range()]);
                sb.fresh = true;
                debug!("Formatted superblock of {} bytes", sb.layout.total);
            }
        }
        Ok(sb)
    }

    /// Reset every table to its empty state
    fn init_structures(&mut self) -> Result<()> {
        let geo = self.geometry;
        let mut parts = self.regions();

        parts.names.buf.fill(0);
        parts.metas.buf.fill(0);
        parts.chunk_metas.buf.fill(0);
        parts.fid_stack.init(geo.max_files)?;
        parts.chunk_stack.init(geo.max_chunks)?;
        if let Some(spill) = parts.spill_stack.as_mut() {
            spill.init(geo.spill_max_chunks)?;
        }
        parts.index.reset();
        parts.attrs.reset();
        Ok(())
    }

    /// Whether this handle formatted the region
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.region.name()
    }

    /// Entire region, for handing to a transport
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// The memory chunk data region, if memory storage is on
    #[must_use]
    pub fn data_region(&self) -> Option<&[u8]> {
        self.layout.chunks.map(|span| &self.region.as_slice()[span.range()])
    }

    pub(crate) fn lock_handle(&self) -> Result<Option<File>> {
        self.region.try_clone_handle()
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Split the region into typed views
    pub fn regions(&mut self) -> Regions<'_> {
        let geo = &self.geometry;
        let layout = &self.layout;
        let mut carver = Carver {
            rest: self.region.as_mut_slice(),
            consumed: 0,
        };

        let _header = carver.take(layout.header);
        let fid_stack = FreeStack::attach(carver.take(layout.fid_stack), "file ids");
        let names = NameTable {
            buf: carver.take(layout.names),
        };
        let metas = MetaTable {
            buf: carver.take(layout.metas),
        };
        let chunk_metas = ChunkMetaTable {
            buf: carver.take(layout.chunk_metas),
            per_file: geo.chunks_per_file(),
        };
        let chunk_stack = FreeStack::attach(carver.take(layout.chunk_stack), "memory chunks");
        let spill_stack = layout
            .spill_stack
            .map(|span| FreeStack::attach(carver.take(span), "spillover chunks"));
        let chunks = layout.chunks.map(|span| ChunkData {
            buf: carver.take(span),
            chunk_size: 1 << geo.chunk_bits,
        });
        let index = IndexLog::new(
            carver.take(layout.index_header),
            carver.take(layout.index_entries),
        );
        let attrs = AttrLog::new(
            carver.take(layout.attr_header),
            carver.take(layout.attr_entries),
        );

        Regions {
            fid_stack,
            names,
            metas,
            chunk_metas,
            chunk_stack,
            spill_stack,
            chunks,
            index,
            attrs,
        }
    }
}

struct Carver<'a> {
    rest: &'a mut [u8],
    consumed: usize,
}

impl<'a> Carver<'a> {
    /// Spans must be requested in layout order
    fn take(&mut self, span: Span) -> &'a mut [u8] {
        let buf = std::mem::take(&mut self.rest);
        let (_, tail) = buf.split_at_mut(span.offset - self.consumed);
        let (head, tail) = tail.split_at_mut(span.len);
        self.rest = tail;
        self.consumed = span.end();
        head
    }
}

/// Typed views of every sub-region
pub struct Regions<'a> {
    pub fid_stack: FreeStack<'a>,
    pub names: NameTable<'a>,
    pub metas: MetaTable<'a>,
    pub chunk_metas: ChunkMetaTable<'a>,
    pub chunk_stack: FreeStack<'a>,
    pub spill_stack: Option<FreeStack<'a>>,
    pub chunks: Option<ChunkData<'a>>,
    pub index: IndexLog<'a>,
    pub attrs: AttrLog<'a>,
}

fn slot_range(fid: Fid, slots: usize, size: usize) -> Result<std::ops::Range<usize>> {
    if fid.index() >= slots {
        return Err(Error::invalid_argument(format!(
            "fid {fid} outside table of {slots}"
        )));
    }
    let start = fid.index() * size;
    Ok(start..start + size)
}

/// Path of every file slot plus its in-use flag
///
/// Slot: `[in_use u8][pad u8][path field]`
pub struct NameTable<'a> {
    buf: &'a mut [u8],
}

impl NameTable<'_> {
    #[must_use]
    pub fn slots(&self) -> usize {
        self.buf.len() / NAME_SLOT_SIZE
    }

    #[must_use]
    pub fn in_use(&self, fid: Fid) -> bool {
        slot_range(fid, self.slots(), NAME_SLOT_SIZE).is_ok_and(|r| self.buf[r.start] != 0)
    }

    /// Path of an in-use slot
    pub fn path(&self, fid: Fid) -> Result<String> {
        let range = slot_range(fid, self.slots(), NAME_SLOT_SIZE)?;
        let slot = &self.buf[range];
        if slot[0] == 0 {
            return Err(Error::not_found(format!("fid {fid}")));
        }
        get_path(&mut &slot[2..])
    }

    pub fn set(&mut self, fid: Fid, path: &str) -> Result<()> {
        check_path(path)?;
        let range = slot_range(fid, self.slots(), NAME_SLOT_SIZE)?;
        let mut buf = &mut self.buf[range];
        buf.put_u8(1);
        buf.put_u8(0);
        put_path(&mut buf, path);
        Ok(())
    }

    pub fn clear(&mut self, fid: Fid) -> Result<()> {
        let range = slot_range(fid, self.slots(), NAME_SLOT_SIZE)?;
        self.buf[range].fill(0);
        Ok(())
    }

    /// In-use slots with their paths, in fid order
    #[must_use]
    pub fn entries(&self) -> Vec<(Fid, String)> {
        self.buf
            .chunks_exact(NAME_SLOT_SIZE)
            .enumerate()
            .filter(|(_, slot)| slot[0] != 0)
            .filter_map(|(i, slot)| {
                let fid = Fid::new(u32::try_from(i).ok()?);
                get_path(&mut &slot[2..]).ok().map(|path| (fid, path))
            })
            .collect()
    }

    /// Fid of the in-use slot holding exactly `path`
    #[must_use]
    pub fn find(&self, path: &str) -> Option<Fid> {
        self.entries()
            .into_iter()
            .find_map(|(fid, name)| (name == path).then_some(fid))
    }
}

pub struct MetaTable<'a> {
    buf: &'a mut [u8],
}

impl MetaTable<'_> {
    fn slots(&self) -> usize {
        self.buf.len() / FileMeta::SIZE
    }

    pub fn get(&self, fid: Fid) -> Result<FileMeta> {
        let range = slot_range(fid, self.slots(), FileMeta::SIZE)?;
        FileMeta::decode(&self.buf[range])
    }

    pub fn put(&mut self, fid: Fid, meta: &FileMeta) -> Result<()> {
        let range = slot_range(fid, self.slots(), FileMeta::SIZE)?;
        meta.encode(&mut self.buf[range]);
        Ok(())
    }
}

/// Each file's chunk list: a fixed-length run of slots per fid
pub struct ChunkMetaTable<'a> {
    buf: &'a mut [u8],
    per_file: usize,
}

impl ChunkMetaTable<'_> {
    const SLOT: usize = <Option<ChunkLocation>>::SIZE;

    fn slot(&self, fid: Fid, index: u64) -> Result<std::ops::Range<usize>> {
        let index = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.per_file)
            .ok_or_else(|| Error::invalid_argument(format!("chunk {index} of fid {fid}")))?;
        let files = self.buf.len() / (self.per_file * Self::SLOT).max(1);
        let file = slot_range(fid, files, self.per_file * Self::SLOT)?;
        let start = file.start + index * Self::SLOT;
        Ok(start..start + Self::SLOT)
    }

    pub fn get(&self, fid: Fid, index: u64) -> Result<Option<ChunkLocation>> {
        let range = self.slot(fid, index)?;
        <Option<ChunkLocation>>::decode(&self.buf[range])
    }

    pub fn set(&mut self, fid: Fid, index: u64, location: Option<ChunkLocation>) -> Result<()> {
        let range = self.slot(fid, index)?;
        location.encode(&mut self.buf[range]);
        Ok(())
    }
}

/// The in-memory chunk data region
pub struct ChunkData<'a> {
    buf: &'a mut [u8],
    chunk_size: usize,
}

impl ChunkData<'_> {
    fn range(&self, id: u32, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let offset = usize::try_from(offset).map_err(|_| Error::io("chunk offset"))?;
        if offset + len > self.chunk_size {
            return Err(Error::io(format!(
                "{len} bytes at {offset} overrun a {} byte chunk",
                self.chunk_size
            )));
        }
        let start = id as usize * self.chunk_size + offset;
        if start + len > self.buf.len() {
            return Err(Error::io(format!("memory chunk {id} outside data region")));
        }
        Ok(start..start + len)
    }

    pub fn read(&self, id: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.range(id, offset, out.len())?;
        out.copy_from_slice(&self.buf[range]);
        Ok(())
    }

    pub fn write(&mut self, id: u32, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(id, offset, data.len())?;
        self.buf[range].copy_from_slice(data);
        Ok(())
    }
}
