//! Chunk storage manager
//!
//! A file's bytes live in the chunks listed in its chunk list: byte `p` is
//! at offset `p & chunk_mask` of chunk `p >> chunk_bits`. Chunks come from
//! memory first, then from the spillover file. Log-structured files also
//! record every write piece in the log index.
//!
//! `read` and `write` expect the caller to have reserved chunks covering
//! the range with `extend`; ranges past the reserved space are rejected.

use crate::client::{Client, live_meta};
use crate::records::{ChunkLocation, LogIndexEntry, Storage};
use crate::stack::StackLock;
use crate::superblock::Regions;
use burstfs_common::{Error, Fid, Result};
use tracing::{debug, warn};

/// Upper bound of the scratch buffer used for zero-filling
const ZERO_FILL_BUF: usize = 1024 * 1024;

/// Where one chunk of a file lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    /// Position in the file's chunk list
    pub index: u64,
    pub location: ChunkLocation,
    /// Byte offset of the chunk in its backing (data region or spillover file)
    pub offset: u64,
    pub length: u64,
}

/// Take a chunk, memory first
fn alloc_chunk(lock: &dyn StackLock, parts: &mut Regions<'_>) -> Result<ChunkLocation> {
    let _guard = lock.acquire()?;
    match parts.chunk_stack.pop() {
        Ok(id) => return Ok(ChunkLocation::Memory(id)),
        Err(Error::Exhausted(_)) => {}
        Err(e) => return Err(e),
    }
    if let Some(spill) = parts.spill_stack.as_mut() {
        match spill.pop() {
            Ok(id) => return Ok(ChunkLocation::Spillover(id)),
            Err(Error::Exhausted(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Err(Error::no_space("memory and spillover chunks exhausted"))
}

fn release_chunk(
    lock: &dyn StackLock,
    parts: &mut Regions<'_>,
    fid: Fid,
    index: u64,
) -> Result<()> {
    if let Some(location) = parts.chunk_metas.get(fid, index)? {
        let _guard = lock.acquire()?;
        match location {
            ChunkLocation::Memory(id) => parts.chunk_stack.push(id)?,
            ChunkLocation::Spillover(id) => parts
                .spill_stack
                .as_mut()
                .ok_or_else(|| Error::io("spillover chunk without spillover storage"))?
                .push(id)?,
        }
    }
    parts.chunk_metas.set(fid, index, None)
}

fn chunk_at(parts: &Regions<'_>, fid: Fid, index: u64) -> Result<ChunkLocation> {
    parts
        .chunk_metas
        .get(fid, index)?
        .ok_or_else(|| Error::io(format!("fid {fid} has no chunk {index}")))
}

impl Client {
    /// Byte offset of `offset_in_chunk` within the chunk's backing
    const fn physical(&self, location: ChunkLocation, offset_in_chunk: u64) -> u64 {
        ((location.id() as u64) << self.geometry.chunk_bits) + offset_in_chunk
    }

    /// Check `[pos, pos + len)` is covered by reserved chunks
    fn reserved_end(&self, fid: Fid, chunks: u64, pos: u64, len: usize) -> Result<u64> {
        let end = pos
            .checked_add(len as u64)
            .ok_or_else(|| Error::invalid_argument(format!("offset {pos} + {len} overflows")))?;
        let reserved = chunks << self.geometry.chunk_bits;
        if end > reserved {
            return Err(Error::invalid_argument(format!(
                "fid {fid}: range ending at {end} beyond {reserved} reserved bytes"
            )));
        }
        Ok(end)
    }

    /// Copy `buf.len()` bytes starting at `pos` out of `fid`
    pub fn read(&mut self, fid: Fid, pos: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let meta = self.meta_of(fid)?;
        if !meta.storage.is_chunked() {
            return Err(Error::io(format!("fid {fid} has no data storage")));
        }
        self.reserved_end(fid, meta.chunks, pos, buf.len())?;

        let ranges = self.mapper.byte_range_to_chunks(pos, buf.len() as u64);
        let locations: Vec<ChunkLocation> = {
            let parts = self.superblock.regions();
            ranges
                .iter()
                .map(|r| chunk_at(&parts, fid, r.chunk_index))
                .collect::<Result<_>>()?
        };

        let mut done = 0;
        for (range, location) in ranges.iter().zip(locations) {
            #[allow(clippy::cast_possible_truncation)]
            let out = &mut buf[done..done + range.length as usize];
            match location {
                ChunkLocation::Memory(id) => {
                    let data = self
                        .superblock
                        .data_region()
                        .ok_or_else(|| Error::io("memory chunk without a data region"))?;
                    let start = usize::try_from(self.physical(location, range.offset_in_chunk))
                        .map_err(|_| Error::io(format!("memory chunk {id} offset")))?;
                    let src = data
                        .get(start..start + out.len())
                        .ok_or_else(|| Error::io(format!("memory chunk {id} outside data region")))?;
                    out.copy_from_slice(src);
                }
                ChunkLocation::Spillover(_) => {
                    let spill = self
                        .spill
                        .as_ref()
                        .ok_or_else(|| Error::io("spillover chunk without spillover storage"))?;
                    spill.read_at(self.physical(location, range.offset_in_chunk), out)?;
                }
            }
            done += out.len();
        }
        Ok(())
    }

    /// Copy `data` into `fid` starting at `pos`
    ///
    /// For log-structured files every intra-chunk piece is appended to the
    /// log index, and `size` / `log_size` grow to cover the write. A write
    /// needing more index entries than are free fails with `NoSpace` before
    /// any data or entry is written.
    pub fn write(&mut self, fid: Fid, pos: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut meta = self.meta_of(fid)?;
        if !meta.storage.is_chunked() {
            return Err(Error::io(format!("fid {fid} has no data storage")));
        }
        let end = self.reserved_end(fid, meta.chunks, pos, data.len())?;

        let ranges = self.mapper.byte_range_to_chunks(pos, data.len() as u64);
        if matches!(meta.storage, Storage::LogStructured { .. }) {
            let parts = self.superblock.regions();
            let free = parts.index.capacity() - parts.index.len();
            if free < ranges.len() {
                return Err(Error::no_space(format!(
                    "fid {fid}: write needs {} index entries, {free} free",
                    ranges.len()
                )));
            }
        }
        let mut done = 0;
        for range in &ranges {
            #[allow(clippy::cast_possible_truncation)]
            let piece = &data[done..done + range.length as usize];
            let location = {
                let mut parts = self.superblock.regions();
                let location = chunk_at(&parts, fid, range.chunk_index)?;
                if let ChunkLocation::Memory(id) = location {
                    parts
                        .chunks
                        .as_mut()
                        .ok_or_else(|| Error::io("memory chunk without a data region"))?
                        .write(id, range.offset_in_chunk, piece)?;
                }
                location
            };
            let phys_pos = self.physical(location, range.offset_in_chunk);
            if let ChunkLocation::Spillover(_) = location {
                self.spill
                    .as_ref()
                    .ok_or_else(|| Error::io("spillover chunk without spillover storage"))?
                    .write_at(phys_pos, piece)?;
            }

            if matches!(meta.storage, Storage::LogStructured { .. }) {
                let entry = LogIndexEntry {
                    fid,
                    file_pos: range.file_offset,
                    phys_pos,
                    length: range.length,
                    kind: location.kind(),
                };
                if let Err(e) = self.superblock.regions().index.append(&entry) {
                    warn!("fid {}: log index append failed at {}: {}", fid, range.file_offset, e);
                    return Err(e);
                }
            }
            done += piece.len();
        }

        if let Storage::LogStructured { log_size } = meta.storage {
            meta.storage = Storage::LogStructured {
                log_size: log_size.max(end),
            };
            meta.size = meta.size.max(end);
            self.superblock.regions().metas.put(fid, &meta)?;
        }
        Ok(())
    }

    /// Reserve chunks so `fid` can hold `length` bytes
    ///
    /// Fixed-chunk files also grow their size to `length`. On failure the
    /// chunks reserved so far stay with the file.
    pub fn extend(&mut self, fid: Fid, length: u64) -> Result<()> {
        let max = self.geometry.max_file_size();
        let needed = self.mapper.chunks_for_size(length);
        let mut parts = self.superblock.regions();
        let mut meta = live_meta(&parts, fid)?;
        if !meta.storage.is_chunked() {
            return Err(Error::io(format!("fid {fid} has no data storage")));
        }
        if length > max {
            return Err(Error::no_space(format!(
                "fid {fid}: {length} bytes exceeds the {max} byte file limit"
            )));
        }

        let mut result = Ok(());
        while meta.chunks < needed {
            match alloc_chunk(self.lock.as_ref(), &mut parts) {
                Ok(location) => {
                    if let Err(e) = parts.chunk_metas.set(fid, meta.chunks, Some(location)) {
                        result = Err(e);
                        break;
                    }
                    meta.chunks += 1;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() && meta.storage == Storage::FixedChunk && length > meta.size {
            meta.size = length;
        }
        parts.metas.put(fid, &meta)?;
        if let Err(e) = &result {
            debug!("fid {}: extend to {} stopped at {} chunks: {}", fid, length, meta.chunks, e);
        }
        result
    }

    /// Release the chunks beyond the one covering `length`
    pub fn shrink(&mut self, fid: Fid, length: u64) -> Result<()> {
        let keep = self.mapper.chunks_for_size(length);
        let mut parts = self.superblock.regions();
        let mut meta = live_meta(&parts, fid)?;
        if keep >= meta.chunks {
            return Ok(());
        }

        let mut result = Ok(());
        while meta.chunks > keep {
            if let Err(e) = release_chunk(self.lock.as_ref(), &mut parts, fid, meta.chunks - 1) {
                result = Err(e);
                break;
            }
            meta.chunks -= 1;
        }
        parts.metas.put(fid, &meta)?;
        result
    }

    /// Set the size of `fid` to `length`, zero-filling any growth
    pub fn truncate(&mut self, fid: Fid, length: u64) -> Result<()> {
        let meta = self.meta_of(fid)?;
        if meta.is_dir {
            return Err(Error::IsADirectory(format!("fid {fid}")));
        }

        if length < meta.size {
            self.shrink(fid, length)?;
        } else if length > meta.size {
            self.extend(fid, length).map_err(|e| {
                warn!("fid {}: truncate to {} could not reserve space: {}", fid, length, e);
                Error::no_space(format!("fid {fid}: cannot grow to {length} bytes"))
            })?;
            self.write_zero(fid, meta.size, length - meta.size)?;
        }

        let mut parts = self.superblock.regions();
        let mut meta = parts.metas.get(fid)?;
        meta.size = length;
        if let Storage::LogStructured { log_size } = meta.storage {
            meta.storage = Storage::LogStructured {
                log_size: log_size.min(length),
            };
        }
        parts.metas.put(fid, &meta)
    }

    /// Write `count` zero bytes at `pos`
    pub fn write_zero(&mut self, fid: Fid, pos: u64, count: u64) -> Result<()> {
        pos.checked_add(count)
            .ok_or_else(|| Error::invalid_argument(format!("offset {pos} + {count} overflows")))?;
        let zeros = vec![0u8; usize::try_from(count).map_or(ZERO_FILL_BUF, |c| c.min(ZERO_FILL_BUF))];

        let mut written = 0u64;
        while written < count {
            #[allow(clippy::cast_possible_truncation)]
            let n = (count - written).min(zeros.len() as u64) as usize;
            if let Err(e) = self.write(fid, pos + written, &zeros[..n]) {
                warn!("fid {}: zero-fill failed at {}: {}", fid, pos + written, e);
                return Err(Error::io(format!(
                    "fid {fid}: zero-fill failed at {}: {e}",
                    pos + written
                )));
            }
            written += n as u64;
        }
        Ok(())
    }

    /// Physical placement of every chunk of the file at `path`
    pub fn chunk_list(&mut self, path: &str) -> Result<Vec<ChunkPlacement>> {
        let fid = self.lookup(path)?;
        let chunk_size = self.geometry.chunk_size();
        let meta = self.meta_of(fid)?;
        let parts = self.superblock.regions();
        (0..meta.chunks)
            .map(|index| {
                let location = chunk_at(&parts, fid, index)?;
                Ok(ChunkPlacement {
                    index,
                    location,
                    offset: u64::from(location.id()) * chunk_size,
                    length: chunk_size,
                })
            })
            .collect()
    }
}
