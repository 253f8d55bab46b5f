//! Shared logs read by the server side
//!
//! Both logs are a one-page header holding an entry count (u64 at offset 0)
//! followed by a packed array of fixed-size records:
//!
//! - [`IndexLog`] is append-only. The entry is written before the count is
//!   raised, so a reader never sees a count covering a half-written entry.
//! - [`AttrLog`] mirrors the attributes of files this client knows about,
//!   kept sorted by local fid.

use crate::records::{LogIndexEntry, Record};
use burstfs_common::{Error, Fid, GlobalFileAttr, Result};

fn read_count(header: &[u8]) -> usize {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&header[..8]);
    usize::try_from(u64::from_le_bytes(raw)).unwrap_or(usize::MAX)
}

fn write_count(header: &mut [u8], count: usize) {
    header[..8].copy_from_slice(&(count as u64).to_le_bytes());
}

/// Append-only log of write pieces
pub struct IndexLog<'a> {
    header: &'a mut [u8],
    entries: &'a mut [u8],
}

impl<'a> IndexLog<'a> {
    pub(crate) fn new(header: &'a mut [u8], entries: &'a mut [u8]) -> Self {
        Self { header, entries }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len() / LogIndexEntry::SIZE
    }

    /// Valid entries, clamped to capacity
    #[must_use]
    pub fn len(&self) -> usize {
        read_count(&*self.header).min(self.capacity())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, entry: &LogIndexEntry) -> Result<()> {
        let count = self.len();
        if count >= self.capacity() {
            return Err(Error::no_space(format!(
                "log index full at {count} entries"
            )));
        }
        let start = count * LogIndexEntry::SIZE;
        entry.encode(&mut self.entries[start..start + LogIndexEntry::SIZE]);
        write_count(self.header, count + 1);
        Ok(())
    }

    /// Entries in append order
    pub fn entries(&self) -> Result<Vec<LogIndexEntry>> {
        self.entries
            .chunks_exact(LogIndexEntry::SIZE)
            .take(self.len())
            .map(LogIndexEntry::decode)
            .collect()
    }

    /// Hand out every entry and empty the log
    pub fn take(&mut self) -> Result<Vec<LogIndexEntry>> {
        let entries = self.entries()?;
        self.reset();
        Ok(entries)
    }

    pub fn reset(&mut self) {
        write_count(self.header, 0);
    }
}

/// Attribute mirror sorted by fid
pub struct AttrLog<'a> {
    header: &'a mut [u8],
    entries: &'a mut [u8],
}

impl<'a> AttrLog<'a> {
    pub(crate) fn new(header: &'a mut [u8], entries: &'a mut [u8]) -> Self {
        Self { header, entries }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len() / GlobalFileAttr::SIZE
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read_count(&*self.header).min(self.capacity())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        write_count(self.header, 0);
    }

    fn decode_at(&self, i: usize) -> Result<GlobalFileAttr> {
        let start = i * GlobalFileAttr::SIZE;
        GlobalFileAttr::decode(&self.entries[start..start + GlobalFileAttr::SIZE])
    }

    /// Insert keeping entries ordered by fid
    ///
    /// Scans back from the tail for the last entry whose fid is not greater
    /// than the new one and places the new entry right after it, so equal
    /// fids keep insertion order.
    pub fn insert(&mut self, attr: &GlobalFileAttr) -> Result<()> {
        let count = self.len();
        if count >= self.capacity() {
            return Err(Error::no_space(format!(
                "attribute mirror full at {count} entries"
            )));
        }

        let mut pos = 0;
        for i in (0..count).rev() {
            if self.decode_at(i)?.fid <= attr.fid {
                pos = i + 1;
                break;
            }
        }

        let size = GlobalFileAttr::SIZE;
        self.entries
            .copy_within(pos * size..count * size, (pos + 1) * size);
        attr.encode(&mut self.entries[pos * size..(pos + 1) * size]);
        write_count(self.header, count + 1);
        Ok(())
    }

    /// Drop every entry for `fid`
    pub fn remove_fid(&mut self, fid: Fid) -> Result<usize> {
        let size = GlobalFileAttr::SIZE;
        let count = self.len();
        let mut kept = 0;
        for i in 0..count {
            if self.decode_at(i)?.fid == fid {
                continue;
            }
            if kept != i {
                self.entries.copy_within(i * size..(i + 1) * size, kept * size);
            }
            kept += 1;
        }
        write_count(self.header, kept);
        Ok(count - kept)
    }

    pub fn find(&self, fid: Fid) -> Result<Option<GlobalFileAttr>> {
        for i in 0..self.len() {
            let attr = self.decode_at(i)?;
            if attr.fid == fid {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }

    pub fn entries(&self) -> Result<Vec<GlobalFileAttr>> {
        (0..self.len()).map(|i| self.decode_at(i)).collect()
    }

    #[cfg(test)]
    pub(crate) fn entries_end_ptr(&self) -> *const u8 {
        self.entries.as_ptr_range().end
    }
}
