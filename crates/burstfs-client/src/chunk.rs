//! Chunk mapping for file data
//!
//! Maps logical byte offsets within a file to positions in the file's
//! chunk list.

/// A range of bytes within one chunk of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position in the file's chunk list
    pub chunk_index: u64,
    /// Byte offset within the chunk
    pub offset_in_chunk: u64,
    /// Logical file offset the range starts at
    pub file_offset: u64,
    /// Number of bytes in this range
    pub length: u64,
}

/// Splits byte ranges on chunk boundaries
///
/// ```text
/// File
/// ├── Chunk 0:  bytes 0 .. 2^bits
/// ├── Chunk 1:  bytes 2^bits .. 2 * 2^bits
/// │   ...
/// └── Chunk N:  ...
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ChunkMapper {
    chunk_bits: u32,
}

impl ChunkMapper {
    #[must_use]
    pub const fn new(chunk_bits: u32) -> Self {
        Self { chunk_bits }
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        1 << self.chunk_bits
    }

    #[must_use]
    pub const fn chunk_mask(&self) -> u64 {
        self.chunk_size() - 1
    }

    #[must_use]
    pub const fn chunk_index(&self, offset: u64) -> u64 {
        offset >> self.chunk_bits
    }

    #[must_use]
    pub const fn offset_in_chunk(&self, offset: u64) -> u64 {
        offset & self.chunk_mask()
    }

    /// Number of chunks needed to hold `size` bytes
    #[must_use]
    pub const fn chunks_for_size(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size())
    }

    /// Convert a byte range to chunk ranges
    ///
    /// The caller guarantees `start + length` does not overflow.
    #[must_use]
    pub fn byte_range_to_chunks(&self, start: u64, length: u64) -> Vec<ChunkRange> {
        if length == 0 {
            return Vec::new();
        }

        let end = start + length;
        let first = self.chunk_index(start);
        let last = self.chunk_index(end - 1);

        (first..=last)
            .map(|chunk_index| {
                let chunk_start = chunk_index << self.chunk_bits;
                let range_start = start.max(chunk_start);
                let range_end = end.min(chunk_start + self.chunk_size());
                ChunkRange {
                    chunk_index,
                    offset_in_chunk: range_start - chunk_start,
                    file_offset: range_start,
                    length: range_end - range_start,
                }
            })
            .collect()
    }
}
