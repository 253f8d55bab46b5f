//! BurstFS Client
//!
//! The client-side storage engine of the BurstFS burst-buffer file system.
//! Each application process owns one superblock: a contiguous region,
//! usually shared memory, holding its file table, chunk allocators, log
//! index, attribute mirror and in-memory chunk data. Chunks that do not
//! fit in memory spill into a per-process file on local storage.
//!
//! # Superblock layout
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ header               │
//! │ fid stack            │
//! │ name table           │
//! │ file metadata        │
//! │ chunk lists          │
//! │ memory chunk stack   │
//! │ spillover chunk stack│
//! ├──────────────────────┤ page aligned
//! │ chunk data           │
//! ├──────────────────────┤
//! │ log index            │
//! ├──────────────────────┤
//! │ attribute mirror     │
//! └──────────────────────┘ total
//! ```
//!
//! [`Layout::compute`] is the single definition of these offsets.

pub mod chunk;
pub mod client;
pub mod index;
pub mod layout;
pub mod namespace;
pub mod reconcile;
pub mod records;
pub mod region;
pub mod service;
pub mod spill;
pub mod stack;
pub mod storage;
pub mod superblock;

pub use chunk::{ChunkMapper, ChunkRange};
pub use client::Client;
pub use index::{AttrLog, IndexLog};
pub use layout::{Geometry, Layout, Span, compute_size};
pub use reconcile::OpenFile;
pub use records::{ChunkKind, ChunkLocation, FileMeta, LockState, LogIndexEntry, Storage};
pub use service::{InMemoryMetaService, MetadataService, MountDescriptor};
pub use storage::ChunkPlacement;
pub use superblock::{Superblock, shm_name};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::client::Client;
    use crate::service::InMemoryMetaService;
    use burstfs_common::{ClientConfig, RegionBacking};
    use std::path::Path;
    use std::sync::Arc;

    pub const CHUNK: u64 = 4096;

    /// 8 files, 4 memory chunks and 8 spillover chunks of 4 KiB
    pub fn small_config() -> ClientConfig {
        ClientConfig {
            max_files: 8,
            chunk_bits: 12,
            chunk_mem: 4 * CHUNK,
            spillover_size: 8 * CHUNK,
            index_buf_size: 1024 * 32,
            fattr_buf_size: 16 * 216,
            region: RegionBacking::Anonymous,
            ..ClientConfig::default()
        }
    }

    pub fn client_config(dir: &Path, rank: u32) -> ClientConfig {
        ClientConfig {
            spillover_dir: dir.to_path_buf(),
            local_rank: rank,
            ..small_config()
        }
    }

    pub fn mount(dir: &Path, service: &InMemoryMetaService, rank: u32) -> Client {
        mount_with(dir, service, rank, |c| c)
    }

    pub fn mount_with(
        dir: &Path,
        service: &InMemoryMetaService,
        rank: u32,
        tweak: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> Client {
        let config = tweak(client_config(dir, rank));
        Client::mount("/burst", config, Arc::new(service.clone())).unwrap()
    }
}
