//! Client configuration
//!
//! [`ClientConfig`] carries the knobs that size the superblock: how many
//! files, how large a chunk is, how much memory and spillover space back
//! the chunks. It can be layered from a TOML file and `BURSTFS_*`
//! environment variables with [`ClientConfig::load`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage kind given to newly created files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Data lives at its logical position in fixed-size chunks
    FixedChunk,
    /// Like fixed chunks, plus one log index entry per write piece
    #[default]
    LogStructured,
}

/// What backs the superblock region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionBacking {
    /// Named POSIX shared memory, visible to the server-side delegator
    #[default]
    Shm,
    /// Private anonymous mapping
    Anonymous,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application id, part of the shared-memory and spillover names
    pub app_id: u32,
    /// Rank of this client on the node
    pub local_rank: u32,
    /// Maximum number of files (and directories) per client
    pub max_files: usize,
    /// log2 of the chunk size in bytes
    pub chunk_bits: u32,
    /// Bytes of memory set aside for chunk data
    pub chunk_mem: u64,
    /// Whether chunks may be placed in memory
    pub memfs_enabled: bool,
    /// Whether chunks may be placed in the spillover file
    pub spillover_enabled: bool,
    /// Size of the spillover file in bytes
    pub spillover_size: u64,
    /// Directory holding the spillover file
    pub spillover_dir: PathBuf,
    /// Bytes reserved for log index entries
    pub index_buf_size: u64,
    /// Bytes reserved for the file attribute mirror
    pub fattr_buf_size: u64,
    /// One region shared by several processes on the node
    pub single_shm: bool,
    pub storage: StorageMode,
    pub region: RegionBacking,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            local_rank: 0,
            max_files: 128,
            chunk_bits: 24,
            chunk_mem: 256 * 1024 * 1024,
            memfs_enabled: true,
            spillover_enabled: true,
            spillover_size: 1024 * 1024 * 1024,
            spillover_dir: PathBuf::from("/tmp"),
            index_buf_size: 20 * 1024 * 1024,
            fattr_buf_size: 1024 * 1024,
            single_shm: false,
            storage: StorageMode::default(),
            region: RegionBacking::default(),
        }
    }
}

impl ClientConfig {
    pub const MIN_CHUNK_BITS: u32 = 10;
    pub const MAX_CHUNK_BITS: u32 = 30;

    /// Load defaults, then an optional TOML file, then `BURSTFS_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(config::Environment::with_prefix("BURSTFS").try_parsing(true));

        let parsed: Self = builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        1 << self.chunk_bits
    }

    #[must_use]
    pub const fn chunk_mask(&self) -> u64 {
        self.chunk_size() - 1
    }

    /// Number of memory chunks, zero when memory storage is off
    #[must_use]
    pub const fn max_chunks(&self) -> u64 {
        if self.memfs_enabled {
            self.chunk_mem >> self.chunk_bits
        } else {
            0
        }
    }

    /// Number of spillover chunks, zero when spillover is off
    #[must_use]
    pub const fn spillover_max_chunks(&self) -> u64 {
        if self.spillover_enabled {
            self.spillover_size >> self.chunk_bits
        } else {
            0
        }
    }

    /// Reject configurations no superblock can be built from
    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_CHUNK_BITS..=Self::MAX_CHUNK_BITS).contains(&self.chunk_bits) {
            return Err(Error::Configuration(format!(
                "chunk_bits {} outside {}..={}",
                self.chunk_bits,
                Self::MIN_CHUNK_BITS,
                Self::MAX_CHUNK_BITS
            )));
        }
        if self.max_files == 0 || u32::try_from(self.max_files).is_err() {
            return Err(Error::Configuration(format!(
                "max_files {} must be between 1 and {}",
                self.max_files,
                u32::MAX
            )));
        }
        if !self.memfs_enabled && !self.spillover_enabled {
            return Err(Error::Configuration(
                "memory and spillover storage are both disabled".into(),
            ));
        }
        if self.memfs_enabled && self.max_chunks() == 0 {
            return Err(Error::Configuration(format!(
                "chunk_mem {} holds no {}-byte chunk",
                self.chunk_mem,
                self.chunk_size()
            )));
        }
        if self.spillover_enabled && self.spillover_max_chunks() == 0 {
            return Err(Error::Configuration(format!(
                "spillover_size {} holds no {}-byte chunk",
                self.spillover_size,
                self.chunk_size()
            )));
        }
        if self.max_chunks() > u64::from(u32::MAX) || self.spillover_max_chunks() > u64::from(u32::MAX)
        {
            return Err(Error::Configuration("chunk count exceeds u32 ids".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_files, 128);
        assert_eq!(cfg.chunk_size(), 16 * 1024 * 1024);
        assert_eq!(cfg.chunk_mask(), cfg.chunk_size() - 1);
        assert_eq!(cfg.max_chunks(), 16);
        assert_eq!(cfg.spillover_max_chunks(), 64);
        assert_eq!(cfg.storage, StorageMode::LogStructured);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let cfg = ClientConfig {
            chunk_bits: 4,
            ..ClientConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let cfg = ClientConfig {
            memfs_enabled: false,
            spillover_enabled: false,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            chunk_mem: 1024,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            max_files: 0,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_disabled_tiers_have_no_chunks() {
        let cfg = ClientConfig {
            memfs_enabled: false,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.max_chunks(), 0);
        cfg.validate().unwrap();

        let cfg = ClientConfig {
            spillover_enabled: false,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.spillover_max_chunks(), 0);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "max_files = 16\nchunk_bits = 12\nstorage = \"fixed_chunk\"\nregion = \"anonymous\"\nspillover_dir = \"/var/tmp\""
        )
        .unwrap();
        drop(file);

        let cfg = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.max_files, 16);
        assert_eq!(cfg.chunk_bits, 12);
        assert_eq!(cfg.storage, StorageMode::FixedChunk);
        assert_eq!(cfg.region, RegionBacking::Anonymous);
        assert_eq!(cfg.spillover_dir, PathBuf::from("/var/tmp"));
        // untouched keys keep their defaults
        assert_eq!(cfg.chunk_mem, 256 * 1024 * 1024);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "chunk_bits = 40\n").unwrap();
        assert!(matches!(
            ClientConfig::load(Some(&path)),
            Err(Error::Configuration(_))
        ));
    }
}
