//! Spillover file
//!
//! Chunks that do not fit in memory live in one preallocated local file,
//! chunk `i` at byte offset `i * chunk_size`. The file is sized once when
//! it is created and never resized afterwards.

use burstfs_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Preallocated file backing spillover chunks
#[derive(Debug)]
pub struct SpillFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl SpillFile {
    /// `<dir>/spill_<app_id>_<rank>.log`
    #[must_use]
    pub fn path_for(dir: &Path, app_id: u32, local_rank: u32) -> PathBuf {
        dir.join(format!("spill_{app_id}_{local_rank}.log"))
    }

    /// Create the file at `size` bytes, or attach to an existing one
    pub fn open(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path);

        let file = match created {
            Ok(file) => {
                file.set_len(size).map_err(|e| {
                    Error::io(format!("failed to size {} to {size}: {e}", path.display()))
                })?;
                info!("Created spillover file {} ({} bytes)", path.display(), size);
                file
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| Error::io(format!("failed to open {}: {e}", path.display())))?;
                let actual = file.metadata()?.len();
                if actual < size {
                    return Err(Error::Configuration(format!(
                        "spillover file {} is {actual} bytes, expected {size}",
                        path.display()
                    )));
                }
                debug!("Attached to spillover file {}", path.display());
                file
            }
            Err(e) => {
                return Err(Error::io(format!(
                    "failed to create {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(Self { file, path, size })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::io("spillover offset overflows"))?;
        if end > self.size {
            return Err(Error::io(format!(
                "spillover access {offset}..{end} beyond {} bytes",
                self.size
            )));
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write all of `data` at `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
