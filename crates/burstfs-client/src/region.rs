//! Memory regions backing the superblock
//!
//! A region is either a named POSIX shared-memory object, which the
//! server-side delegator and other local processes can map by name, or a
//! private anonymous mapping.

use burstfs_common::{Error, Result};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use tracing::{debug, info};

enum Backing {
    Anonymous,
    Shm { name: String, file: File },
}

/// A mapped, writable region
pub struct Region {
    map: MmapMut,
    backing: Backing,
}

impl Region {
    /// Map a private, zero-filled region
    pub fn anonymous(size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size)
            .map_err(|e| Error::Layout(format!("failed to map {size} anonymous bytes: {e}")))?;
        debug!("Mapped anonymous region of {} bytes", size);
        Ok(Self {
            map,
            backing: Backing::Anonymous,
        })
    }

    /// Create the shared-memory object `name`, or attach to it if it exists
    ///
    /// An existing object must already be exactly `size` bytes.
    pub fn shm(name: &str, size: usize) -> Result<Self> {
        let shm_name = Self::object_name(name);
        let mode = Mode::from_bits_truncate(0o600);

        let (fd, created) = match shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            mode,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => {
                let fd = shm_open(shm_name.as_str(), OFlag::O_RDWR, mode)
                    .map_err(|e| Error::Layout(format!("failed to open {shm_name}: {e}")))?;
                (fd, false)
            }
            Err(e) => return Err(Error::Layout(format!("failed to create {shm_name}: {e}"))),
        };
        let file = File::from(fd);

        if created {
            file.set_len(size as u64).map_err(|e| {
                Error::Layout(format!("failed to size {shm_name} to {size} bytes: {e}"))
            })?;
            info!("Created shared superblock {} ({} bytes)", shm_name, size);
        } else {
            let actual = file.metadata()?.len();
            if actual != size as u64 {
                return Err(Error::Layout(format!(
                    "{shm_name} is {actual} bytes, expected {size}"
                )));
            }
            info!("Attached to shared superblock {} ({} bytes)", shm_name, size);
        }

        // SAFETY: the object is sized to `size` above and only ever resized
        // by this module at creation.
        #[allow(unsafe_code)]
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::Layout(format!("failed to map {shm_name}: {e}")))?;

        Ok(Self {
            map,
            backing: Backing::Shm {
                name: shm_name,
                file,
            },
        })
    }

    /// Remove the shared-memory object `name`; missing objects are ignored
    pub fn unlink(name: &str) -> Result<()> {
        let shm_name = Self::object_name(name);
        match shm_unlink(shm_name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(Error::Layout(format!("failed to unlink {shm_name}: {e}"))),
        }
    }

    fn object_name(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Shared-memory object name, if any
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::Shm { name, .. } => Some(name),
        }
    }

    /// A second handle to the shared-memory object, used for locking
    pub fn try_clone_handle(&self) -> Result<Option<File>> {
        match &self.backing {
            Backing::Anonymous => Ok(None),
            Backing::Shm { file, .. } => Ok(Some(file.try_clone()?)),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn flush(&self) -> Result<()> {
        if matches!(self.backing, Backing::Shm { .. }) {
            self.map.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("burstfs-test-{}-{}-{}", tag, std::process::id(), rand::random::<u32>())
    }

    #[test]
    fn test_anonymous_region_is_zeroed() {
        let region = Region::anonymous(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert!(region.try_clone_handle().unwrap().is_none());
        assert!(region.name().is_none());
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shm_create_and_attach() {
        let name = unique_name("region");
        {
            let mut region = Region::shm(&name, 4096).unwrap();
            assert_eq!(region.name(), Some(format!("/{name}").as_str()));
            assert!(region.as_slice().iter().all(|&b| b == 0));
            region.as_mut_slice()[10] = 42;
        }

        // attaching keeps the contents
        let region = Region::shm(&name, 4096).unwrap();
        assert_eq!(region.as_slice()[10], 42);
        assert!(region.try_clone_handle().unwrap().is_some());

        // size mismatch on attach is fatal
        assert!(matches!(Region::shm(&name, 8192), Err(Error::Layout(_))));

        Region::unlink(&name).unwrap();
        Region::unlink(&name).unwrap();
    }
}
