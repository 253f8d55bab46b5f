//! File identity table
//!
//! Maps paths to local fids. Lookups are linear scans over the name table;
//! the table is small and bounded by `max_files`.

use crate::client::{Client, live_meta};
use crate::records::{FileMeta, LockState, check_path};
use burstfs_common::{Error, FileAttr, Fid, Gfid, Result};
use tracing::debug;

impl Client {
    pub(crate) fn alloc_fid(&mut self) -> Result<Fid> {
        let mut parts = self.superblock.regions();
        let _guard = self.lock.acquire()?;
        parts.fid_stack.pop().map(Fid::new)
    }

    pub(crate) fn free_fid(&mut self, fid: Fid) -> Result<()> {
        let mut parts = self.superblock.regions();
        let _guard = self.lock.acquire()?;
        parts.fid_stack.push(fid.as_u32())
    }

    /// Allocate a fid for `path` with empty metadata
    ///
    /// Does not look for an existing entry with the same path.
    pub fn create_file(&mut self, path: &str) -> Result<Fid> {
        check_path(path)?;
        let fid = self.alloc_fid()?;

        let mut parts = self.superblock.regions();
        parts.names.set(fid, path)?;
        parts.metas.put(fid, &FileMeta::default())?;
        debug!("Created entry {} as fid {}", path, fid);
        Ok(fid)
    }

    pub(crate) fn find_fid(&mut self, path: &str) -> Option<Fid> {
        self.superblock.regions().names.find(path)
    }

    /// Fid of the local entry for `path`
    pub fn lookup(&mut self, path: &str) -> Result<Fid> {
        self.find_fid(path)
            .ok_or_else(|| Error::not_found(path.to_string()))
    }

    pub fn path_of(&mut self, fid: Fid) -> Result<String> {
        self.superblock.regions().names.path(fid)
    }

    #[must_use]
    pub fn is_dir(&mut self, fid: Fid) -> bool {
        let parts = self.superblock.regions();
        live_meta(&parts, fid).is_ok_and(|meta| meta.is_dir)
    }

    /// Whether no local entry lies strictly below `path`
    #[must_use]
    pub fn is_dir_empty(&mut self, path: &str) -> bool {
        let dir = path.trim_end_matches('/');
        !self
            .superblock
            .regions()
            .names
            .entries()
            .iter()
            .any(|(_, name)| {
                name.strip_prefix(dir)
                    .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
            })
    }

    /// Logical size of `fid`
    pub fn size(&mut self, fid: Fid) -> Result<u64> {
        self.meta_of(fid).map(|meta| meta.size)
    }

    /// Attributes of `fid`: the published record with the local size
    pub fn stat(&mut self, fid: Fid) -> Result<FileAttr> {
        let meta = self.meta_of(fid)?;
        let path = self.path_of(fid)?;
        let gfid = Gfid::from_path(&path);
        let mut attr = self
            .service
            .fetch(Some(fid), gfid)
            .map_err(|e| Error::io(format!("no attributes for {path}: {e}")))?
            .attr;
        attr.size = meta.size;
        Ok(attr)
    }

    /// Take an advisory lock, `false` if it conflicts with the current one
    ///
    /// Shared locks are counted; each holder releases its own with
    /// [`Client::unlock`].
    pub fn try_lock(&mut self, fid: Fid, kind: LockState) -> Result<bool> {
        if kind == LockState::Unlocked {
            return Err(Error::invalid_argument("cannot lock with Unlocked"));
        }
        let mut parts = self.superblock.regions();
        let _guard = self.lock.acquire()?;
        let mut meta = live_meta(&parts, fid)?;
        let granted = match (meta.lock, kind) {
            (LockState::Unlocked, _) => {
                meta.lock = kind;
                meta.shared_holders = u32::from(kind == LockState::Shared);
                true
            }
            (LockState::Shared, LockState::Shared) => {
                meta.shared_holders = meta.shared_holders.saturating_add(1);
                true
            }
            _ => false,
        };
        if granted {
            parts.metas.put(fid, &meta)?;
        }
        Ok(granted)
    }

    /// Release one hold on the lock; a shared lock stays until its last
    /// holder releases it
    pub fn unlock(&mut self, fid: Fid) -> Result<()> {
        let mut parts = self.superblock.regions();
        let _guard = self.lock.acquire()?;
        let mut meta = live_meta(&parts, fid)?;
        if meta.lock == LockState::Shared && meta.shared_holders > 1 {
            meta.shared_holders -= 1;
        } else {
            meta.lock = LockState::Unlocked;
            meta.shared_holders = 0;
        }
        parts.metas.put(fid, &meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{InMemoryMetaService, MetadataService};
    use crate::testutil::{mount, mount_with};
    use burstfs_common::{ClientConfig, MAX_FILENAME, OpenFlags};

    #[test]
    fn test_create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);

        let fid = client.create_file("/burst/a").unwrap();
        assert_eq!(client.lookup("/burst/a").unwrap(), fid);
        assert_eq!(client.path_of(fid).unwrap(), "/burst/a");
        assert_eq!(client.size(fid).unwrap(), 0);
        assert!(!client.is_dir(fid));
        assert!(client.lookup("/burst/b").unwrap_err().is_not_found());
    }

    #[test]
    fn test_create_rejects_long_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        let long = format!("/burst/{}", "x".repeat(MAX_FILENAME));
        assert!(matches!(
            client.create_file(&long),
            Err(Error::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_fids_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount_with(dir.path(), &InMemoryMetaService::new(), 0, |c| ClientConfig {
            max_files: 3,
            ..c
        });
        // the mount prefix holds one fid
        client.create_file("/burst/1").unwrap();
        let last = client.create_file("/burst/2").unwrap();
        assert!(matches!(
            client.create_file("/burst/3"),
            Err(Error::Exhausted(_))
        ));

        client.unlink(last).unwrap();
        assert_eq!(client.create_file("/burst/3").unwrap(), last);
    }

    #[test]
    fn test_is_dir_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        client.create_directory("/burst/d").unwrap();
        client.create_file("/burst/dx").unwrap();
        assert!(client.is_dir_empty("/burst/d"));

        let child = client.create_file("/burst/d/child").unwrap();
        assert!(!client.is_dir_empty("/burst/d"));
        assert!(!client.is_dir_empty("/burst/d/"));
        assert!(!client.is_dir_empty("/burst"));

        client.unlink(child).unwrap();
        assert!(client.is_dir_empty("/burst/d"));
    }

    #[test]
    fn test_stat_prefers_local_size() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);
        let fid = client
            .open("/burst/s", OpenFlags::CREAT | OpenFlags::RDWR)
            .unwrap()
            .fid;
        assert_eq!(client.stat(fid).unwrap().size, 0);
        client.extend(fid, 100).unwrap();
        client.write(fid, 0, &[9u8; 100]).unwrap();

        let attr = client.stat(fid).unwrap();
        assert_eq!(attr.size, 100);
        assert_eq!(
            service.fetch(None, Gfid::from_path("/burst/s")).unwrap().attr.size,
            0
        );

        service.remove(Gfid::from_path("/burst/s"));
        assert!(matches!(client.stat(fid), Err(Error::Io(_))));
    }

    #[test]
    fn test_advisory_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        let fid = client.create_file("/burst/l").unwrap();

        assert!(client.try_lock(fid, LockState::Shared).unwrap());
        assert!(client.try_lock(fid, LockState::Shared).unwrap());
        assert!(!client.try_lock(fid, LockState::Exclusive).unwrap());

        // one of two readers lets go: still shared
        client.unlock(fid).unwrap();
        assert!(!client.try_lock(fid, LockState::Exclusive).unwrap());
        assert_eq!(client.meta_of(fid).unwrap().lock, LockState::Shared);

        client.unlock(fid).unwrap();
        assert_eq!(client.meta_of(fid).unwrap().shared_holders, 0);
        assert!(client.try_lock(fid, LockState::Exclusive).unwrap());
        assert!(!client.try_lock(fid, LockState::Shared).unwrap());
        assert!(client.try_lock(fid, LockState::Unlocked).is_err());
        client.unlock(fid).unwrap();
        assert!(client.try_lock(Fid::new(7), LockState::Shared).is_err());
    }
}
