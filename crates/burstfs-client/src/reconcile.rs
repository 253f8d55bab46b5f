//! Open, mkdir and unlink
//!
//! Each of these consults two sources of truth: the local name table and
//! the metadata service. Their combination decides the outcome:
//!
//! | local | global | open                           | create_directory |
//! |-------|--------|--------------------------------|------------------|
//! | yes   | no     | drop the stale local entry, NotFound | Io         |
//! | no    | yes    | new local entry mirroring it   | AlreadyExists    |
//! | yes   | yes    | honor EXCL / DIRECTORY / TRUNC / APPEND | AlreadyExists |
//! | no    | no     | create if CREAT, else NotFound | create           |

use crate::client::Client;
use crate::records::{FileMeta, Storage, check_path};
use burstfs_common::{
    Error, FileAttr, Fid, Gfid, GlobalFileAttr, OpenFlags, Result, StorageMode,
};
use tracing::{debug, warn};

/// Result of a successful open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFile {
    pub fid: Fid,
    /// Initial file position
    pub pos: u64,
}

impl Client {
    /// Fetch from the service, mapping "not found" to `None`
    fn fetch_global(&self, fid: Option<Fid>, gfid: Gfid) -> Result<Option<GlobalFileAttr>> {
        match self.service.fetch(fid, gfid) {
            Ok(attr) => Ok(Some(attr)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Give a new file the configured storage kind
    fn store_alloc(&mut self, fid: Fid, size: u64) -> Result<()> {
        let storage = match self.config.storage {
            StorageMode::FixedChunk => Storage::FixedChunk,
            StorageMode::LogStructured => Storage::LogStructured { log_size: 0 },
        };
        let meta = FileMeta {
            size,
            storage,
            ..FileMeta::default()
        };
        self.superblock.regions().metas.put(fid, &meta)
    }

    /// Add `attr` to the local mirror, undoing the local entry for its fid
    /// if the mirror has no room
    fn mirror_new(&mut self, attr: &GlobalFileAttr) -> Result<()> {
        if let Err(e) = self.superblock.regions().attrs.insert(attr) {
            warn!("Failed to mirror {}: {}", attr.path, e);
            self.unlink(attr.fid)?;
            return Err(e);
        }
        Ok(())
    }

    /// Publish a new entry and mirror it locally, undoing the local entry
    /// if either step fails
    fn publish_new(&mut self, fid: Fid, path: &str, attr: FileAttr) -> Result<()> {
        let global = GlobalFileAttr {
            gfid: Gfid::from_path(path),
            fid,
            path: path.to_string(),
            attr,
        };
        if let Err(e) = self.service.publish(&global) {
            warn!("Failed to publish {}: {}", path, e);
            self.unlink(fid)?;
            return Err(Error::io(format!("failed to publish {path}: {e}")));
        }
        self.mirror_new(&global)
    }

    /// Set up local metadata for a file first created by another client
    fn adopt_global(&mut self, fid: Fid, global: &GlobalFileAttr) -> Result<()> {
        if global.attr.is_dir() {
            let meta = FileMeta {
                is_dir: true,
                ..FileMeta::default()
            };
            self.superblock.regions().metas.put(fid, &meta)
        } else {
            self.store_alloc(fid, global.attr.size)
        }
    }

    /// Open `path`, reconciling the local and global views of it
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<OpenFile> {
        check_path(path)?;
        let gfid = Gfid::from_path(path);
        let local = self.find_fid(path);
        let global = self.fetch_global(local, gfid)?;

        match (local, global) {
            (Some(fid), None) => {
                warn!("{} (fid {}) was removed elsewhere, dropping it", path, fid);
                self.unlink(fid)?;
                Err(Error::not_found(path.to_string()))
            }
            (None, Some(global)) => {
                let fid = self.create_file(path)?;
                if let Err(e) = self.adopt_global(fid, &global) {
                    self.unlink(fid)?;
                    return Err(e);
                }
                self.mirror_new(&GlobalFileAttr { fid, ..global })?;
                debug!("Opened {} from global entry as fid {}", path, fid);
                Ok(OpenFile { fid, pos: 0 })
            }
            (Some(fid), Some(_)) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(Error::AlreadyExists(path.to_string()));
                }
                let is_dir = self.is_dir(fid);
                if flags.contains(OpenFlags::DIRECTORY) && !is_dir {
                    return Err(Error::NotADirectory(path.to_string()));
                }
                if !flags.contains(OpenFlags::DIRECTORY) && is_dir {
                    return Err(Error::IsADirectory(path.to_string()));
                }
                if flags.contains(OpenFlags::TRUNC) && flags.is_writable() {
                    self.truncate(fid, 0)?;
                }
                let pos = if flags.contains(OpenFlags::APPEND) {
                    self.size(fid)?
                } else {
                    0
                };
                Ok(OpenFile { fid, pos })
            }
            (None, None) => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(Error::not_found(path.to_string()));
                }
                let fid = self.create_file(path)?;
                self.store_alloc(fid, 0)?;
                self.publish_new(fid, path, FileAttr::regular(gfid))?;
                debug!("Created {} as fid {}", path, fid);
                Ok(OpenFile { fid, pos: 0 })
            }
        }
    }

    /// Create the directory `path`
    pub fn create_directory(&mut self, path: &str) -> Result<Fid> {
        check_path(path)?;
        let gfid = Gfid::from_path(path);
        let local = self.find_fid(path);
        let global = self.fetch_global(local, gfid)?;

        match (local, global) {
            (Some(fid), None) => {
                warn!("{} (fid {}) exists locally but not globally", path, fid);
                Err(Error::io(format!("{path} exists only in the local cache")))
            }
            (_, Some(_)) => Err(Error::AlreadyExists(path.to_string())),
            (None, None) => {
                let fid = self.create_file(path)?;
                let meta = FileMeta {
                    is_dir: true,
                    ..FileMeta::default()
                };
                self.superblock.regions().metas.put(fid, &meta)?;
                self.publish_new(fid, path, FileAttr::directory(gfid))?;
                debug!("Created directory {} as fid {}", path, fid);
                Ok(fid)
            }
        }
    }

    /// Drop the local entry for `fid` and free its storage
    ///
    /// Only local state is touched; the entry in the metadata service is
    /// left alone.
    pub fn unlink(&mut self, fid: Fid) -> Result<()> {
        let meta = self.meta_of(fid)?;
        if meta.storage.is_chunked()
            && let Err(e) = self.truncate(fid, 0)
        {
            warn!("fid {}: truncate during unlink failed: {}", fid, e);
        }
        if meta.chunks > 0 {
            self.shrink(fid, 0)?;
        }

        let mut parts = self.superblock.regions();
        parts.metas.put(fid, &FileMeta::default())?;
        parts.attrs.remove_fid(fid)?;
        parts.names.clear(fid)?;
        self.free_fid(fid)?;
        debug!("Unlinked fid {}", fid);
        Ok(())
    }

    /// Unlink the local entry for `path`
    pub fn unlink_path(&mut self, path: &str) -> Result<()> {
        let fid = self.lookup(path)?;
        self.unlink(fid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{InMemoryMetaService, MetadataService};
    use crate::testutil::mount;

    #[test]
    fn test_create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);

        let created = client
            .open("/burst/f", OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap();
        assert_eq!(created.pos, 0);
        assert!(service.fetch(None, Gfid::from_path("/burst/f")).is_ok());
        let mirror = client.mirrored_attrs().unwrap();
        assert!(mirror.iter().any(|a| a.fid == created.fid && a.path == "/burst/f"));

        let again = client.open("/burst/f", OpenFlags::RDWR).unwrap();
        assert_eq!(again.fid, created.fid);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        assert!(client
            .open("/burst/none", OpenFlags::RDONLY)
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            client.open(&format!("/burst/{}", "n".repeat(200)), OpenFlags::CREAT),
            Err(Error::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_open_flags_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        let fid = client
            .open("/burst/f", OpenFlags::CREAT | OpenFlags::RDWR)
            .unwrap()
            .fid;
        client.extend(fid, 64).unwrap();
        client.write(fid, 0, &[3u8; 64]).unwrap();

        assert!(matches!(
            client.open("/burst/f", OpenFlags::CREAT | OpenFlags::EXCL),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            client.open("/burst/f", OpenFlags::DIRECTORY),
            Err(Error::NotADirectory(_))
        ));

        let appended = client
            .open("/burst/f", OpenFlags::WRONLY | OpenFlags::APPEND)
            .unwrap();
        assert_eq!(appended.pos, 64);

        // read-only opens ignore TRUNC
        client
            .open("/burst/f", OpenFlags::RDONLY | OpenFlags::TRUNC)
            .unwrap();
        assert_eq!(client.size(fid).unwrap(), 64);

        client
            .open("/burst/f", OpenFlags::RDWR | OpenFlags::TRUNC)
            .unwrap();
        assert_eq!(client.size(fid).unwrap(), 0);
    }

    #[test]
    fn test_open_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        let fid = client.create_directory("/burst/d").unwrap();
        assert!(client.is_dir(fid));

        assert_eq!(
            client.open("/burst/d", OpenFlags::DIRECTORY).unwrap().fid,
            fid
        );
        assert!(matches!(
            client.open("/burst/d", OpenFlags::RDONLY),
            Err(Error::IsADirectory(_))
        ));
    }

    #[test]
    fn test_create_directory_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);

        client.create_directory("/burst/d").unwrap();
        assert!(matches!(
            client.create_directory("/burst/d"),
            Err(Error::AlreadyExists(_))
        ));

        // local entry whose global record vanished
        service.remove(Gfid::from_path("/burst/d"));
        assert!(matches!(
            client.create_directory("/burst/d"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_unlink_frees_everything() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);
        let fid = client
            .open("/burst/u", OpenFlags::CREAT | OpenFlags::RDWR)
            .unwrap()
            .fid;
        client.extend(fid, 5 * crate::testutil::CHUNK).unwrap();

        client.unlink_path("/burst/u").unwrap();
        assert!(client.lookup("/burst/u").is_err());
        assert!(client.close(fid).unwrap_err().is_not_found());
        assert!(!client.mirrored_attrs().unwrap().iter().any(|a| a.fid == fid));
        // the global entry is untouched
        assert!(service.fetch(None, Gfid::from_path("/burst/u")).is_ok());

        // a second unlink of the now free fid is refused
        assert!(client.unlink(fid).unwrap_err().is_not_found());

        // the fid is reused, and every chunk is back: the new file takes all 12
        let other = client.create_file("/burst/v").unwrap();
        assert_eq!(other, fid);
        client.store_alloc(other, 0).unwrap();
        client.extend(other, 12 * crate::testutil::CHUNK).unwrap();
    }

    /// Occupy every free slot of the attribute mirror
    fn fill_mirror(client: &mut Client) {
        let mut parts = client.superblock.regions();
        let filler = GlobalFileAttr {
            gfid: Gfid::from_path("/elsewhere"),
            fid: Fid::new(0),
            path: "/elsewhere".into(),
            attr: FileAttr::regular(Gfid::from_path("/elsewhere")),
        };
        while parts.attrs.len() < parts.attrs.capacity() {
            parts.attrs.insert(&filler).unwrap();
        }
    }

    #[test]
    fn test_full_mirror_leaves_no_local_entry() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);
        let other = GlobalFileAttr {
            gfid: Gfid::from_path("/burst/theirs"),
            fid: Fid::new(5),
            path: "/burst/theirs".into(),
            attr: FileAttr::regular(Gfid::from_path("/burst/theirs")),
        };
        service.publish(&other).unwrap();
        fill_mirror(&mut client);

        // brand-new file
        assert!(matches!(
            client.open("/burst/b", OpenFlags::CREAT | OpenFlags::RDWR),
            Err(Error::NoSpace(_))
        ));
        assert!(client.lookup("/burst/b").unwrap_err().is_not_found());

        // file published by another client
        assert!(matches!(
            client.open("/burst/theirs", OpenFlags::RDONLY),
            Err(Error::NoSpace(_))
        ));
        assert!(client.lookup("/burst/theirs").unwrap_err().is_not_found());

        assert!(matches!(
            client.create_directory("/burst/d"),
            Err(Error::NoSpace(_))
        ));
        assert!(client.lookup("/burst/d").unwrap_err().is_not_found());

        // the fid handed out and taken back each time is still the next free one
        assert_eq!(client.create_file("/burst/c").unwrap(), Fid::new(1));
    }

    /// Accepts only the mount directory
    struct RefusingService;

    impl MetadataService for RefusingService {
        fn publish(&self, attr: &GlobalFileAttr) -> Result<()> {
            if attr.path == "/burst" {
                Ok(())
            } else {
                Err(Error::io("service unavailable"))
            }
        }

        fn fetch(&self, _fid: Option<Fid>, gfid: Gfid) -> Result<GlobalFileAttr> {
            Err(Error::not_found(format!("gfid {gfid}")))
        }
    }

    #[test]
    fn test_failed_publish_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::testutil::client_config(dir.path(), 0);
        let mut client =
            Client::mount("/burst", config, std::sync::Arc::new(RefusingService)).unwrap();

        let err = client
            .open("/burst/f", OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(client.lookup("/burst/f").is_err());
        assert!(matches!(
            client.create_directory("/burst/d"),
            Err(Error::Io(_))
        ));

        // the rolled-back fid is handed out again
        let fid = client.create_file("/burst/g").unwrap();
        assert_eq!(client.create_file("/burst/h").unwrap().as_u32(), fid.as_u32() + 1);
    }
}
