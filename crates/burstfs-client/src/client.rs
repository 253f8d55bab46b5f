//! The mounted client
//!
//! [`Client`] ties one superblock, the optional spillover file, the
//! allocator lock and the metadata service together under a mount prefix.
//! Storage, namespace and open/unlink operations are implemented on it in
//! their own modules.

use crate::chunk::ChunkMapper;
use crate::layout::{Geometry, Layout};
use crate::records::{FileMeta, LogIndexEntry, check_path};
use crate::service::{MetadataService, MountDescriptor};
use crate::spill::SpillFile;
use crate::stack::{NoLock, SharedLock, StackLock};
use crate::superblock::{Regions, Superblock, shm_name};
use burstfs_common::{
    ClientConfig, Error, FileAttr, Fid, Gfid, GlobalFileAttr, RegionBacking, Result,
};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) geometry: Geometry,
    pub(crate) mapper: ChunkMapper,
    pub(crate) superblock: Superblock,
    pub(crate) spill: Option<SpillFile>,
    pub(crate) lock: Box<dyn StackLock>,
    pub(crate) service: Arc<dyn MetadataService>,
    prefix: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("prefix", &self.prefix)
            .field("app_id", &self.config.app_id)
            .field("local_rank", &self.config.local_rank)
            .field("superblock", &self.superblock.name())
            .finish_non_exhaustive()
    }
}

fn normalize_prefix(prefix: &str) -> Result<String> {
    if !prefix.starts_with('/') {
        return Err(Error::invalid_argument(format!(
            "mount prefix {prefix:?} is not absolute"
        )));
    }
    let trimmed = prefix.trim_end_matches('/');
    let prefix = if trimmed.is_empty() { "/" } else { trimmed };
    check_path(prefix)?;
    Ok(prefix.to_string())
}

/// Metadata of an in-use fid
pub(crate) fn live_meta(parts: &Regions<'_>, fid: Fid) -> Result<FileMeta> {
    if !parts.names.in_use(fid) {
        return Err(Error::not_found(format!("fid {fid}")));
    }
    parts.metas.get(fid)
}

impl Client {
    /// Mount a client at `prefix`
    ///
    /// Sizes and creates (or re-attaches) the superblock, opens the
    /// spillover file, registers with the metadata service and makes sure
    /// the prefix directory exists.
    pub fn mount(
        prefix: &str,
        config: ClientConfig,
        service: Arc<dyn MetadataService>,
    ) -> Result<Self> {
        let prefix = normalize_prefix(prefix)?;
        let geometry = Geometry::from_config(&config)?;

        let superblock = match config.region {
            RegionBacking::Shm => {
                Superblock::open_shm(&shm_name(config.app_id, config.local_rank), geometry)?
            }
            RegionBacking::Anonymous => Superblock::anonymous(geometry)?,
        };

        let spill = if config.spillover_enabled {
            let path = SpillFile::path_for(&config.spillover_dir, config.app_id, config.local_rank);
            Some(SpillFile::open(path, config.spillover_size)?)
        } else {
            None
        };

        let lock: Box<dyn StackLock> = match superblock.lock_handle()? {
            Some(file) if config.single_shm => Box::new(SharedLock::new(file)),
            _ => Box::new(NoLock),
        };

        let mut client = Self {
            mapper: ChunkMapper::new(config.chunk_bits),
            geometry,
            config,
            superblock,
            spill,
            lock,
            service,
            prefix,
        };

        client.service.register_client(&client.descriptor())?;
        client.ensure_prefix_dir()?;

        info!(
            "Mounted {} (app {}, rank {}, superblock {} bytes)",
            client.prefix,
            client.config.app_id,
            client.config.local_rank,
            client.superblock.layout().total
        );
        Ok(client)
    }

    fn ensure_prefix_dir(&mut self) -> Result<()> {
        let prefix = self.prefix.clone();
        if let Some(fid) = self.find_fid(&prefix) {
            if self.is_dir(fid) {
                debug!("Reusing mount directory {} (fid {})", prefix, fid);
                return Ok(());
            }
            return Err(Error::AlreadyExists(prefix));
        }
        match self.create_directory(&prefix) {
            Ok(fid) => debug!("Created mount directory {} (fid {})", prefix, fid),
            Err(Error::AlreadyExists(_)) => {
                debug!("Mount directory {} already published", prefix);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Flush the spillover file and the region, then drop the mapping
    pub fn unmount(self) -> Result<()> {
        if let Some(spill) = &self.spill {
            spill.sync()?;
        }
        self.superblock.flush()?;
        info!("Unmounted {}", self.prefix);
        Ok(())
    }

    /// Whether `path` lies under the mount prefix
    #[must_use]
    pub fn owns_path(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// What the server needs to map this client's shared structures
    #[must_use]
    pub fn descriptor(&self) -> MountDescriptor {
        let layout = self.superblock.layout();
        let (data_offset, data_size) = layout
            .chunks
            .map_or((0, 0), |span| (span.offset as u64, span.len as u64));
        MountDescriptor {
            app_id: self.config.app_id,
            local_rank: self.config.local_rank,
            mount_prefix: self.prefix.clone(),
            shm_name: self.superblock.name().map(str::to_string),
            superblock_size: layout.total as u64,
            index_offset: layout.index_header.offset as u64,
            index_size: (layout.index_header.len + layout.index_entries.len) as u64,
            fattr_offset: layout.attr_header.offset as u64,
            fattr_size: (layout.attr_header.len + layout.attr_entries.len) as u64,
            data_offset,
            data_size,
            chunk_bits: self.config.chunk_bits,
            spillover_path: self.spill.as_ref().map(|s| s.path().to_path_buf()),
        }
    }

    #[must_use]
    pub fn mount_prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        self.superblock.layout()
    }

    /// The in-memory chunk data region, `None` without memory storage
    #[must_use]
    pub fn data_region(&self) -> Option<&[u8]> {
        self.superblock.data_region()
    }

    /// Check `fid` refers to an open-able file
    pub fn close(&mut self, fid: Fid) -> Result<()> {
        let parts = self.superblock.regions();
        live_meta(&parts, fid).map(|_| ())
    }

    /// Publish the local size of `fid` to the metadata service
    pub fn sync(&mut self, fid: Fid) -> Result<()> {
        let path = self.path_of(fid)?;
        let gfid = Gfid::from_path(&path);
        let meta = self.meta_of(fid)?;

        let mut attr = match self.service.fetch(Some(fid), gfid) {
            Ok(published) => published.attr,
            Err(e) if e.is_not_found() => {
                if meta.is_dir {
                    FileAttr::directory(gfid)
                } else {
                    FileAttr::regular(gfid)
                }
            }
            Err(e) => return Err(e),
        };
        attr.size = meta.size;

        let global = GlobalFileAttr {
            gfid,
            fid,
            path,
            attr,
        };
        self.service.publish(&global)?;

        let mut parts = self.superblock.regions();
        parts.attrs.remove_fid(fid)?;
        parts.attrs.insert(&global)?;
        debug!("Synced fid {} at {} bytes", fid, meta.size);
        Ok(())
    }

    /// Drain the log index for hand-off to the server
    pub fn take_index_entries(&mut self) -> Result<Vec<LogIndexEntry>> {
        let _guard = self.lock.acquire()?;
        self.superblock.regions().index.take()
    }

    /// Log index entries without draining them
    pub fn index_entries(&mut self) -> Result<Vec<LogIndexEntry>> {
        self.superblock.regions().index.entries()
    }

    /// The local attribute mirror, sorted by fid
    pub fn mirrored_attrs(&mut self) -> Result<Vec<GlobalFileAttr>> {
        self.superblock.regions().attrs.entries()
    }

    pub(crate) fn meta_of(&mut self, fid: Fid) -> Result<FileMeta> {
        let parts = self.superblock.regions();
        live_meta(&parts, fid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryMetaService;
    use crate::testutil::{client_config, mount};

    #[test]
    fn test_mount_creates_prefix_dir() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let mut client = mount(dir.path(), &service, 0);

        let fid = client.lookup("/burst").unwrap();
        assert!(client.is_dir(fid));
        assert!(service.fetch(None, Gfid::from_path("/burst")).unwrap().attr.is_dir());
        assert_eq!(service.mounts().len(), 1);
        assert!(dir.path().join("spill_0_0.log").exists());
    }

    #[test]
    fn test_second_client_accepts_published_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let _first = mount(dir.path(), &service, 0);
        let mut second = mount(dir.path(), &service, 1);
        // the directory belongs to the first client
        assert!(second.lookup("/burst").unwrap_err().is_not_found());
        assert_eq!(service.mounts().len(), 2);
    }

    #[test]
    fn test_owns_path() {
        let dir = tempfile::tempdir().unwrap();
        let client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        assert!(client.owns_path("/burst"));
        assert!(client.owns_path("/burst/a/b"));
        assert!(!client.owns_path("/burstfs/a"));
        assert!(!client.owns_path("/tmp/a"));
    }

    #[test]
    fn test_rejects_relative_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let err = Client::mount(
            "burst",
            client_config(dir.path(), 0),
            Arc::new(InMemoryMetaService::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(normalize_prefix("/burst//").unwrap(), "/burst");
        assert_eq!(normalize_prefix("/").unwrap(), "/");
    }

    #[test]
    fn test_descriptor_matches_layout() {
        let dir = tempfile::tempdir().unwrap();
        let client = mount(dir.path(), &InMemoryMetaService::new(), 0);
        let desc = client.descriptor();
        let layout = client.layout();

        assert_eq!(desc.superblock_size, layout.total as u64);
        assert_eq!(desc.fattr_offset + desc.fattr_size, layout.total as u64);
        assert_eq!(desc.data_size, client.data_region().unwrap().len() as u64);
        assert_eq!(desc.shm_name, None);
        assert!(desc.spillover_path.is_some());
    }

    #[test]
    fn test_memory_only_mount() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            spillover_enabled: false,
            ..client_config(dir.path(), 0)
        };
        let client =
            Client::mount("/burst", config, Arc::new(InMemoryMetaService::new())).unwrap();
        assert!(client.descriptor().spillover_path.is_none());
        assert!(!dir.path().join("spill_0_0.log").exists());
        client.unmount().unwrap();
    }

    #[test]
    fn test_shm_remount_reuses_state() {
        let dir = tempfile::tempdir().unwrap();
        let service = InMemoryMetaService::new();
        let config = ClientConfig {
            region: RegionBacking::Shm,
            app_id: 9000 + (std::process::id() % 1000),
            local_rank: rand::random::<u16>().into(),
            ..client_config(dir.path(), 0)
        };
        let name = shm_name(config.app_id, config.local_rank);

        let mut client =
            Client::mount("/burst", config.clone(), Arc::new(service.clone())).unwrap();
        let fid = client.create_file("/burst/kept").unwrap();
        client.unmount().unwrap();

        let mut again = Client::mount("/burst", config, Arc::new(service)).unwrap();
        assert_eq!(again.lookup("/burst/kept").unwrap(), fid);
        assert_eq!(again.descriptor().shm_name.as_deref(), Some(&*format!("/{name}")));
        again.unmount().unwrap();

        Superblock::unlink(&name).unwrap();
    }
}
