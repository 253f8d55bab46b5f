//! The cluster metadata service, as seen from a client
//!
//! The client only needs three things from the service: announce its
//! mount, publish attributes of files it creates, and fetch the attributes
//! of a file by global id. [`InMemoryMetaService`] keeps them in a map and
//! can be shared by several clients in one process.

use burstfs_common::{Error, Fid, Gfid, GlobalFileAttr, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Where the server finds a client's shared structures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    pub app_id: u32,
    pub local_rank: u32,
    pub mount_prefix: String,
    /// Shared-memory object name, `None` for a private region
    pub shm_name: Option<String>,
    pub superblock_size: u64,
    pub index_offset: u64,
    pub index_size: u64,
    pub fattr_offset: u64,
    pub fattr_size: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub chunk_bits: u32,
    pub spillover_path: Option<PathBuf>,
}

pub trait MetadataService: Send + Sync {
    /// Announce a newly mounted client
    fn register_client(&self, _mount: &MountDescriptor) -> Result<()> {
        Ok(())
    }

    /// Record (or replace) the attributes of `attr.gfid`
    fn publish(&self, attr: &GlobalFileAttr) -> Result<()>;

    /// Attributes of `gfid`, `Error::NotFound` if the service has none
    fn fetch(&self, fid: Option<Fid>, gfid: Gfid) -> Result<GlobalFileAttr>;
}

#[derive(Default)]
struct State {
    files: HashMap<Gfid, GlobalFileAttr>,
    mounts: Vec<MountDescriptor>,
}

/// Map-backed metadata service
#[derive(Clone, Default)]
pub struct InMemoryMetaService {
    state: Arc<RwLock<State>>,
}

impl InMemoryMetaService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a file behind every client's back
    pub fn remove(&self, gfid: Gfid) -> Option<GlobalFileAttr> {
        self.state.write().files.remove(&gfid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn mounts(&self) -> Vec<MountDescriptor> {
        self.state.read().mounts.clone()
    }
}

impl MetadataService for InMemoryMetaService {
    fn register_client(&self, mount: &MountDescriptor) -> Result<()> {
        debug!(
            "Registered client app={} rank={} at {}",
            mount.app_id, mount.local_rank, mount.mount_prefix
        );
        self.state.write().mounts.push(mount.clone());
        Ok(())
    }

    fn publish(&self, attr: &GlobalFileAttr) -> Result<()> {
        self.state.write().files.insert(attr.gfid, attr.clone());
        Ok(())
    }

    fn fetch(&self, _fid: Option<Fid>, gfid: Gfid) -> Result<GlobalFileAttr> {
        self.state
            .read()
            .files
            .get(&gfid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("gfid {gfid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstfs_common::FileAttr;

    fn attr(path: &str) -> GlobalFileAttr {
        let gfid = Gfid::from_path(path);
        GlobalFileAttr {
            gfid,
            fid: Fid::new(0),
            path: path.into(),
            attr: FileAttr::regular(gfid),
        }
    }

    #[test]
    fn test_publish_fetch_remove() {
        let service = InMemoryMetaService::new();
        let a = attr("/burst/a");
        assert!(service.fetch(None, a.gfid).unwrap_err().is_not_found());

        service.publish(&a).unwrap();
        assert_eq!(service.fetch(None, a.gfid).unwrap(), a);
        assert_eq!(service.len(), 1);

        // clones share state
        let other = service.clone();
        assert_eq!(other.remove(a.gfid), Some(a.clone()));
        assert!(service.fetch(Some(Fid::new(0)), a.gfid).is_err());
        assert!(service.is_empty());
    }

    #[test]
    fn test_descriptor_serializes() {
        let desc = MountDescriptor {
            app_id: 1,
            local_rank: 2,
            mount_prefix: "/burst".into(),
            shm_name: Some("/1-super-2".into()),
            superblock_size: 1 << 20,
            index_offset: 4096,
            index_size: 8192,
            fattr_offset: 16384,
            fattr_size: 4096,
            data_offset: 0,
            data_size: 0,
            chunk_bits: 12,
            spillover_path: None,
        };
        let json = serde_json::to_string(&desc).unwrap();
        let back: MountDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);

        let service = InMemoryMetaService::new();
        service.register_client(&desc).unwrap();
        assert_eq!(service.mounts(), vec![desc]);
    }
}
