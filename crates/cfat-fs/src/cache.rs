//! Write-back metadata cache.
//!
//! Mutations land here first. The whole pending set is re-sealed to a local
//! side file on every change, so a crash between full syncs loses nothing:
//! the next open replays the snapshot over the backend tables. A full sync
//! writes the tables and clears the snapshot.
//!
//! The side file is named after a hash of the backend identity. A
//! [`CacheRegistry`] makes sure only one open cache per identity exists in
//! the process.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cfat_core::{Blob, CfatError, CfatResult};
use cfat_storage::local::AtomicFileSink;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{DirEntry, DirentId, Group, GroupId, User, UserId};
use crate::records::{self, Sealing, CACHE_IV_OFFSET};

/// A pending change to one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "record", rename_all = "lowercase")]
pub enum Change<T> {
    Upsert(T),
    Delete,
}

/// Pending changes by record id. Later changes to an id replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    pub dirents: BTreeMap<DirentId, Change<DirEntry>>,
    pub users: BTreeMap<UserId, Change<User>>,
    pub groups: BTreeMap<GroupId, Change<Group>>,
}

impl Changes {
    pub fn put_dirent(&mut self, entry: DirEntry) {
        self.dirents.insert(entry.id.clone(), Change::Upsert(entry));
    }

    pub fn delete_dirent(&mut self, id: DirentId) {
        self.dirents.insert(id, Change::Delete);
    }

    pub fn put_user(&mut self, user: User) {
        self.users.insert(user.id, Change::Upsert(user));
    }

    pub fn delete_user(&mut self, id: UserId) {
        self.users.insert(id, Change::Delete);
    }

    pub fn put_group(&mut self, group: Group) {
        self.groups.insert(group.id, Change::Upsert(group));
    }

    pub fn delete_group(&mut self, id: GroupId) {
        self.groups.insert(id, Change::Delete);
    }

    pub fn merge(&mut self, other: &Changes) {
        self.dirents
            .extend(other.dirents.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.users
            .extend(other.users.iter().map(|(k, v)| (*k, v.clone())));
        self.groups
            .extend(other.groups.iter().map(|(k, v)| (*k, v.clone())));
    }

    pub fn len(&self) -> usize {
        self.dirents.len() + self.users.len() + self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct PendingRef<'a, K, T> {
    id: &'a K,
    change: &'a Change<T>,
}

#[derive(Deserialize)]
struct Pending<K, T> {
    id: K,
    change: Change<T>,
}

fn pending_refs<K, T>(map: &BTreeMap<K, Change<T>>) -> Vec<PendingRef<'_, K, T>> {
    map.iter().map(|(id, change)| PendingRef { id, change }).collect()
}

fn from_pending<K: Ord, T>(records: Vec<Pending<K, T>>) -> BTreeMap<K, Change<T>> {
    records.into_iter().map(|p| (p.id, p.change)).collect()
}

pub struct MetadataCache {
    path: PathBuf,
    sealing: Sealing,
    pending: Mutex<Changes>,
    _lease: CacheLease,
}

impl MetadataCache {
    /// Claim the cache for `identity` and load any snapshot a previous
    /// process left behind.
    pub fn open(
        registry: &CacheRegistry,
        identity: &str,
        dir: &Path,
        sealing: Sealing,
    ) -> CfatResult<Self> {
        let (lease, path) = claim(registry, identity, dir)?;
        let pending = match fs::File::open(&path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                let changes = load_snapshot(&sealing, Blob::new(file, len))?;
                info!(
                    path = %path.display(),
                    pending = changes.len(),
                    "found metadata cache from an earlier session"
                );
                changes
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Changes::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(MetadataCache {
            path,
            sealing,
            pending: Mutex::new(pending),
            _lease: lease,
        })
    }

    /// Claim the cache for `identity` and discard, unread, whatever an
    /// earlier filesystem on the same backend left behind.
    pub fn open_empty(
        registry: &CacheRegistry,
        identity: &str,
        dir: &Path,
        sealing: Sealing,
    ) -> CfatResult<Self> {
        let (lease, path) = claim(registry, identity, dir)?;
        let cache = MetadataCache {
            path,
            sealing,
            pending: Mutex::new(Changes::default()),
            _lease: lease,
        };
        cache.clear()?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of everything not yet folded into the backend tables.
    pub fn snapshot(&self) -> Changes {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Merge `changes` and persist the full pending set before returning.
    /// If persisting fails the in-memory set is left as it was.
    pub fn record(&self, changes: &Changes) -> CfatResult<()> {
        let mut pending = self.lock();
        let mut next = pending.clone();
        next.merge(changes);
        self.persist(&next)?;
        *pending = next;
        debug!(
            changed = changes.len(),
            pending = pending.len(),
            "metadata cache updated"
        );
        Ok(())
    }

    pub fn put_dirent(&self, entry: &DirEntry) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.put_dirent(entry.clone());
        self.record(&changes)
    }

    pub fn delete_dirent(&self, id: &DirentId) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.delete_dirent(id.clone());
        self.record(&changes)
    }

    pub fn put_user(&self, user: &User) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.put_user(user.clone());
        self.record(&changes)
    }

    pub fn delete_user(&self, id: UserId) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.delete_user(id);
        self.record(&changes)
    }

    pub fn put_group(&self, group: &Group) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.put_group(group.clone());
        self.record(&changes)
    }

    pub fn delete_group(&self, id: GroupId) -> CfatResult<()> {
        let mut changes = Changes::default();
        changes.delete_group(id);
        self.record(&changes)
    }

    /// Forget everything pending. Called once a full sync has landed.
    pub fn clear(&self) -> CfatResult<()> {
        let mut pending = self.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *pending = Changes::default();
        Ok(())
    }

    fn persist(&self, changes: &Changes) -> CfatResult<()> {
        let sink = AtomicFileSink::create(self.path.clone())?;
        let mut writer = self.sealing.writer(sink, CACHE_IV_OFFSET)?;
        records::write_table(&mut writer, &pending_refs(&changes.dirents))?;
        records::write_table(&mut writer, &pending_refs(&changes.users))?;
        records::write_table(&mut writer, &pending_refs(&changes.groups))?;
        writer.close()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Changes> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn claim(registry: &CacheRegistry, identity: &str, dir: &Path) -> CfatResult<(CacheLease, PathBuf)> {
    let lease = registry.acquire(identity)?;
    fs::create_dir_all(dir)?;
    let path = dir.join(blake3::hash(identity.as_bytes()).to_hex().as_str());
    Ok((lease, path))
}

fn load_snapshot(sealing: &Sealing, blob: Blob) -> CfatResult<Changes> {
    let mut de = records::table_deserializer(sealing.reader(blob, CACHE_IV_OFFSET)?);
    let dirents = records::read_table::<_, Pending<DirentId, DirEntry>>(&mut de)?;
    let users = records::read_table::<_, Pending<UserId, User>>(&mut de)?;
    let groups = records::read_table::<_, Pending<GroupId, Group>>(&mut de)?;
    records::finish(de)?;
    Ok(Changes {
        dirents: from_pending(dirents),
        users: from_pending(users),
        groups: from_pending(groups),
    })
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("path", &self.path)
            .field("pending", &self.len())
            .finish()
    }
}

/// Process-wide set of backend identities with an open cache.
///
/// Clones share the same set. Whatever constructs engines owns one registry
/// and passes it to every open.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, identity: &str) -> CfatResult<CacheLease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(identity.to_string()) {
            return Err(CfatError::illegal(
                "open cache",
                identity,
                "a cache for this backend is already open",
            ));
        }
        Ok(CacheLease {
            registry: self.clone(),
            identity: identity.to_string(),
        })
    }

    pub fn is_active(&self, identity: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identity)
    }
}

/// Exclusive claim on one identity, released on drop.
#[derive(Debug)]
pub struct CacheLease {
    registry: CacheRegistry,
    identity: String,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.identity);
    }
}
