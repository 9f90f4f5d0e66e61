//! The filesystem engine.
//!
//! [`Filesystem`] keeps the directory table and account tables in memory
//! behind one mutex. Every mutating call runs check-then-act under that
//! lock: all permission and structure checks happen before anything
//! changes, the resulting record changes are written to the metadata cache,
//! and only then applied to the in-memory tables.
//!
//! Content streams are not cached. `put` seals each version straight to
//! the backend under a fresh blob key and points the entry at it once the
//! metadata change is committed; `read` hands back a seekable decrypting
//! reader over the stored blob.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cfat_core::config::{expand_home, CfatConfig};
use cfat_core::{BlobSource, CfatError, CfatResult};
use cfat_crypto::{hash_password, ChunkCipher, Iv, KdfParams, StreamReader, StreamWriter};
use cfat_storage::Connector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::access;
use crate::accounts::Accounts;
use crate::cache::{CacheRegistry, Change, Changes, MetadataCache};
use crate::fat::Fat;
use crate::model::{
    now, sanitize_name, DirEntry, DirentId, Group, GroupId, Permission, User, UserId,
    EVERYBODY_GROUP, ROOT_USER,
};
use crate::records::{self, Sealing, Table};

/// Decrypting, seekable view of one file's content
pub type ContentReader = StreamReader<Box<dyn BlobSource>>;

/// Engine tunables. One content chunk size applies to every file of a
/// filesystem; changing it makes existing content unreadable.
#[derive(Debug, Clone)]
pub struct FsOptions {
    pub content_chunk_size: usize,
    pub metadata_chunk_size: usize,
    /// Argon2id parameters for new password hashes
    pub kdf: KdfParams,
    pub cache_dir: PathBuf,
    /// Full sync after this many cached mutations; 0 syncs only on close
    pub sync_every: u64,
}

impl FsOptions {
    pub fn from_config(cfg: &CfatConfig) -> Self {
        FsOptions {
            content_chunk_size: cfg.crypto.content_chunk_size,
            metadata_chunk_size: cfg.crypto.metadata_chunk_size,
            kdf: KdfParams::from(&cfg.crypto),
            cache_dir: expand_home(&cfg.cache.dir),
            sync_every: cfg.cache.sync_every,
        }
    }
}

struct State {
    fat: Fat,
    accounts: Accounts,
    /// Mutations cached since the last full sync
    unsynced: u64,
}

impl State {
    fn apply(&mut self, changes: Changes) {
        for (id, change) in changes.dirents {
            match change {
                Change::Upsert(entry) => self.fat.insert(entry),
                Change::Delete => {
                    self.fat.remove(&id);
                }
            }
        }
        for (id, change) in changes.users {
            match change {
                Change::Upsert(user) => self.accounts.insert_user(user),
                Change::Delete => self.accounts.drop_user(id),
            }
        }
        for (id, change) in changes.groups {
            match change {
                Change::Upsert(group) => self.accounts.insert_group(group),
                Change::Delete => self.accounts.drop_group(id),
            }
        }
    }

    fn entry(&self, id: &DirentId, op: &'static str) -> CfatResult<&DirEntry> {
        self.fat
            .get(id)
            .ok_or_else(|| CfatError::illegal(op, id, "no such entry"))
    }

    fn dir(&self, id: &DirentId, op: &'static str) -> CfatResult<&DirEntry> {
        let entry = self.entry(id, op)?;
        if entry.is_file {
            return Err(CfatError::illegal(op, self.fat.path_of(id), "not a directory"));
        }
        Ok(entry)
    }

    fn require_read(&self, acting: UserId, entry: &DirEntry, op: &'static str) -> CfatResult<()> {
        if access::can_read(acting, entry, self.accounts.groups()) {
            Ok(())
        } else {
            Err(CfatError::denied(op, self.fat.path_of(&entry.id)))
        }
    }

    fn require_write(&self, acting: UserId, entry: &DirEntry, op: &'static str) -> CfatResult<()> {
        if access::can_write(acting, entry, self.accounts.groups()) {
            Ok(())
        } else {
            Err(CfatError::denied(op, self.fat.path_of(&entry.id)))
        }
    }

    fn check_groups(&self, permissions: &[Permission], op: &'static str) -> CfatResult<()> {
        match permissions
            .iter()
            .find(|p| self.accounts.group(p.group).is_none())
        {
            Some(p) => Err(CfatError::illegal(op, p.group, "no such group")),
            None => Ok(()),
        }
    }

    fn fresh_id(&self) -> DirentId {
        loop {
            let id = DirentId::random();
            if !self.fat.contains(&id) {
                return id;
            }
        }
    }
}

/// Newlines become spaces; empty names, `.`, `..` and names containing a
/// slash or NUL are refused so every entry has a usable path.
fn valid_name(op: &'static str, name: &str) -> CfatResult<String> {
    let name = sanitize_name(name);
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(CfatError::illegal(op, format!("{name:?}"), "invalid entry name"));
    }
    Ok(name)
}

fn load_table<T: DeserializeOwned>(
    connector: &dyn Connector,
    tables: &Sealing,
    table: Table,
) -> CfatResult<Vec<T>> {
    let blob = connector
        .open_metadata_reader(table.name())?
        .ok_or_else(|| {
            CfatError::CorruptData(format!("metadata table {} is missing", table.name()))
        })?;
    tables.read_one(blob, table)
}

pub struct Filesystem {
    connector: Arc<dyn Connector>,
    cipher: Arc<ChunkCipher>,
    tables: Sealing,
    opts: FsOptions,
    identity: String,
    state: Mutex<State>,
    cache: MetadataCache,
    closed: bool,
}

impl Filesystem {
    /// Initialize an empty filesystem on `connector`: the root user with
    /// the given password pre-hash, the everybody group and a root directory
    /// everybody can read.
    pub fn create(
        connector: Arc<dyn Connector>,
        cipher: ChunkCipher,
        iv: Iv,
        opts: FsOptions,
        registry: &CacheRegistry,
        root_prehash: &str,
    ) -> CfatResult<Self> {
        connector.prepare()?;
        let identity = connector.identity();
        if connector.open_metadata_reader(Table::Fat.name())?.is_some() {
            return Err(CfatError::illegal(
                "create filesystem",
                &identity,
                "a filesystem already exists on this backend",
            ));
        }

        let cipher = Arc::new(cipher);
        let tables = Sealing::new(cipher.clone(), iv, opts.metadata_chunk_size);
        let cache = MetadataCache::open_empty(registry, &identity, &opts.cache_dir, tables.clone())?;

        let accounts = Accounts::bootstrap(hash_password(root_prehash, &opts.kdf)?);
        let fs = Filesystem {
            connector,
            cipher,
            tables,
            opts,
            identity,
            state: Mutex::new(State {
                fat: Fat::with_root(ROOT_USER),
                accounts,
                unsynced: 0,
            }),
            cache,
            closed: false,
        };
        fs.sync()?;
        info!(backend = %fs.identity, "filesystem created");
        Ok(fs)
    }

    /// Load the tables from `connector`, replay whatever the metadata cache
    /// still holds from an interrupted session, and fold it back in.
    pub fn open(
        connector: Arc<dyn Connector>,
        cipher: ChunkCipher,
        iv: Iv,
        opts: FsOptions,
        registry: &CacheRegistry,
    ) -> CfatResult<Self> {
        connector.prepare()?;
        let identity = connector.identity();
        let cipher = Arc::new(cipher);
        let tables = Sealing::new(cipher.clone(), iv, opts.metadata_chunk_size);
        let cache = MetadataCache::open(registry, &identity, &opts.cache_dir, tables.clone())?;

        let fat_blob = connector
            .open_metadata_reader(Table::Fat.name())?
            .ok_or_else(|| {
                CfatError::illegal("open filesystem", &identity, "no filesystem on this backend")
            })?;
        let entries: Vec<DirEntry> = tables.read_one(fat_blob, Table::Fat)?;
        let users: Vec<User> = load_table(&*connector, &tables, Table::Users)?;
        let groups: Vec<Group> = load_table(&*connector, &tables, Table::Groups)?;

        let replay = cache.snapshot();
        let replayed = replay.len();
        let mut state = State {
            fat: Fat::load(entries, replay.dirents)?,
            accounts: Accounts::from_tables(users, groups)?,
            unsynced: 0,
        };
        state.apply(Changes {
            users: replay.users,
            groups: replay.groups,
            ..Changes::default()
        });
        state.accounts.validate()?;
        let referenced: Vec<GroupId> = state
            .fat
            .entries()
            .flat_map(|e| e.permissions.keys().copied())
            .collect();
        state.accounts.reserve_group_ids(referenced);

        info!(
            backend = %identity,
            entries = state.fat.len(),
            users = state.accounts.users().len(),
            groups = state.accounts.groups().len(),
            "filesystem opened"
        );
        let fs = Filesystem {
            connector,
            cipher,
            tables,
            opts,
            identity,
            state: Mutex::new(state),
            cache,
            closed: false,
        };
        if replayed > 0 {
            info!(replayed, "replayed cached metadata changes");
            fs.sync()?;
        }
        Ok(fs)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Changes cached but not yet written to the backend tables.
    pub fn pending_changes(&self) -> usize {
        self.cache.len()
    }

    /// Local file the metadata cache is written to.
    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// Write all three tables and clear the metadata cache.
    pub fn sync(&self) -> CfatResult<()> {
        let mut state = self.lock();
        self.sync_locked(&mut state)
    }

    /// Sync and release the backend. Dropping without `close` also syncs,
    /// but can only log a failure.
    pub fn close(mut self) -> CfatResult<()> {
        self.sync()?;
        self.closed = true;
        self.connector.close()?;
        info!(backend = %self.identity, "filesystem closed");
        Ok(())
    }

    // ---- accounts ----

    pub fn authenticate(&self, name: &str, prehash: &str) -> CfatResult<UserId> {
        self.lock().accounts.authenticate(name, prehash)
    }

    pub fn add_user(&self, acting: UserId, name: &str, prehash: &str) -> CfatResult<UserId> {
        // hashing is slow; refuse doomed requests before paying for it
        self.lock().accounts.check_add_user(acting, name)?;
        let hash = hash_password(prehash, &self.opts.kdf)?;

        let mut state = self.lock();
        let mut accounts = state.accounts.clone();
        let id = accounts.add_user(acting, name, hash)?;
        let mut changes = Changes::default();
        if let Some(user) = accounts.user(id) {
            changes.put_user(user.clone());
        }
        if let Some(everybody) = accounts.group(EVERYBODY_GROUP) {
            changes.put_group(everybody.clone());
        }
        self.commit(&mut state, changes)?;
        Ok(id)
    }

    /// Root only. Everything the user owned passes to root and the user is
    /// purged from every group.
    pub fn remove_user(&self, acting: UserId, target: UserId) -> CfatResult<()> {
        let mut state = self.lock();
        let mut accounts = state.accounts.clone();
        let touched = accounts.remove_user(acting, target)?;

        let mut changes = Changes::default();
        changes.delete_user(target);
        for gid in touched {
            if let Some(group) = accounts.group(gid) {
                changes.put_group(group.clone());
            }
        }
        let mut transferred = 0usize;
        for entry in state.fat.entries().filter(|e| e.owner == target) {
            let mut entry = entry.clone();
            entry.owner = ROOT_USER;
            changes.put_dirent(entry);
            transferred += 1;
        }
        info!(user = target, transferred, "ownership transferred to root");
        self.commit(&mut state, changes)
    }

    pub fn set_password(&self, acting: UserId, target: UserId, prehash: &str) -> CfatResult<()> {
        if acting != target && acting != ROOT_USER {
            return Err(CfatError::denied("set password", target));
        }
        let hash = hash_password(prehash, &self.opts.kdf)?;

        let mut state = self.lock();
        let mut accounts = state.accounts.clone();
        accounts.set_password(acting, target, hash)?;
        let mut changes = Changes::default();
        if let Some(user) = accounts.user(target) {
            changes.put_user(user.clone());
        }
        self.commit(&mut state, changes)
    }

    pub fn add_group(&self, acting: UserId, name: &str) -> CfatResult<GroupId> {
        let mut state = self.lock();
        let mut accounts = state.accounts.clone();
        let id = accounts.add_group(acting, name)?;
        let mut changes = Changes::default();
        if let Some(group) = accounts.group(id) {
            changes.put_group(group.clone());
        }
        self.commit(&mut state, changes)?;
        Ok(id)
    }

    pub fn remove_group(&self, acting: UserId, group: GroupId) -> CfatResult<()> {
        let mut state = self.lock();
        state.accounts.clone().remove_group(acting, group)?;
        let mut changes = Changes::default();
        changes.delete_group(group);
        self.commit(&mut state, changes)
    }

    pub fn join_group(&self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<()> {
        self.group_change(group, |a| a.join(acting, user, group))
    }

    pub fn kick_user(&self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<()> {
        self.group_change(group, |a| a.kick(acting, user, group))
    }

    pub fn promote_user(&self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<()> {
        self.group_change(group, |a| a.promote(acting, user, group))
    }

    pub fn demote_user(&self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<()> {
        self.group_change(group, |a| a.demote(acting, user, group))
    }

    pub fn users(&self) -> Vec<User> {
        self.lock().accounts.users().values().cloned().collect()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.lock().accounts.groups().values().cloned().collect()
    }

    pub fn user_by_name(&self, name: &str) -> Option<User> {
        self.lock().accounts.user_by_name(name).cloned()
    }

    pub fn group_by_name(&self, name: &str) -> Option<Group> {
        self.lock().accounts.group_by_name(name).cloned()
    }

    // ---- queries ----

    pub fn can_read(&self, user: UserId, id: &DirentId) -> CfatResult<bool> {
        let state = self.lock();
        let entry = state.entry(id, "can read")?;
        Ok(access::can_read(user, entry, state.accounts.groups()))
    }

    pub fn can_write(&self, user: UserId, id: &DirentId) -> CfatResult<bool> {
        let state = self.lock();
        let entry = state.entry(id, "can write")?;
        Ok(access::can_write(user, entry, state.accounts.groups()))
    }

    /// Metadata of one entry; needs read on it.
    pub fn entry(&self, acting: UserId, id: &DirentId) -> CfatResult<DirEntry> {
        let state = self.lock();
        let entry = state.entry(id, "stat")?;
        state.require_read(acting, entry, "stat")?;
        Ok(entry.clone())
    }

    /// Resolve a slash-separated path. Every directory passed through must
    /// be readable; the final entry need not be.
    pub fn lookup(&self, acting: UserId, path: &str) -> CfatResult<DirEntry> {
        let state = self.lock();
        let mut cur = state.entry(&DirentId::root(), "lookup")?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if cur.is_file {
                return Err(CfatError::illegal("lookup", path, "not a directory"));
            }
            state.require_read(acting, cur, "lookup")?;
            cur = state
                .fat
                .child_named(&cur.id, part)
                .ok_or_else(|| CfatError::illegal("lookup", path, "no such entry"))?;
        }
        Ok(cur.clone())
    }

    /// Children of a directory, by name.
    pub fn list(&self, acting: UserId, dir: &DirentId) -> CfatResult<Vec<DirEntry>> {
        let state = self.lock();
        let entry = state.dir(dir, "list")?;
        state.require_read(acting, entry, "list")?;
        let mut children: Vec<DirEntry> = state.fat.children(dir).cloned().collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Every readable entry below `dir` with its path, parents first.
    /// Unreadable directories are not descended into.
    pub fn walk(&self, acting: UserId, dir: &DirentId) -> CfatResult<Vec<(String, DirEntry)>> {
        let state = self.lock();
        let top = state.dir(dir, "walk")?;
        state.require_read(acting, top, "walk")?;

        let groups = state.accounts.groups();
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::from([dir.clone()]);
        while let Some(next) = queue.pop_front() {
            let mut children: Vec<&DirEntry> = state.fat.children(&next).collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for child in children {
                if !access::can_read(acting, child, groups) {
                    continue;
                }
                if child.is_dir() {
                    queue.push_back(child.id.clone());
                }
                out.push((state.fat.path_of(&child.id), child.clone()));
            }
        }
        Ok(out)
    }

    // ---- content ----

    /// Open a file for reading. Bumps its access time and count.
    pub fn read(&self, acting: UserId, id: &DirentId) -> CfatResult<ContentReader> {
        let mut state = self.lock();
        let entry = state.entry(id, "read")?;
        if !entry.is_file {
            return Err(CfatError::illegal("read", state.fat.path_of(id), "not a file"));
        }
        state.require_read(acting, entry, "read")?;
        let iv = entry
            .iv
            .ok_or_else(|| CfatError::CorruptData(format!("file {id} has no content IV")))?;
        let size = entry.size;
        let mut touched = entry.clone();
        touched.touch_access();

        let blob = self.connector.open_content_reader(entry.content_key())?;
        let reader = StreamReader::new(
            self.cipher.clone(),
            iv,
            self.opts.content_chunk_size,
            blob.source,
            blob.len,
        );
        if reader.len() != size {
            return Err(CfatError::CorruptData(format!(
                "content of {} holds {} bytes, directory table says {size}",
                state.fat.path_of(id),
                reader.len()
            )));
        }

        let mut changes = Changes::default();
        changes.put_dirent(touched);
        self.commit(&mut state, changes)?;
        Ok(reader)
    }

    /// Create or replace the file `name` in `parent` with `content`.
    ///
    /// A new file needs write on `parent` and takes `permissions`; replacing
    /// needs write on the existing file and keeps its id, owner and
    /// permissions. Content is sealed under a fresh IV into a fresh blob
    /// either way, and the entry moves to it only once the change is
    /// committed. If the stream or the commit fails, nothing changes: the
    /// old content stays in place.
    pub fn put<R: Read>(
        &self,
        acting: UserId,
        name: &str,
        parent: &DirentId,
        mut content: R,
        permissions: &[Permission],
    ) -> CfatResult<DirentId> {
        let mut state = self.lock();
        state.accounts.require_user(acting, "put")?;
        let name = valid_name("put", name)?;
        let dir = state.dir(parent, "put")?;

        let mut entry = match state.fat.child_named(parent, &name) {
            Some(existing) if existing.is_dir() => {
                return Err(CfatError::illegal(
                    "put",
                    state.fat.path_of(&existing.id),
                    "a directory with this name exists",
                ));
            }
            Some(existing) => {
                state.require_write(acting, existing, "put")?;
                existing.clone()
            }
            None => {
                state.require_write(acting, dir, "put")?;
                state.check_groups(permissions, "put")?;
                let mut entry = DirEntry::new_file(state.fresh_id(), &name, parent.clone(), acting);
                for perm in permissions {
                    entry.grant(*perm);
                }
                entry
            }
        };

        let iv = Iv::random();
        let previous = entry.blob.is_some() || entry.iv.is_some();
        let previous = previous.then(|| entry.content_key().to_owned());
        let key = entry.next_content_key();
        let sink = self.connector.open_content_writer(&key)?;
        let mut writer =
            StreamWriter::new(self.cipher.clone(), iv, self.opts.content_chunk_size, sink);
        io::copy(&mut content, &mut writer).map_err(records::io_error)?;
        writer.close()?;
        let summary = writer.summary()?.clone();

        entry.iv = Some(iv);
        entry.blob = Some(key.clone());
        entry.size = summary.len;
        entry.content_hash = Some(summary.content_hash);
        entry.modified_at = now();
        let id = entry.id.clone();
        debug!(id = %id, size = entry.size, chunks = summary.chunks, "content stored");

        let mut changes = Changes::default();
        changes.put_dirent(entry);
        if let Err(e) = self.commit(&mut state, changes) {
            if let Err(cleanup) = self.connector.remove_content(&key) {
                warn!(id = %id, key = %key, "failed to delete unused content blob: {cleanup}");
            }
            return Err(e);
        }
        drop(state);

        if let Some(old) = previous.filter(|old| *old != key) {
            // the entry already points at the new blob
            if let Err(e) = self.connector.remove_content(&old) {
                warn!(id = %id, key = %old, "failed to delete superseded content blob: {e}");
            }
        }
        Ok(id)
    }

    // ---- tree ----

    pub fn mkdir(
        &self,
        acting: UserId,
        name: &str,
        parent: &DirentId,
        permissions: &[Permission],
    ) -> CfatResult<DirentId> {
        let mut state = self.lock();
        state.accounts.require_user(acting, "mkdir")?;
        let name = valid_name("mkdir", name)?;
        let dir = state.dir(parent, "mkdir")?;
        state.require_write(acting, dir, "mkdir")?;
        if let Some(existing) = state.fat.child_named(parent, &name) {
            return Err(CfatError::illegal(
                "mkdir",
                state.fat.path_of(&existing.id),
                "name already exists",
            ));
        }
        state.check_groups(permissions, "mkdir")?;

        let mut entry = DirEntry::new_dir(state.fresh_id(), &name, parent.clone(), acting);
        for perm in permissions {
            entry.grant(*perm);
        }
        let id = entry.id.clone();
        let mut changes = Changes::default();
        changes.put_dirent(entry);
        self.commit(&mut state, changes)?;
        Ok(id)
    }

    /// Move an entry under another directory. Needs write on both.
    pub fn move_entry(&self, acting: UserId, id: &DirentId, new_parent: &DirentId) -> CfatResult<()> {
        let mut state = self.lock();
        if id.is_root() {
            return Err(CfatError::illegal("move", "/", "the root cannot be moved"));
        }
        let entry = state.entry(id, "move")?;
        let dest = state.dir(new_parent, "move")?;
        state.require_write(acting, entry, "move")?;
        state.require_write(acting, dest, "move")?;
        if state.fat.is_within(new_parent, id) {
            return Err(CfatError::illegal(
                "move",
                state.fat.path_of(id),
                "cannot move a directory into itself",
            ));
        }
        if &entry.parent == new_parent {
            return Ok(());
        }
        if state.fat.child_named(new_parent, &entry.name).is_some() {
            return Err(CfatError::illegal(
                "move",
                state.fat.path_of(id),
                "destination holds an entry with the same name",
            ));
        }

        let mut moved = entry.clone();
        moved.parent = new_parent.clone();
        moved.modified_at = now();
        let mut changes = Changes::default();
        changes.put_dirent(moved);
        self.commit(&mut state, changes)
    }

    pub fn rename(&self, acting: UserId, id: &DirentId, new_name: &str) -> CfatResult<()> {
        let mut state = self.lock();
        if id.is_root() {
            return Err(CfatError::illegal("rename", "/", "the root cannot be renamed"));
        }
        let entry = state.entry(id, "rename")?;
        state.require_write(acting, entry, "rename")?;
        let new_name = valid_name("rename", new_name)?;
        if entry.name == new_name {
            return Ok(());
        }
        if state.fat.child_named(&entry.parent, &new_name).is_some() {
            return Err(CfatError::illegal(
                "rename",
                state.fat.path_of(id),
                format!("{new_name:?} already exists"),
            ));
        }

        let mut renamed = entry.clone();
        renamed.name = new_name;
        renamed.modified_at = now();
        let mut changes = Changes::default();
        changes.put_dirent(renamed);
        self.commit(&mut state, changes)
    }

    /// Remove an entry. A non-empty directory needs `recursive`, and then
    /// every entry in the subtree must be writable or nothing is removed.
    pub fn remove(&self, acting: UserId, id: &DirentId, recursive: bool) -> CfatResult<()> {
        let mut state = self.lock();
        if id.is_root() {
            return Err(CfatError::illegal("remove", "/", "the root cannot be removed"));
        }
        let target = state.entry(id, "remove")?;
        if target.is_dir() && state.fat.has_children(id) && !recursive {
            return Err(CfatError::illegal(
                "remove",
                state.fat.path_of(id),
                "directory not empty",
            ));
        }
        let ids = if recursive {
            state.fat.subtree(id)
        } else {
            vec![id.clone()]
        };

        let mut changes = Changes::default();
        let mut files = Vec::new();
        for victim in &ids {
            let entry = state.entry(victim, "remove")?;
            state.require_write(acting, entry, "remove")?;
            if entry.is_file {
                files.push(entry.content_key().to_owned());
            }
            changes.delete_dirent(victim.clone());
        }
        self.commit(&mut state, changes)?;
        drop(state);

        for key in files {
            // an orphaned blob is harmless; the entry is already gone
            if let Err(e) = self.connector.remove_content(&key) {
                warn!(key = %key, "failed to delete content blob: {e}");
            }
        }
        debug!(removed = ids.len(), "entries removed");
        Ok(())
    }

    pub fn chown(&self, acting: UserId, id: &DirentId, new_owner: UserId) -> CfatResult<()> {
        let mut state = self.lock();
        state.accounts.require_user(acting, "chown")?;
        let entry = state.entry(id, "chown")?;
        state.require_write(acting, entry, "chown")?;
        if state.accounts.user(new_owner).is_none() {
            return Err(CfatError::illegal("chown", new_owner, "no such user"));
        }
        if entry.owner == new_owner {
            return Ok(());
        }
        let mut entry = entry.clone();
        entry.owner = new_owner;
        let mut changes = Changes::default();
        changes.put_dirent(entry);
        self.commit(&mut state, changes)
    }

    /// Grant `perm` on an entry, replacing any grant to the same group.
    /// With `recursive`, the whole subtree must be writable.
    pub fn add_permission(
        &self,
        acting: UserId,
        id: &DirentId,
        perm: Permission,
        recursive: bool,
    ) -> CfatResult<()> {
        let mut state = self.lock();
        state.accounts.require_user(acting, "add permission")?;
        state.entry(id, "add permission")?;
        state.check_groups(&[perm], "add permission")?;
        let ids = if recursive {
            state.fat.subtree(id)
        } else {
            vec![id.clone()]
        };

        let mut changes = Changes::default();
        for target in &ids {
            let entry = state.entry(target, "add permission")?;
            state.require_write(acting, entry, "add permission")?;
            if entry.permissions.get(&perm.group) == Some(&perm.access()) {
                continue;
            }
            let mut entry = entry.clone();
            entry.grant(perm);
            changes.put_dirent(entry);
        }
        self.commit(&mut state, changes)
    }

    pub fn remove_permission(&self, acting: UserId, id: &DirentId, group: GroupId) -> CfatResult<()> {
        let mut state = self.lock();
        let entry = state.entry(id, "remove permission")?;
        state.require_write(acting, entry, "remove permission")?;
        if !entry.permissions.contains_key(&group) {
            return Ok(());
        }
        let mut entry = entry.clone();
        entry.permissions.remove(&group);
        let mut changes = Changes::default();
        changes.put_dirent(entry);
        self.commit(&mut state, changes)
    }

    // ---- internals ----

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn group_change(
        &self,
        group: GroupId,
        change: impl FnOnce(&mut Accounts) -> CfatResult<bool>,
    ) -> CfatResult<()> {
        let mut state = self.lock();
        let mut accounts = state.accounts.clone();
        if !change(&mut accounts)? {
            return Ok(());
        }
        let mut changes = Changes::default();
        if let Some(g) = accounts.group(group) {
            changes.put_group(g.clone());
        }
        self.commit(&mut state, changes)
    }

    /// Cache first, then apply; a failed cache write changes nothing.
    fn commit(&self, state: &mut State, changes: Changes) -> CfatResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.cache.record(&changes)?;
        state.apply(changes);
        state.unsynced += 1;
        if self.opts.sync_every > 0 && state.unsynced >= self.opts.sync_every {
            if let Err(e) = self.sync_locked(state) {
                warn!("periodic metadata sync failed, changes stay cached: {e}");
            }
        }
        Ok(())
    }

    fn sync_locked(&self, state: &mut State) -> CfatResult<()> {
        let entries: Vec<&DirEntry> = state.fat.entries().collect();
        self.write_table(Table::Fat, &entries)?;
        let users: Vec<&User> = state.accounts.users().values().collect();
        self.write_table(Table::Users, &users)?;
        let groups: Vec<&Group> = state.accounts.groups().values().collect();
        self.write_table(Table::Groups, &groups)?;
        debug!(
            entries = entries.len(),
            users = users.len(),
            groups = groups.len(),
            "metadata tables written"
        );
        self.cache.clear()?;
        state.unsynced = 0;
        Ok(())
    }

    fn write_table<T: Serialize>(&self, table: Table, records: &[T]) -> CfatResult<()> {
        let sink = self.connector.open_metadata_writer(table.name())?;
        let mut writer = self.tables.writer(sink, table.iv_offset())?;
        records::write_table(&mut writer, records)?;
        writer.close()?;
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut state = self.lock();
        if state.unsynced == 0 && self.cache.is_empty() {
            return;
        }
        if let Err(e) = self.sync_locked(&mut state) {
            warn!("metadata sync on drop failed, cached changes replay on next open: {e}");
        }
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("identity", &self.identity)
            .field("cache", &self.cache)
            .finish()
    }
}
