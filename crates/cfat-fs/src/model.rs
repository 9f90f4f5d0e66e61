//! Directory entries, users, groups and permission records.
//!
//! These are the exact shapes persisted in the metadata tables and the
//! cache snapshot, one JSON object per record.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use cfat_crypto::Iv;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub type UserId = u32;
pub type GroupId = u32;

/// The superuser, created with the filesystem and never removable
pub const ROOT_USER: UserId = 0;
pub const ROOT_NAME: &str = "root";

/// Every user is a member; it cannot be removed or left
pub const EVERYBODY_GROUP: GroupId = 0;
pub const EVERYBODY_NAME: &str = "everybody";

/// Opaque directory entry identifier. The root directory has the empty id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirentId(String);

impl DirentId {
    pub fn root() -> Self {
        DirentId(String::new())
    }

    /// 128 random bits, hex encoded. Safe to use as a backend key.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        DirentId(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DirentId {
    fn from(s: &str) -> Self {
        DirentId(s.to_string())
    }
}

impl From<String> for DirentId {
    fn from(s: String) -> Self {
        DirentId(s)
    }
}

impl fmt::Display for DirentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Read and write bits granted to one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
}

/// A group plus the bits it is granted on an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub group: GroupId,
    pub read: bool,
    pub write: bool,
}

impl Permission {
    pub fn new(group: GroupId, read: bool, write: bool) -> Self {
        Permission { group, read, write }
    }

    pub fn access(&self) -> Access {
        Access {
            read: self.read,
            write: self.write,
        }
    }
}

/// One node of the filesystem tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub id: DirentId,
    pub is_file: bool,
    /// Base IV of the content stream; files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<Iv>,
    pub owner: UserId,
    pub name: String,
    pub created_at: u64,
    pub modified_at: u64,
    pub accessed_at: u64,
    pub access_count: u64,
    /// At most one grant per group
    #[serde(default)]
    pub permissions: BTreeMap<GroupId, Access>,
    /// Cleartext size in bytes; 0 for directories
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Backend key of the current content version; the id when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    pub parent: DirentId,
}

impl DirEntry {
    pub fn new_dir(id: DirentId, name: &str, parent: DirentId, owner: UserId) -> Self {
        let ts = now();
        DirEntry {
            id,
            is_file: false,
            iv: None,
            owner,
            name: sanitize_name(name),
            created_at: ts,
            modified_at: ts,
            accessed_at: ts,
            access_count: 0,
            permissions: BTreeMap::new(),
            size: 0,
            content_hash: None,
            blob: None,
            parent,
        }
    }

    pub fn new_file(id: DirentId, name: &str, parent: DirentId, owner: UserId) -> Self {
        DirEntry {
            is_file: true,
            ..DirEntry::new_dir(id, name, parent, owner)
        }
    }

    pub fn is_dir(&self) -> bool {
        !self.is_file
    }

    /// Backend key the current content lives under.
    pub fn content_key(&self) -> &str {
        self.blob.as_deref().unwrap_or(self.id.as_str())
    }

    /// A key no earlier version of this file has used.
    pub fn next_content_key(&self) -> String {
        format!("{}-{:016x}", self.id.as_str(), rand::random::<u64>())
    }

    pub fn grant(&mut self, perm: Permission) {
        self.permissions.insert(perm.group, perm.access());
    }

    pub fn touch_access(&mut self) {
        self.accessed_at = now();
        self.access_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// PHC-format Argon2id hash of the client's password pre-hash
    pub password_hash: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
    #[serde(default)]
    pub admins: BTreeSet<UserId>,
}

impl Group {
    pub fn new(id: GroupId, name: &str, founder: UserId) -> Self {
        Group {
            id,
            name: name.to_string(),
            members: BTreeSet::from([founder]),
            admins: BTreeSet::from([founder]),
        }
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }
}

/// Entry names never contain a newline; it is replaced with a space.
pub fn sanitize_name(name: &str) -> String {
    name.replace('\n', " ")
}

/// Current unix time in seconds
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
