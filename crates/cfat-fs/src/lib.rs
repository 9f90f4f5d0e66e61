//! cfat-fs: the filesystem and permission engine
//!
//! The authoritative structure is a flat table of directory entries (the
//! FAT) plus user and group tables, all held in memory by [`Filesystem`].
//! Every mutation is checked before it is applied, recorded in the
//! crash-recoverable [`MetadataCache`], and periodically folded into full
//! table rewrites on the backend.
//!
//! ```text
//! caller ──► Filesystem ──► access checks ──► Fat / Accounts (memory)
//!                │                                  │
//!                ├──► StreamWriter/Reader ──► Connector (content blobs)
//!                └──► MetadataCache ──► side file   └──► full sync (tables)
//! ```

pub mod access;
pub mod accounts;
pub mod cache;
pub mod engine;
pub mod fat;
pub mod model;
pub mod records;

pub use cache::{CacheLease, CacheRegistry, Change, MetadataCache};
pub use engine::{ContentReader, Filesystem, FsOptions};
pub use model::{
    now, Access, DirEntry, DirentId, Group, GroupId, Permission, User, UserId, EVERYBODY_GROUP,
    EVERYBODY_NAME, ROOT_NAME, ROOT_USER,
};

/// Derive the pre-hash the engine expects from a user name and raw password.
///
/// Binding the name means two users with the same password still hand the
/// engine different secrets.
pub fn prehash(name: &str, password: &str) -> String {
    let mut material = Vec::with_capacity(name.len() + password.len() + 1);
    material.extend_from_slice(name.as_bytes());
    material.push(0);
    material.extend_from_slice(password.as_bytes());
    blake3::Hash::from(blake3::derive_key("cfat user password prehash v1", &material))
        .to_hex()
        .to_string()
}
