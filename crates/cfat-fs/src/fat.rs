//! The file allocation table: every directory entry keyed by id, plus a
//! parent → children index rebuilt whenever the table is loaded.

use std::collections::{BTreeSet, HashMap, VecDeque};

use cfat_core::{CfatError, CfatResult};
use tracing::debug;

use crate::cache::Change;
use crate::model::{DirEntry, DirentId, Permission, UserId, EVERYBODY_GROUP};

#[derive(Debug, Clone, Default)]
pub struct Fat {
    entries: HashMap<DirentId, DirEntry>,
    children: HashMap<DirentId, BTreeSet<DirentId>>,
}

impl Fat {
    /// A table holding only the root directory, readable by everybody.
    pub fn with_root(owner: UserId) -> Self {
        let mut root = DirEntry::new_dir(DirentId::root(), "", DirentId::root(), owner);
        root.grant(Permission::new(EVERYBODY_GROUP, true, false));
        let mut fat = Fat::default();
        fat.entries.insert(root.id.clone(), root);
        fat
    }

    /// Build from loaded records, rejecting a table whose tree is broken.
    pub fn from_entries(entries: impl IntoIterator<Item = DirEntry>) -> CfatResult<Self> {
        Fat::load(entries, std::iter::empty::<(DirentId, Change<DirEntry>)>())
    }

    /// Build from loaded records with cached changes replayed on top. The
    /// tree is only checked once every change is in, so replay order does
    /// not matter.
    pub fn load(
        entries: impl IntoIterator<Item = DirEntry>,
        replay: impl IntoIterator<Item = (DirentId, Change<DirEntry>)>,
    ) -> CfatResult<Self> {
        let mut entries: HashMap<DirentId, DirEntry> =
            entries.into_iter().map(|e| (e.id.clone(), e)).collect();
        for (id, change) in replay {
            match change {
                Change::Upsert(entry) => {
                    entries.insert(id, entry);
                }
                Change::Delete => {
                    entries.remove(&id);
                }
            }
        }
        let mut fat = Fat {
            entries,
            children: HashMap::new(),
        };
        fat.rebuild_index();
        fat.validate()?;
        Ok(fat)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &DirentId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &DirentId) -> Option<&DirEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    /// Insert or replace an entry, keeping the index in step with `parent`.
    pub fn insert(&mut self, entry: DirEntry) {
        let id = entry.id.clone();
        let parent = entry.parent.clone();
        if let Some(old) = self.entries.insert(id.clone(), entry) {
            if old.parent != parent {
                self.unlink(&old.parent, &id);
            }
        }
        if !id.is_root() {
            self.children.entry(parent).or_default().insert(id);
        }
    }

    /// Remove one entry. Children of a removed directory are not touched.
    pub fn remove(&mut self, id: &DirentId) -> Option<DirEntry> {
        let entry = self.entries.remove(id)?;
        self.unlink(&entry.parent, id);
        self.children.remove(id);
        Some(entry)
    }

    pub fn children(&self, dir: &DirentId) -> impl Iterator<Item = &DirEntry> {
        self.children
            .get(dir)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    pub fn has_children(&self, dir: &DirentId) -> bool {
        self.children.get(dir).is_some_and(|c| !c.is_empty())
    }

    pub fn child_named(&self, dir: &DirentId, name: &str) -> Option<&DirEntry> {
        self.children(dir).find(|e| e.name == name)
    }

    /// `id` and everything below it, parents before children.
    pub fn subtree(&self, id: &DirentId) -> Vec<DirentId> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(next) = queue.pop_front() {
            if let Some(kids) = self.children.get(&next) {
                queue.extend(kids.iter().cloned());
            }
            out.push(next);
        }
        out
    }

    /// True if `ancestor` is `id` or lies on its path to the root.
    pub fn is_within(&self, id: &DirentId, ancestor: &DirentId) -> bool {
        let mut cur = id;
        loop {
            if cur == ancestor {
                return true;
            }
            if cur.is_root() {
                return false;
            }
            match self.entries.get(cur) {
                Some(e) => cur = &e.parent,
                None => return false,
            }
        }
    }

    /// Slash-separated path from the root for display.
    pub fn path_of(&self, id: &DirentId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(e) = self.entries.get(cur) {
            if e.id.is_root() {
                break;
            }
            parts.push(e.name.as_str());
            cur = &e.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn rebuild_index(&mut self) {
        self.children.clear();
        for entry in self.entries.values() {
            if !entry.id.is_root() {
                self.children
                    .entry(entry.parent.clone())
                    .or_default()
                    .insert(entry.id.clone());
            }
        }
    }

    /// Root present, every parent an existing directory, every entry
    /// reachable from the root.
    pub fn validate(&self) -> CfatResult<()> {
        match self.entries.get(&DirentId::root()) {
            Some(root) if root.is_dir() => {}
            Some(_) => return Err(CfatError::CorruptData("root entry is a file".into())),
            None => return Err(CfatError::CorruptData("directory table has no root".into())),
        }
        for entry in self.entries.values() {
            if entry.id.is_root() {
                continue;
            }
            match self.entries.get(&entry.parent) {
                Some(p) if p.is_dir() => {}
                Some(_) => {
                    return Err(CfatError::CorruptData(format!(
                        "entry {} has a file as parent",
                        entry.id
                    )))
                }
                None => {
                    return Err(CfatError::CorruptData(format!(
                        "entry {} has missing parent {}",
                        entry.id, entry.parent
                    )))
                }
            }
        }
        let reachable = self.subtree(&DirentId::root()).len();
        if reachable != self.entries.len() {
            return Err(CfatError::CorruptData(format!(
                "{} entries unreachable from root",
                self.entries.len() - reachable
            )));
        }
        debug!(entries = self.entries.len(), "directory table valid");
        Ok(())
    }

    fn unlink(&mut self, parent: &DirentId, id: &DirentId) {
        if let Some(kids) = self.children.get_mut(parent) {
            kids.remove(id);
            if kids.is_empty() {
                self.children.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(id: &str, parent: &str, name: &str) -> DirEntry {
        DirEntry::new_dir(DirentId::from(id), name, DirentId::from(parent), 0)
    }

    fn file(id: &str, parent: &str, name: &str) -> DirEntry {
        DirEntry::new_file(DirentId::from(id), name, DirentId::from(parent), 0)
    }

    fn sample() -> Fat {
        let mut fat = Fat::with_root(0);
        fat.insert(dir("a", "", "a"));
        fat.insert(dir("b", "a", "b"));
        fat.insert(file("f", "b", "f.txt"));
        fat.insert(file("g", "", "g.txt"));
        fat
    }

    #[test]
    fn test_children_and_lookup() {
        let fat = sample();
        let mut names: Vec<_> = fat.children(&DirentId::root()).map(|e| &e.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "g.txt"]);
        assert_eq!(
            fat.child_named(&DirentId::from("b"), "f.txt").unwrap().id,
            DirentId::from("f")
        );
        assert!(fat.child_named(&DirentId::from("b"), "nope").is_none());
        assert_eq!(fat.path_of(&DirentId::from("f")), "/a/b/f.txt");
        assert_eq!(fat.path_of(&DirentId::root()), "/");
    }

    #[test]
    fn test_subtree_is_top_down() {
        let fat = sample();
        let ids = fat.subtree(&DirentId::from("a"));
        assert_eq!(
            ids,
            vec![DirentId::from("a"), DirentId::from("b"), DirentId::from("f")]
        );
    }

    #[test]
    fn test_reinsert_moves_index() {
        let mut fat = sample();
        let mut f = fat.get(&DirentId::from("f")).unwrap().clone();
        f.parent = DirentId::root();
        fat.insert(f);
        assert!(!fat.has_children(&DirentId::from("b")));
        assert!(fat.child_named(&DirentId::root(), "f.txt").is_some());
        assert!(fat.is_within(&DirentId::from("b"), &DirentId::from("a")));
        assert!(!fat.is_within(&DirentId::from("f"), &DirentId::from("a")));
        fat.validate().unwrap();
    }

    #[test]
    fn test_insert_over_existing_moves_parent() {
        let mut fat = sample();
        let mut moved = fat.get(&DirentId::from("g")).unwrap().clone();
        moved.parent = DirentId::from("a");
        fat.insert(moved);
        assert!(fat.child_named(&DirentId::root(), "g.txt").is_none());
        assert!(fat.child_named(&DirentId::from("a"), "g.txt").is_some());
    }

    #[test]
    fn test_rejects_orphan() {
        let result = Fat::from_entries(vec![
            dir("", "", ""),
            file("x", "missing", "x"),
        ]);
        assert!(result.unwrap_err().is_corrupt());
    }

    #[test]
    fn test_rejects_cycle_detached_from_root() {
        let result = Fat::from_entries(vec![dir("", "", ""), dir("p", "q", "p"), dir("q", "p", "q")]);
        assert!(result.unwrap_err().is_corrupt());
    }

    #[test]
    fn test_rejects_missing_root_and_file_parent() {
        assert!(Fat::from_entries(vec![dir("a", "a", "a")]).is_err());
        let result = Fat::from_entries(vec![
            dir("", "", ""),
            file("f", "", "f"),
            file("g", "f", "g"),
        ]);
        assert!(result.unwrap_err().is_corrupt());
    }

    #[test]
    fn test_replay_order_does_not_matter() {
        let base: Vec<DirEntry> = sample().entries().cloned().collect();
        // a child replayed before the directory that holds it
        let replay = vec![
            (DirentId::from("f"), Change::Delete),
            (DirentId::from("i"), Change::Upsert(file("i", "n", "i"))),
            (DirentId::from("n"), Change::Upsert(dir("n", "b", "n"))),
            (DirentId::from("h"), Change::Upsert(file("h", "b", "h"))),
        ];
        let fat = Fat::load(base, replay).unwrap();
        assert_eq!(fat.path_of(&DirentId::from("i")), "/a/b/n/i");
        assert!(fat.child_named(&DirentId::from("b"), "h").is_some());
        assert!(fat.child_named(&DirentId::from("b"), "f.txt").is_none());
    }
}
