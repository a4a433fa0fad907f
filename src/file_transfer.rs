//! Interface to the printer's storage (SD card / internal storage).
//!
//! Printers expose it over implicit FTPS; the session only needs the operations
//! below. [`MemoryStorage`] is an in-process implementation for tests and fakes.

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait FileTransfer: Send + Sync {
    /// Tree rooted at `path`
    fn list(&self, path: &str) -> Result<FileNode>;
    fn upload(&self, path: &str, data: &[u8]) -> Result<()>;
    fn download(&self, path: &str) -> Result<Vec<u8>>;
    fn delete(&self, path: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn mkdir(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// full path
    pub id: String,
    pub name: String,
    /// `None` for files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn is_dir(&self) -> bool {
        self.children.is_some()
    }

    pub fn find(&self, id: &str) -> Option<&FileNode> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter()
            .flatten()
            .find_map(|child| child.find(id))
    }
}

/// `/a//b/` -> `/a/b`
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn base_name(path: &str) -> String {
    match path.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(name) => name.to_string(),
    }
}

#[derive(Default)]
struct PendingNode {
    is_dir: bool,
    children: BTreeMap<String, PendingNode>,
}

impl PendingNode {
    fn finish(self, id: String, name: String) -> FileNode {
        if !self.is_dir {
            return FileNode {
                id,
                name,
                children: None,
            };
        }

        let mut children: Vec<FileNode> = self
            .children
            .into_iter()
            .map(|(child_name, node)| node.finish(join(&id, &child_name), child_name))
            .collect();
        // directories first
        children.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

        FileNode {
            id,
            name,
            children: Some(children),
        }
    }
}

/// Assembles a tree from a flat `(path, is_dir)` listing.
///
/// Entries outside `root` are skipped. Missing intermediate directories are
/// created.
pub fn build_tree(root: &str, entries: &[(String, bool)]) -> FileNode {
    let root = normalize_path(root);
    let mut tree = PendingNode {
        is_dir: true,
        children: BTreeMap::new(),
    };

    for (path, is_dir) in entries {
        let path = normalize_path(path);
        let rel = if root == "/" {
            path.trim_start_matches('/')
        } else {
            match path.strip_prefix(&root) {
                Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
                _ => {
                    trace!("skipping {} outside {}", path, root);
                    continue;
                }
            }
        };
        if rel.is_empty() {
            continue;
        }

        let mut node = &mut tree;
        let mut parts = rel.split('/').peekable();
        while let Some(part) = parts.next() {
            let last = parts.peek().is_none();
            node = node.children.entry(part.to_string()).or_default();
            if !last || *is_dir {
                node.is_dir = true;
            }
        }
    }

    let name = base_name(&root);
    tree.finish(root, name)
}

/// MARK: in-memory storage

/// `None` marks a directory
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_dir(entries: &BTreeMap<String, Option<Vec<u8>>>, path: &str) -> bool {
        path == "/" || matches!(entries.get(path), Some(None))
    }

    fn parent(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(i) => path[..i].to_string(),
        }
    }

    fn descendants(entries: &BTreeMap<String, Option<Vec<u8>>>, path: &str) -> Vec<String> {
        let prefix = join(path, "");
        entries
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

impl FileTransfer for MemoryStorage {
    fn list(&self, path: &str) -> Result<FileNode> {
        let path = normalize_path(path);
        let entries = self.entries.lock();
        ensure!(Self::is_dir(&entries, &path), "not a directory: {}", path);

        let listing: Vec<(String, bool)> = Self::descendants(&entries, &path)
            .into_iter()
            .filter(|k| *k != path)
            .map(|k| {
                let is_dir = Self::is_dir(&entries, &k);
                (k, is_dir)
            })
            .collect();
        Ok(build_tree(&path, &listing))
    }

    fn upload(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries.lock();
        let parent = Self::parent(&path);
        ensure!(Self::is_dir(&entries, &parent), "no such directory: {}", parent);
        ensure!(!Self::is_dir(&entries, &path), "is a directory: {}", path);
        debug!("upload {} ({} bytes)", path, data.len());
        entries.insert(path, Some(data.to_vec()));
        Ok(())
    }

    fn download(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        match self.entries.lock().get(&path) {
            Some(Some(data)) => Ok(data.clone()),
            Some(None) => bail!("is a directory: {}", path),
            None => bail!("no such file: {}", path),
        }
    }

    fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        ensure!(path != "/", "cannot delete root");
        let mut entries = self.entries.lock();
        let doomed = Self::descendants(&entries, &path);
        ensure!(!doomed.is_empty(), "no such file: {}", path);
        for k in doomed {
            entries.remove(&k);
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        let mut entries = self.entries.lock();
        ensure!(entries.contains_key(&from), "no such file: {}", from);
        ensure!(!entries.contains_key(&to), "already exists: {}", to);
        let parent = Self::parent(&to);
        ensure!(Self::is_dir(&entries, &parent), "no such directory: {}", parent);

        for k in Self::descendants(&entries, &from) {
            if let Some(v) = entries.remove(&k) {
                let moved = format!("{}{}", to, &k[from.len()..]);
                entries.insert(moved, v);
            }
        }
        Ok(())
    }

    /// Creates missing parents too
    fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.entries.lock();
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            match entries.get(&current) {
                Some(Some(_)) => bail!("file in the way: {}", current),
                Some(None) => {}
                None => {
                    entries.insert(current.clone(), None);
                }
            }
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let entries = self.entries.lock();
        Ok(path == "/" || entries.contains_key(&path))
    }
}
