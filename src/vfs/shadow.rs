//! Shadow layer
//!
//! The shadow tree is built once from a flat manifest of
//! `{id, name, type, contentPath}` entries whose ids are paths relative to
//! `/`. Missing intermediate directories are inferred. The tree itself never
//! changes after loading; file bytes are fetched lazily through a
//! [`ContentSource`] and memoized by content location.

use super::{NodeKind, join_path, normalize_path, split_path};
use crate::kernel::errno::{SyscallError, SyscallResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    File,
    #[serde(alias = "directory")]
    Folder,
}

/// One manifest record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ManifestKind,
    #[serde(rename = "contentPath", default, skip_serializing_if = "Option::is_none")]
    pub content_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The flat shadow manifest, serialized as a JSON array
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShadowManifest {
    pub entries: Vec<ManifestEntry>,
}

impl ShadowManifest {
    pub fn from_json(bytes: &[u8]) -> SyscallResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            log::debug!("rejecting shadow manifest: {}", e);
            SyscallError::InvalidArgument
        })
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.entries)
    }

    /// Build a manifest from a directory on disk
    ///
    /// Ids are paths relative to `root`; file content locations are
    /// `<prefix>/<id>`. Entries are sorted so the output is stable.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn scan_dir(root: &std::path::Path, prefix: &str) -> std::io::Result<Self> {
        let mut entries = Vec::new();
        scan_into(root, "", prefix.trim_end_matches('/'), &mut entries)?;
        Ok(Self { entries })
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn scan_into(
    dir: &std::path::Path,
    rel: &str,
    prefix: &str,
    out: &mut Vec<ManifestEntry>,
) -> std::io::Result<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let id = if rel.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", rel, name)
        };
        let meta = child.metadata()?;
        if meta.is_dir() {
            out.push(ManifestEntry {
                id: id.clone(),
                name,
                kind: ManifestKind::Folder,
                content_path: None,
                size: None,
            });
            scan_into(&child.path(), &id, prefix, out)?;
        } else if meta.is_file() {
            out.push(ManifestEntry {
                content_path: Some(format!("{}/{}", prefix, id)),
                id,
                name,
                kind: ManifestKind::File,
                size: Some(meta.len()),
            });
        }
    }
    Ok(())
}

/// Errors a content source can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The bytes will be delivered later by the host
    #[error("content not delivered yet")]
    Pending,
    #[error("content not found")]
    NotFound,
    #[error("fetch failed: {0}")]
    Failed(String),
}

/// Where shadow file bytes come from
pub trait ContentSource {
    fn fetch(&mut self, location: &str) -> Result<Vec<u8>, FetchError>;
}

/// Source for hosts that fetch asynchronously and hydrate the cache
///
/// Every fetch reports [`FetchError::Pending`]; the kernel turns that into
/// `ENODATA` carrying the location, and the host answers with a hydrate call.
#[derive(Debug, Default)]
pub struct DeferredSource;

impl ContentSource for DeferredSource {
    fn fetch(&mut self, _location: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Pending)
    }
}

/// In-memory content keyed by location
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    files: HashMap<String, Vec<u8>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, location: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(location.into(), bytes.into());
    }

    pub fn with(mut self, location: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(location, bytes);
        self
    }
}

impl ContentSource for StaticSource {
    fn fetch(&mut self, location: &str) -> Result<Vec<u8>, FetchError> {
        self.files.get(location).cloned().ok_or(FetchError::NotFound)
    }
}

/// Reads content locations `<prefix>/<rel>` from `<root>/<rel>`
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone)]
pub struct DirSource {
    root: std::path::PathBuf,
    prefix: String,
}

#[cfg(not(target_arch = "wasm32"))]
impl DirSource {
    pub fn new(root: impl Into<std::path::PathBuf>, prefix: &str) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ContentSource for DirSource {
    fn fetch(&mut self, location: &str) -> Result<Vec<u8>, FetchError> {
        let rel = location
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(location)
            .trim_start_matches('/');
        if rel.split('/').any(|c| c == "..") {
            return Err(FetchError::NotFound);
        }
        match std::fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::Failed(e.to_string())),
        }
    }
}

/// A node in the shadow tree
#[derive(Debug, Clone)]
pub struct ShadowNode {
    pub id: String,
    pub kind: NodeKind,
    /// Content location, files only
    pub location: Option<String>,
    /// Size announced by the manifest
    pub size: Option<u64>,
    /// Child names, directories only
    pub children: BTreeSet<String>,
}

impl ShadowNode {
    fn directory(id: String) -> Self {
        Self {
            id,
            kind: NodeKind::Directory,
            location: None,
            size: None,
            children: BTreeSet::new(),
        }
    }
}

pub const ROOT_ID: &str = "root";

/// The immutable base tree plus its content cache
pub struct ShadowTree {
    nodes: HashMap<String, ShadowNode>,
    cache: HashMap<String, Rc<[u8]>>,
    source: Box<dyn ContentSource>,
    loaded: bool,
    loaded_at: f64,
}

impl ShadowTree {
    pub fn new(source: Box<dyn ContentSource>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ShadowNode::directory(ROOT_ID.to_string()));
        Self {
            nodes,
            cache: HashMap::new(),
            source,
            loaded: false,
            loaded_at: 0.0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Time the manifest was loaded; shadow nodes report it as their
    /// creation and modification time
    pub fn loaded_at(&self) -> f64 {
        self.loaded_at
    }

    /// Load the manifest, once
    ///
    /// Returns `false` without touching the tree when a manifest was already
    /// loaded. A rejected manifest leaves the tree empty and unloaded.
    pub fn load(&mut self, manifest: &ShadowManifest, now: f64) -> SyscallResult<bool> {
        if self.loaded {
            log::debug!("shadow manifest already loaded, ignoring");
            return Ok(false);
        }

        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ShadowNode::directory(ROOT_ID.to_string()));

        for entry in &manifest.entries {
            let rel = entry.id.trim_matches('/');
            if rel.is_empty() {
                return Err(SyscallError::InvalidArgument);
            }
            let path = normalize_path(rel)?;
            ensure_ancestors(&mut nodes, &path)?;

            let (parent, name) = split_path(&path).ok_or(SyscallError::InvalidArgument)?;
            let node = match entry.kind {
                ManifestKind::Folder => ShadowNode::directory(rel.to_string()),
                ManifestKind::File => ShadowNode {
                    id: rel.to_string(),
                    kind: NodeKind::File,
                    location: Some(entry.content_path.clone().unwrap_or_else(|| path.clone())),
                    size: entry.size,
                    children: BTreeSet::new(),
                },
            };

            match nodes.get_mut(&path) {
                Some(existing)
                    if existing.kind == NodeKind::Directory && node.kind == NodeKind::Directory =>
                {
                    existing.id = node.id;
                }
                Some(_) => return Err(SyscallError::InvalidArgument),
                None => {
                    if let Some(dir) = nodes.get_mut(parent) {
                        dir.children.insert(name.to_string());
                    }
                    nodes.insert(path, node);
                }
            }
        }

        log::info!("shadow manifest loaded: {} nodes", nodes.len() - 1);
        self.nodes = nodes;
        self.loaded = true;
        self.loaded_at = now;
        Ok(true)
    }

    pub fn get(&self, path: &str) -> Option<&ShadowNode> {
        self.nodes.get(path)
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, path: &str) -> Option<&mut ShadowNode> {
        self.nodes.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.nodes.get(path).map(|n| n.kind)
    }

    /// Whether some proper ancestor of `path` is a shadow file
    pub fn has_file_ancestor(&self, path: &str) -> bool {
        let mut current = path;
        while let Some((parent, _)) = split_path(current) {
            if self.kind(parent) == Some(NodeKind::File) {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Child names and kinds of a shadow directory
    pub fn children(&self, path: &str) -> Vec<(String, &ShadowNode)> {
        let Some(dir) = self.nodes.get(path) else {
            return Vec::new();
        };
        dir.children
            .iter()
            .filter_map(|name| {
                self.nodes
                    .get(&join_path(path, name))
                    .map(|node| (name.clone(), node))
            })
            .collect()
    }

    /// Size of a shadow file if it is known without fetching
    pub fn known_size(&self, path: &str) -> Option<u64> {
        let node = self.nodes.get(path)?;
        let location = node.location.as_ref()?;
        match self.cache.get(location) {
            Some(bytes) => Some(bytes.len() as u64),
            None => node.size,
        }
    }

    /// Bytes for a content location, fetched once and memoized
    pub fn content(&mut self, location: &str) -> SyscallResult<Rc<[u8]>> {
        if let Some(bytes) = self.cache.get(location) {
            return Ok(bytes.clone());
        }
        match self.source.fetch(location) {
            Ok(bytes) => {
                let bytes: Rc<[u8]> = bytes.into();
                self.cache.insert(location.to_string(), bytes.clone());
                Ok(bytes)
            }
            Err(FetchError::Pending) => Err(SyscallError::ContentPending {
                location: location.to_string(),
            }),
            Err(FetchError::NotFound) => Err(SyscallError::NotFound),
            Err(FetchError::Failed(reason)) => {
                log::warn!("shadow fetch of {} failed: {}", location, reason);
                Err(SyscallError::NotFound)
            }
        }
    }

    /// Deliver bytes fetched by the host; memoized content is never replaced
    pub fn hydrate(&mut self, location: &str, bytes: Vec<u8>) {
        if self.cache.contains_key(location) {
            return;
        }
        log::debug!("hydrated {} ({} bytes)", location, bytes.len());
        self.cache.insert(location.to_string(), bytes.into());
    }

    pub fn is_hydrated(&self, location: &str) -> bool {
        self.cache.contains_key(location)
    }

    /// Length of memoized content, if any
    pub fn cached_len(&self, location: &str) -> Option<u64> {
        self.cache.get(location).map(|bytes| bytes.len() as u64)
    }
}

fn ensure_ancestors(nodes: &mut HashMap<String, ShadowNode>, path: &str) -> SyscallResult<()> {
    let Some((parent, _)) = split_path(path) else {
        return Ok(());
    };
    match nodes.get(parent).map(|n| n.kind) {
        Some(NodeKind::Directory) => {}
        Some(NodeKind::File) => return Err(SyscallError::InvalidArgument),
        None => {
            ensure_ancestors(nodes, parent)?;
            let id = parent.trim_start_matches('/').to_string();
            nodes.insert(parent.to_string(), ShadowNode::directory(id));
            if let Some((grandparent, dir_name)) = split_path(parent) {
                if let Some(dir) = nodes.get_mut(grandparent) {
                    dir.children.insert(dir_name.to_string());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ShadowManifest {
        ShadowManifest::from_json(
            br#"[
                {"id": "docs", "name": "docs", "type": "folder"},
                {"id": "docs/readme.txt", "name": "readme.txt", "type": "file", "contentPath": "/shadow/docs/readme.txt"},
                {"id": "apps/notes/main.js", "name": "main.js", "type": "file", "contentPath": "/shadow/apps/notes/main.js", "size": 11}
            ]"#,
        )
        .unwrap()
    }

    fn source() -> StaticSource {
        StaticSource::new()
            .with("/shadow/docs/readme.txt", "base")
            .with("/shadow/apps/notes/main.js", "console.log")
    }

    #[test]
    fn test_load_builds_tree() {
        let mut tree = ShadowTree::new(Box::new(source()));
        assert!(tree.load(&manifest(), 10.0).unwrap());
        assert!(tree.is_loaded());
        assert_eq!(tree.kind("/docs"), Some(NodeKind::Directory));
        assert_eq!(tree.kind("/docs/readme.txt"), Some(NodeKind::File));
        assert_eq!(tree.get("/docs/readme.txt").unwrap().id, "docs/readme.txt");
        assert_eq!(tree.loaded_at(), 10.0);
    }

    #[test]
    fn test_intermediate_dirs_inferred() {
        let mut tree = ShadowTree::new(Box::new(source()));
        tree.load(&manifest(), 0.0).unwrap();
        assert_eq!(tree.kind("/apps"), Some(NodeKind::Directory));
        assert_eq!(tree.get("/apps/notes").unwrap().id, "apps/notes");
        let names: Vec<_> = tree.children("/").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["apps", "docs"]);
    }

    #[test]
    fn test_load_only_once() {
        let mut tree = ShadowTree::new(Box::new(source()));
        assert!(tree.load(&manifest(), 0.0).unwrap());
        assert!(!tree.load(&ShadowManifest::default(), 0.0).unwrap());
        assert!(tree.contains("/docs/readme.txt"));
    }

    #[test]
    fn test_file_used_as_directory_rejected() {
        let bad = ShadowManifest::from_json(
            br#"[
                {"id": "a", "name": "a", "type": "file"},
                {"id": "a/b", "name": "b", "type": "file"}
            ]"#,
        )
        .unwrap();
        let mut tree = ShadowTree::new(Box::new(StaticSource::new()));
        assert_eq!(tree.load(&bad, 0.0), Err(SyscallError::InvalidArgument));
        assert!(!tree.is_loaded());
        assert!(!tree.contains("/a"));
    }

    #[test]
    fn test_malformed_manifest_rejected() {
        assert_eq!(
            ShadowManifest::from_json(b"{not json"),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn test_content_is_memoized() {
        let mut tree = ShadowTree::new(Box::new(source()));
        tree.load(&manifest(), 0.0).unwrap();
        let first = tree.content("/shadow/docs/readme.txt").unwrap();
        let second = tree.content("/shadow/docs/readme.txt").unwrap();
        assert_eq!(&*first, b"base");
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_known_size() {
        let mut tree = ShadowTree::new(Box::new(source()));
        tree.load(&manifest(), 0.0).unwrap();
        assert_eq!(tree.known_size("/apps/notes/main.js"), Some(11));
        assert_eq!(tree.known_size("/docs/readme.txt"), None);
        tree.content("/shadow/docs/readme.txt").unwrap();
        assert_eq!(tree.known_size("/docs/readme.txt"), Some(4));
    }

    #[test]
    fn test_deferred_source_reports_pending() {
        let mut tree = ShadowTree::new(Box::new(DeferredSource));
        tree.load(&manifest(), 0.0).unwrap();
        assert_eq!(
            tree.content("/shadow/docs/readme.txt"),
            Err(SyscallError::ContentPending {
                location: "/shadow/docs/readme.txt".into()
            })
        );
        tree.hydrate("/shadow/docs/readme.txt", b"late".to_vec());
        assert_eq!(&*tree.content("/shadow/docs/readme.txt").unwrap(), b"late");
    }

    #[test]
    fn test_file_ancestor_detection() {
        let mut tree = ShadowTree::new(Box::new(source()));
        tree.load(&manifest(), 0.0).unwrap();
        assert!(tree.has_file_ancestor("/docs/readme.txt/x"));
        assert!(!tree.has_file_ancestor("/docs/other.txt"));
    }
}
