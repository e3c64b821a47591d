//! Virtual File System
//!
//! Two layers make up the visible tree:
//! - `shadow`: the immutable base, built once from a static manifest, with
//!   content fetched lazily from a [`ContentSource`]
//! - `overlay`: the mutable runtime layer holding creates, edits and
//!   tombstones for deleted shadow entries
//!
//! [`LayeredStorage`] resolves paths across both, overlay first.

pub mod layered;
pub mod overlay;
pub mod shadow;

pub use layered::{LayeredStorage, Resolved};
pub use overlay::{NodeId, Overlay, OverlaySnapshot};
#[cfg(not(target_arch = "wasm32"))]
pub use shadow::DirSource;
pub use shadow::{
    ContentSource, DeferredSource, FetchError, ManifestEntry, ManifestKind, ShadowManifest,
    ShadowTree, StaticSource,
};

use crate::kernel::errno::{SyscallError, SyscallResult};
use crate::protocol::MAX_PATH_LEN;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn code(self) -> u32 {
        match self {
            NodeKind::File => 1,
            NodeKind::Directory => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(NodeKind::File),
            2 => Some(NodeKind::Directory),
            _ => None,
        }
    }
}

/// Layer a node currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Shadow,
    Overlay,
}

impl Origin {
    pub fn code(self) -> u32 {
        match self {
            Origin::Shadow => 1,
            Origin::Overlay => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Origin::Shadow),
            2 => Some(Origin::Overlay),
            _ => None,
        }
    }
}

/// File metadata returned by `stat`
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Stable node id: the manifest id for shadow nodes, `ovl-N` for new ones
    pub id: String,
    pub kind: NodeKind,
    pub size: u64,
    /// Creation time in milliseconds since epoch
    pub created: f64,
    /// Modification time in milliseconds since epoch
    pub modified: f64,
    pub origin: Origin,
    /// Overlay content differs from what was copied up
    pub dirty: bool,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Size in bytes, 0 when a shadow file's size is not known yet
    pub size: u64,
    pub origin: Origin,
}

/// Normalize a path (ensure leading slash, resolve . and ..)
///
/// Empty paths are invalid; normalized paths longer than the protocol bound
/// are rejected.
pub fn normalize_path(path: &str) -> SyscallResult<String> {
    if path.is_empty() {
        return Err(SyscallError::InvalidArgument);
    }

    let mut result: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                result.pop();
            }
            name => result.push(name),
        }
    }

    let normalized = if result.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", result.join("/"))
    };
    if normalized.len() > MAX_PATH_LEN {
        return Err(SyscallError::NameTooLong);
    }
    Ok(normalized)
}

/// Split a normalized path into its parent and final component
///
/// Returns `None` for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Join a directory path and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Components of a normalized path, root excluded
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("docs").unwrap(), "/docs");
        assert_eq!(normalize_path("/docs/").unwrap(), "/docs");
        assert_eq!(normalize_path("/docs//a/./b/../c").unwrap(), "/docs/a/c");
        assert_eq!(normalize_path("/..").unwrap(), "/");
        assert_eq!(normalize_path(""), Err(SyscallError::InvalidArgument));
    }

    #[test]
    fn test_normalize_rejects_long_paths() {
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert_eq!(normalize_path(&long), Err(SyscallError::NameTooLong));
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("/"), None);
        assert_eq!(split_path("/a"), Some(("/", "a")));
        assert_eq!(split_path("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_components() {
        let parts: Vec<_> = components("/a/b/c").collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
        assert_eq!(components("/").count(), 0);
    }
}
