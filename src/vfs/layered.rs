//! Layered (union) storage
//!
//! Resolves paths across the overlay and the shadow layer:
//! - the overlay always takes precedence at a matching path
//! - tombstones and opaque directories hide shadow entries without touching
//!   the shadow tree
//! - every mutation lands in the overlay; shadow files are copied up first
//! - directory listings merge both layers
//!
//! Mutations that can fail do all fallible work before changing anything
//! visible, so a failed call leaves the tree as it was.

use super::overlay::{Content, Lookup, OverlayKind, OverlayNode, Slot};
use super::{
    ContentSource, DirEntry, Metadata, NodeId, NodeKind, Origin, Overlay, OverlaySnapshot,
    ShadowManifest, ShadowTree, join_path, normalize_path, split_path,
};
use crate::kernel::errno::{SyscallError, SyscallResult};

/// Where a visible path lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Overlay(NodeId),
    /// Normalized path of a shadow node not present in the overlay
    Shadow(String),
}

pub struct LayeredStorage {
    shadow: ShadowTree,
    overlay: Overlay,
    /// Limit on owned overlay bytes; exceeding it is an allocation failure
    quota: Option<u64>,
    now: f64,
}

impl LayeredStorage {
    pub fn new(source: Box<dyn ContentSource>) -> Self {
        Self {
            shadow: ShadowTree::new(source),
            overlay: Overlay::new(0.0),
            quota: None,
            now: 0.0,
        }
    }

    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    /// Set the clock used for timestamps
    pub fn set_clock(&mut self, now: f64) {
        self.now = now;
    }

    pub fn shadow(&self) -> &ShadowTree {
        &self.shadow
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    // ========== LAYER MANAGEMENT ==========

    /// Load the shadow manifest; `false` if one was already loaded
    pub fn load_manifest(&mut self, manifest: &ShadowManifest) -> SyscallResult<bool> {
        self.shadow.load(manifest, self.now)
    }

    pub fn hydrate(&mut self, location: &str, bytes: Vec<u8>) {
        self.shadow.hydrate(location, bytes);
    }

    /// Discard the overlay; the visible tree reverts to the shadow layer
    pub fn force_reload(&mut self) {
        log::warn!(
            "force reload: discarding {} overlay nodes",
            self.overlay.len() - 1
        );
        self.overlay = Overlay::new(self.now);
    }

    pub fn export_overlay(&self) -> SyscallResult<Vec<u8>> {
        self.overlay.snapshot().to_json().map_err(|e| {
            log::error!("overlay export failed: {}", e);
            SyscallError::InvalidArgument
        })
    }

    /// Replace the overlay with a previously exported snapshot
    pub fn import_overlay(&mut self, bytes: &[u8]) -> SyscallResult<()> {
        let snapshot = OverlaySnapshot::from_json(bytes)?;
        let overlay = Overlay::restore(&snapshot)?;
        log::info!("overlay imported: {} nodes", overlay.len() - 1);
        self.overlay = overlay;
        Ok(())
    }

    // ========== RESOLUTION ==========

    pub fn resolve(&self, path: &str) -> SyscallResult<Resolved> {
        let path = normalize_path(path)?;
        self.resolve_normalized(&path)
    }

    fn resolve_normalized(&self, path: &str) -> SyscallResult<Resolved> {
        match self.overlay.lookup(path) {
            Lookup::Found(id) => Ok(Resolved::Overlay(id)),
            Lookup::Masked => Err(SyscallError::NotFound),
            Lookup::NotDir => Err(SyscallError::NotADirectory),
            Lookup::Absent => {
                if self.shadow.contains(path) {
                    Ok(Resolved::Shadow(path.to_string()))
                } else if self.shadow.has_file_ancestor(path) {
                    Err(SyscallError::NotADirectory)
                } else {
                    Err(SyscallError::NotFound)
                }
            }
        }
    }

    pub fn kind(&self, resolved: &Resolved) -> NodeKind {
        match resolved {
            Resolved::Overlay(id) => self
                .overlay
                .get(*id)
                .map_or(NodeKind::File, OverlayNode::node_kind),
            Resolved::Shadow(path) => self.shadow.kind(path).unwrap_or(NodeKind::File),
        }
    }

    /// Whether an overlay node is still the live node at some path
    pub fn is_live(&self, id: NodeId, serial: u64) -> bool {
        self.overlay.get(id).is_some_and(|n| n.serial == serial)
    }

    pub fn serial(&self, id: NodeId) -> Option<u64> {
        self.overlay.get(id).map(|n| n.serial)
    }

    /// Stable id of a resolved node
    pub fn node_id(&self, resolved: &Resolved) -> Option<String> {
        match resolved {
            Resolved::Overlay(id) => self.overlay.get(*id).map(|n| n.id.clone()),
            Resolved::Shadow(path) => self.shadow.get(path).map(|n| n.id.clone()),
        }
    }

    pub fn stat(&mut self, path: &str) -> SyscallResult<Metadata> {
        let resolved = self.resolve(path)?;
        self.metadata(&resolved)
    }

    /// Metadata for a resolved node; may fetch shadow content to learn a size
    pub fn metadata(&mut self, resolved: &Resolved) -> SyscallResult<Metadata> {
        match resolved {
            Resolved::Overlay(id) => {
                let node = self.overlay.get(*id).ok_or(SyscallError::NotFound)?;
                let mut meta = Metadata {
                    id: node.id.clone(),
                    kind: node.node_kind(),
                    size: 0,
                    created: node.created,
                    modified: node.modified,
                    origin: Origin::Overlay,
                    dirty: node.dirty,
                };
                match &node.kind {
                    OverlayKind::File(Content::Bytes(data)) => meta.size = data.len() as u64,
                    OverlayKind::File(Content::Shadow { location, .. }) => {
                        let location = location.clone();
                        meta.size = self.shadow.content(&location)?.len() as u64;
                    }
                    OverlayKind::Directory { .. } => {}
                }
                Ok(meta)
            }
            Resolved::Shadow(path) => {
                let node = self.shadow.get(path).ok_or(SyscallError::NotFound)?;
                let mut meta = Metadata {
                    id: node.id.clone(),
                    kind: node.kind,
                    size: 0,
                    created: self.shadow.loaded_at(),
                    modified: self.shadow.loaded_at(),
                    origin: Origin::Shadow,
                    dirty: false,
                };
                if node.kind == NodeKind::File {
                    meta.size = match self.shadow.known_size(path) {
                        Some(size) => size,
                        None => {
                            let location = node.location.clone().ok_or(SyscallError::NotFound)?;
                            self.shadow.content(&location)?.len() as u64
                        }
                    };
                }
                Ok(meta)
            }
        }
    }

    /// Merged, name-ordered listing of a directory
    pub fn read_dir(&self, path: &str) -> SyscallResult<Vec<DirEntry>> {
        let path = normalize_path(path)?;
        let resolved = self.resolve_normalized(&path)?;
        self.list(&path, &resolved)
    }

    fn list(&self, path: &str, resolved: &Resolved) -> SyscallResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let overlay_children = match resolved {
            Resolved::Overlay(id) => {
                let node = self.overlay.get(*id).ok_or(SyscallError::NotFound)?;
                let children = node.children().ok_or(SyscallError::NotADirectory)?;
                for slot in children.values() {
                    if let Slot::Node(child) = slot {
                        entries.extend(self.overlay_entry(*child));
                    }
                }
                Some(children)
            }
            Resolved::Shadow(p) => {
                if self.shadow.kind(p) != Some(NodeKind::Directory) {
                    return Err(SyscallError::NotADirectory);
                }
                None
            }
        };

        let shadow_visible = self.shadow.kind(path) == Some(NodeKind::Directory)
            && !self.overlay.shadow_hidden(path);
        if shadow_visible {
            for (name, node) in self.shadow.children(path) {
                if overlay_children.is_some_and(|c| c.contains_key(&name)) {
                    continue;
                }
                entries.push(DirEntry {
                    id: node.id.clone(),
                    size: self.shadow.known_size(&join_path(path, &name)).unwrap_or(0),
                    name,
                    kind: node.kind,
                    origin: Origin::Shadow,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn overlay_entry(&self, id: NodeId) -> Option<DirEntry> {
        let node = self.overlay.get(id)?;
        let size = match &node.kind {
            OverlayKind::File(Content::Bytes(data)) => data.len() as u64,
            OverlayKind::File(Content::Shadow { location, size }) => {
                self.shadow.cached_len(location).or(*size).unwrap_or(0)
            }
            OverlayKind::Directory { .. } => 0,
        };
        Some(DirEntry {
            id: node.id.clone(),
            name: node.name.clone(),
            kind: node.node_kind(),
            size,
            origin: Origin::Overlay,
        })
    }

    // ========== CONTENT ==========

    /// Read up to `count` bytes at `offset`; empty at or past end of file
    pub fn read_at(&mut self, resolved: &Resolved, offset: u64, count: usize) -> SyscallResult<Vec<u8>> {
        let location = match resolved {
            Resolved::Overlay(id) => {
                let node = self.overlay.get(*id).ok_or(SyscallError::BadFd)?;
                match &node.kind {
                    OverlayKind::File(Content::Bytes(data)) => {
                        return Ok(slice_at(data, offset, count));
                    }
                    OverlayKind::File(Content::Shadow { location, .. }) => location.clone(),
                    OverlayKind::Directory { .. } => return Err(SyscallError::IsADirectory),
                }
            }
            Resolved::Shadow(path) => {
                let node = self.shadow.get(path).ok_or(SyscallError::NotFound)?;
                if node.kind == NodeKind::Directory {
                    return Err(SyscallError::IsADirectory);
                }
                node.location.clone().ok_or(SyscallError::NotFound)?
            }
        };
        let bytes = self.shadow.content(&location)?;
        Ok(slice_at(&bytes, offset, count))
    }

    /// Current length of a file
    pub fn file_len(&mut self, resolved: &Resolved) -> SyscallResult<u64> {
        self.metadata(resolved).map(|m| m.size)
    }

    /// Write into an overlay file, materializing copied-up content first
    pub fn write_at(&mut self, id: NodeId, offset: u64, bytes: &[u8]) -> SyscallResult<usize> {
        self.materialize(id)?;
        self.overlay.write(id, offset, bytes, self.now, self.quota)
    }

    pub fn truncate(&mut self, id: NodeId) -> SyscallResult<()> {
        self.overlay.truncate(id, self.now)
    }

    fn materialize(&mut self, id: NodeId) -> SyscallResult<()> {
        let location = match self.overlay.get(id).and_then(OverlayNode::content) {
            Some(Content::Shadow { location, .. }) => location.clone(),
            Some(Content::Bytes(_)) => return Ok(()),
            None => return Err(SyscallError::IsADirectory),
        };
        let bytes = self.shadow.content(&location)?;
        self.overlay.materialize(id, &bytes, self.quota)
    }

    // ========== MUTATION ==========

    /// Overlay directory for the visible directory at `path`, mirroring
    /// shadow directories into the overlay as needed
    fn ensure_dir(&mut self, path: &str) -> SyscallResult<NodeId> {
        match self.resolve_normalized(path)? {
            Resolved::Overlay(id) => match self.overlay.get(id) {
                Some(node) if node.is_dir() => Ok(id),
                _ => Err(SyscallError::NotADirectory),
            },
            Resolved::Shadow(p) => {
                let node = self.shadow.get(&p).ok_or(SyscallError::NotFound)?;
                if node.kind != NodeKind::Directory {
                    return Err(SyscallError::NotADirectory);
                }
                let shadow_id = node.id.clone();
                let (parent, name) = split_path(&p).ok_or(SyscallError::InvalidArgument)?;
                let parent_id = self.ensure_dir(parent)?;
                let mirror = OverlayNode::directory(shadow_id, name, false, self.shadow.loaded_at());
                self.overlay.insert(parent_id, mirror)
            }
        }
    }

    /// Create an empty file at an absent path
    pub fn create_file(&mut self, path: &str) -> SyscallResult<NodeId> {
        let path = normalize_path(path)?;
        match self.resolve_normalized(&path) {
            Ok(_) => return Err(SyscallError::AlreadyExists),
            Err(SyscallError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let (parent, name) = split_path(&path).ok_or(SyscallError::IsADirectory)?;
        let parent_id = self.ensure_dir(parent)?;
        let id = self.overlay.alloc_id();
        let node = OverlayNode::file(id, name, Content::Bytes(Vec::new()), self.now);
        let created = self.overlay.insert(parent_id, node)?;
        log::debug!("created {}", path);
        Ok(created)
    }

    pub fn create_dir(&mut self, path: &str) -> SyscallResult<()> {
        let path = normalize_path(path)?;
        match self.resolve_normalized(&path) {
            Ok(_) => return Err(SyscallError::AlreadyExists),
            Err(SyscallError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let (parent, name) = split_path(&path).ok_or(SyscallError::AlreadyExists)?;
        let parent_id = self.ensure_dir(parent)?;
        // Over a masked shadow entry, keep whatever was below it hidden
        let opaque = self.shadow.contains(&path);
        let id = self.overlay.alloc_id();
        self.overlay
            .insert(parent_id, OverlayNode::directory(id, name, opaque, self.now))?;
        log::debug!("created directory {}", path);
        Ok(())
    }

    /// Bring a visible node into the overlay, returning its overlay id
    ///
    /// File content stays a lazy reference to the shadow cache until the
    /// first write.
    pub fn copy_up(&mut self, path: &str) -> SyscallResult<NodeId> {
        let path = normalize_path(path)?;
        match self.resolve_normalized(&path)? {
            Resolved::Overlay(id) => Ok(id),
            Resolved::Shadow(p) => {
                if self.shadow.kind(&p) == Some(NodeKind::Directory) {
                    return self.ensure_dir(&p);
                }
                let (parent, name) = split_path(&p).ok_or(SyscallError::InvalidArgument)?;
                let parent_id = self.ensure_dir(parent)?;
                let node = self.shadow_file_node(&p, name)?;
                log::debug!("copy-up {}", p);
                self.overlay.insert(parent_id, node)
            }
        }
    }

    /// Overlay node a shadow file was copied up to, following renames
    ///
    /// `None` while the file is untouched at its shadow path, and after it
    /// was unlinked.
    pub fn follow_shadow(&self, path: &str) -> Option<NodeId> {
        let node = self.shadow.get(path)?;
        if node.kind != NodeKind::File {
            return None;
        }
        self.overlay.find_file(&node.id)
    }

    /// Current absolute path of an attached overlay node
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        self.overlay.path_of(id)
    }

    /// Detached overlay copy of a shadow file that is no longer visible at
    /// its path, for a descriptor that keeps writing to it
    pub fn detached_copy(&mut self, path: &str) -> SyscallResult<NodeId> {
        let name = split_path(path).map_or("", |(_, name)| name);
        let node = self.shadow_file_node(path, name)?;
        Ok(self.overlay.alloc(node))
    }

    fn shadow_file_node(&self, path: &str, name: &str) -> SyscallResult<OverlayNode> {
        let node = self.shadow.get(path).ok_or(SyscallError::NotFound)?;
        let location = node.location.clone().ok_or(SyscallError::NotFound)?;
        let content = Content::Shadow {
            location,
            size: self.shadow.known_size(path),
        };
        Ok(OverlayNode::file(
            node.id.clone(),
            name,
            content,
            self.shadow.loaded_at(),
        ))
    }

    /// Remove a file; returns the detached overlay node, if any, so the
    /// caller can free it once no descriptor refers to it
    pub fn remove_file(&mut self, path: &str) -> SyscallResult<Option<NodeId>> {
        let path = normalize_path(path)?;
        let resolved = self.resolve_normalized(&path)?;
        if self.kind(&resolved) == NodeKind::Directory {
            return Err(SyscallError::IsADirectory);
        }
        let detached = self.unlink_resolved(&path, &resolved)?;
        log::debug!("unlinked {}", path);
        Ok(detached)
    }

    pub fn remove_dir(&mut self, path: &str) -> SyscallResult<()> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(SyscallError::InvalidArgument);
        }
        let resolved = self.resolve_normalized(&path)?;
        if self.kind(&resolved) != NodeKind::Directory {
            return Err(SyscallError::NotADirectory);
        }
        if !self.list(&path, &resolved)?.is_empty() {
            return Err(SyscallError::NotEmpty);
        }
        if let Some(id) = self.unlink_resolved(&path, &resolved)? {
            self.overlay.free(id);
        }
        log::debug!("removed directory {}", path);
        Ok(())
    }

    fn unlink_resolved(&mut self, path: &str, resolved: &Resolved) -> SyscallResult<Option<NodeId>> {
        let (parent, name) = split_path(path).ok_or(SyscallError::InvalidArgument)?;
        let parent_id = self.ensure_dir(parent)?;
        match resolved {
            Resolved::Overlay(_) => {
                let whiteout = self.shadow.contains(path);
                Ok(self.overlay.detach(parent_id, name, whiteout))
            }
            Resolved::Shadow(_) => {
                self.overlay.whiteout(parent_id, name);
                Ok(None)
            }
        }
    }

    /// Atomically move `from` to `to`
    ///
    /// Returns a replaced file's detached overlay node, if any.
    pub fn rename(&mut self, from: &str, to: &str) -> SyscallResult<Option<NodeId>> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        if from == "/" || to == "/" {
            return Err(SyscallError::InvalidArgument);
        }

        let source = self.resolve_normalized(&from)?;
        if from == to {
            return Ok(None);
        }
        let source_kind = self.kind(&source);
        if source_kind == NodeKind::Directory && to.starts_with(&format!("{}/", from)) {
            return Err(SyscallError::InvalidArgument);
        }

        let (from_parent, from_name) = split_path(&from).ok_or(SyscallError::InvalidArgument)?;
        let (to_parent, to_name) = split_path(&to).ok_or(SyscallError::InvalidArgument)?;

        let dest_parent = self.resolve_normalized(to_parent)?;
        if self.kind(&dest_parent) != NodeKind::Directory {
            return Err(SyscallError::NotADirectory);
        }

        let target = match self.resolve_normalized(&to) {
            Ok(resolved) => Some(resolved),
            Err(SyscallError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if let Some(target) = &target {
            match (source_kind, self.kind(target)) {
                (NodeKind::File, NodeKind::File) => {}
                (NodeKind::File, NodeKind::Directory) => return Err(SyscallError::IsADirectory),
                (NodeKind::Directory, NodeKind::File) => return Err(SyscallError::NotADirectory),
                (NodeKind::Directory, NodeKind::Directory) => {
                    if !self.list(&to, target)?.is_empty() {
                        return Err(SyscallError::NotEmpty);
                    }
                }
            }
        }

        // Prepare: everything fallible happens here and changes nothing visible
        let from_parent_id = self.ensure_dir(from_parent)?;
        let to_parent_id = self.ensure_dir(to_parent)?;
        let moving = match &source {
            Resolved::Overlay(id) => {
                if source_kind == NodeKind::Directory {
                    self.seal_dir(*id, &from)?;
                }
                *id
            }
            Resolved::Shadow(p) => self.clone_shadow(p, from_name)?,
        };

        // Commit
        match &source {
            Resolved::Overlay(_) => {
                let whiteout = self.shadow.contains(&from);
                self.overlay.detach(from_parent_id, from_name, whiteout);
            }
            Resolved::Shadow(_) => self.overlay.whiteout(from_parent_id, from_name),
        }
        let replaced = match target {
            Some(Resolved::Overlay(_)) => self.overlay.detach(to_parent_id, to_name, false),
            _ => None,
        };
        self.overlay.attach(to_parent_id, to_name, moving);
        log::debug!("renamed {} -> {}", from, to);

        match replaced {
            Some(id) if self.overlay.get(id).is_some_and(OverlayNode::is_dir) => {
                self.overlay.free(id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Copy every visible shadow child below an overlay directory into the
    /// overlay and mark it opaque, so its contents no longer depend on its path
    fn seal_dir(&mut self, id: NodeId, path: &str) -> SyscallResult<()> {
        if self.overlay.shadow_hidden(path) {
            self.overlay.set_opaque(id);
            return Ok(());
        }

        let existing: Vec<(String, Slot)> = self
            .overlay
            .get(id)
            .and_then(OverlayNode::children)
            .map(|c| c.iter().map(|(n, s)| (n.clone(), *s)).collect())
            .unwrap_or_default();
        let missing: Vec<String> = self
            .shadow
            .children(path)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !existing.iter().any(|(n, _)| n == name))
            .collect();

        let mut clones = Vec::with_capacity(missing.len());
        for name in missing {
            match self.clone_shadow(&join_path(path, &name), &name) {
                Ok(child) => clones.push((name, child)),
                Err(e) => {
                    for (_, child) in clones {
                        self.overlay.free(child);
                    }
                    return Err(e);
                }
            }
        }
        for (name, slot) in existing {
            if let Slot::Node(child) = slot {
                if self.overlay.get(child).is_some_and(OverlayNode::is_dir) {
                    if let Err(e) = self.seal_dir(child, &join_path(path, &name)) {
                        for (_, clone) in clones {
                            self.overlay.free(clone);
                        }
                        return Err(e);
                    }
                }
            }
        }
        for (name, child) in clones {
            self.overlay.attach(id, &name, child);
        }
        self.overlay.set_opaque(id);
        Ok(())
    }

    /// Detached overlay copy of a shadow subtree; file bytes stay lazy
    fn clone_shadow(&mut self, path: &str, name: &str) -> SyscallResult<NodeId> {
        let node = self.shadow.get(path).ok_or(SyscallError::NotFound)?;
        if node.kind == NodeKind::File {
            let file = self.shadow_file_node(path, name)?;
            return Ok(self.overlay.alloc(file));
        }

        let dir = OverlayNode::directory(node.id.clone(), name, true, self.shadow.loaded_at());
        let id = self.overlay.alloc(dir);
        let children: Vec<String> = self
            .shadow
            .children(path)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        for child_name in children {
            match self.clone_shadow(&join_path(path, &child_name), &child_name) {
                Ok(child) => self.overlay.attach(id, &child_name, child),
                Err(e) => {
                    self.overlay.free(id);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Whether an overlay node has been unlinked from the tree
    pub fn is_detached(&self, id: NodeId) -> bool {
        self.overlay.is_detached(id)
    }

    /// Free a detached overlay node
    pub fn release(&mut self, id: NodeId) {
        if self.overlay.is_detached(id) {
            self.overlay.free(id);
        }
    }
}

fn slice_at(data: &[u8], offset: u64, count: usize) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(count).min(data.len());
    data[start..end].to_vec()
}
