//! Overlay layer
//!
//! An arena of nodes rooted at `/`. Directories map child names to slots;
//! a slot is either a node or a tombstone that masks the shadow entry of the
//! same name. An opaque directory hides every shadow entry below it.
//!
//! File content is either owned bytes or a lazy reference to shadow content
//! that was copied up but not yet modified.

use super::{NodeKind, components};
use crate::kernel::errno::{SyscallError, SyscallResult};
use serde::{Deserialize, Serialize};
use slab::Slab;
use std::collections::BTreeMap;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Bytes(Vec<u8>),
    /// Copied up from the shadow layer; bytes still live in the shadow cache
    Shadow { location: String, size: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Node(NodeId),
    Whiteout,
}

#[derive(Debug)]
pub enum OverlayKind {
    File(Content),
    Directory {
        children: BTreeMap<String, Slot>,
        opaque: bool,
    },
}

#[derive(Debug)]
pub struct OverlayNode {
    pub id: String,
    pub name: String,
    pub kind: OverlayKind,
    pub created: f64,
    pub modified: f64,
    pub dirty: bool,
    /// `None` once detached from the tree (and for the root)
    pub parent: Option<NodeId>,
    /// Distinguishes this node from later nodes reusing the same arena slot
    pub serial: u64,
}

impl OverlayNode {
    pub fn file(id: String, name: &str, content: Content, now: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: OverlayKind::File(content),
            created: now,
            modified: now,
            dirty: false,
            parent: None,
            serial: 0,
        }
    }

    pub fn directory(id: String, name: &str, opaque: bool, now: f64) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: OverlayKind::Directory {
                children: BTreeMap::new(),
                opaque,
            },
            created: now,
            modified: now,
            dirty: false,
            parent: None,
            serial: 0,
        }
    }

    pub fn node_kind(&self) -> NodeKind {
        match self.kind {
            OverlayKind::File(_) => NodeKind::File,
            OverlayKind::Directory { .. } => NodeKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_kind() == NodeKind::Directory
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Slot>> {
        match &self.kind {
            OverlayKind::Directory { children, .. } => Some(children),
            OverlayKind::File(_) => None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.kind, OverlayKind::Directory { opaque: true, .. })
    }

    pub fn content(&self) -> Option<&Content> {
        match &self.kind {
            OverlayKind::File(content) => Some(content),
            OverlayKind::Directory { .. } => None,
        }
    }
}

/// Outcome of walking a path through the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(NodeId),
    /// Hidden by a tombstone or an opaque directory
    Masked,
    /// A file sits where a directory was needed
    NotDir,
    /// Nothing in the overlay; the shadow layer decides
    Absent,
}

pub struct Overlay {
    nodes: Slab<OverlayNode>,
    root: NodeId,
    next_id: u64,
    next_serial: u64,
    stored: u64,
}

impl Overlay {
    pub fn new(now: f64) -> Self {
        let mut nodes = Slab::new();
        let root = nodes.insert(OverlayNode::directory(
            super::shadow::ROOT_ID.to_string(),
            "",
            false,
            now,
        ));
        Self {
            nodes,
            root,
            next_id: 1,
            next_serial: 1,
            stored: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&OverlayNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut OverlayNode> {
        self.nodes.get_mut(id)
    }

    /// Bytes of owned file content held by the overlay
    pub fn stored_bytes(&self) -> u64 {
        self.stored
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Generate an id for a node created at runtime
    pub fn alloc_id(&mut self) -> String {
        let id = format!("ovl-{}", self.next_id);
        self.next_id += 1;
        id
    }

    pub fn lookup(&self, path: &str) -> Lookup {
        let mut current = self.root;
        let mut hidden = false;
        for name in components(path) {
            let Some(node) = self.nodes.get(current) else {
                return Lookup::Absent;
            };
            match &node.kind {
                OverlayKind::Directory { children, opaque } => {
                    hidden |= *opaque;
                    match children.get(name) {
                        Some(Slot::Node(id)) => current = *id,
                        Some(Slot::Whiteout) => return Lookup::Masked,
                        None if hidden => return Lookup::Masked,
                        None => return Lookup::Absent,
                    }
                }
                OverlayKind::File(_) => return Lookup::NotDir,
            }
        }
        Lookup::Found(current)
    }

    /// Whether a path is hidden from the shadow layer by an opaque ancestor
    /// or a tombstone, without being present in the overlay
    pub fn masks(&self, path: &str) -> bool {
        self.lookup(path) == Lookup::Masked
    }

    /// Whether shadow entries directly below the overlay directory at `path`
    /// are hidden, because it or one of its ancestors is opaque
    pub fn shadow_hidden(&self, path: &str) -> bool {
        let mut current = self.root;
        let mut hidden = self.nodes.get(current).is_some_and(OverlayNode::is_opaque);
        for name in components(path) {
            let next = self
                .nodes
                .get(current)
                .and_then(OverlayNode::children)
                .and_then(|children| children.get(name));
            match next {
                Some(Slot::Node(id)) => current = *id,
                _ => return hidden,
            }
            hidden |= self.nodes.get(current).is_some_and(OverlayNode::is_opaque);
        }
        hidden
    }

    /// Link a new node under `parent`, replacing any slot of the same name
    pub fn insert(&mut self, parent: NodeId, node: OverlayNode) -> SyscallResult<NodeId> {
        match self.nodes.get(parent).map(OverlayNode::is_dir) {
            Some(true) => {}
            Some(false) => return Err(SyscallError::NotADirectory),
            None => return Err(SyscallError::NotFound),
        }
        let name = node.name.clone();
        let id = self.alloc(node);
        self.attach(parent, &name, id);
        Ok(id)
    }

    /// Allocate a node without linking it into the tree
    pub fn alloc(&mut self, mut node: OverlayNode) -> NodeId {
        node.parent = None;
        node.serial = self.next_serial;
        self.next_serial += 1;
        if let OverlayKind::File(Content::Bytes(data)) = &node.kind {
            self.stored += data.len() as u64;
        }
        self.nodes.insert(node)
    }

    /// Link an already allocated, detached node under `parent` as `name`
    pub fn attach(&mut self, parent: NodeId, name: &str, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = Some(parent);
            node.name = name.to_string();
        }
        self.set_slot(parent, name, Slot::Node(id));
    }

    /// Unlink `name` from `parent`, optionally leaving a tombstone
    ///
    /// The node itself stays allocated until [`Overlay::free`].
    pub fn detach(&mut self, parent: NodeId, name: &str, whiteout: bool) -> Option<NodeId> {
        let slot = match self.nodes.get_mut(parent).map(|n| &mut n.kind) {
            Some(OverlayKind::Directory { children, .. }) => {
                let slot = children.remove(name);
                if whiteout {
                    children.insert(name.to_string(), Slot::Whiteout);
                }
                slot
            }
            _ => None,
        };
        match slot {
            Some(Slot::Node(id)) => {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.parent = None;
                }
                Some(id)
            }
            _ => None,
        }
    }

    /// Mask `name` under `parent`
    pub fn whiteout(&mut self, parent: NodeId, name: &str) {
        self.set_slot(parent, name, Slot::Whiteout);
    }

    fn set_slot(&mut self, parent: NodeId, name: &str, slot: Slot) {
        if let Some(OverlayKind::Directory { children, .. }) =
            self.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            children.insert(name.to_string(), slot);
        }
    }

    pub fn set_opaque(&mut self, id: NodeId) {
        if let Some(OverlayKind::Directory { opaque, .. }) =
            self.nodes.get_mut(id).map(|n| &mut n.kind)
        {
            *opaque = true;
        }
    }

    pub fn is_detached(&self, id: NodeId) -> bool {
        id != self.root && self.nodes.get(id).is_some_and(|n| n.parent.is_none())
    }

    /// Whether a node is reachable from the root
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == self.root {
                return true;
            }
            match self.nodes.get(current).and_then(|n| n.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// The attached file node carrying a stable id, wherever it now lives
    pub fn find_file(&self, id: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(slot, node)| node.id == id && !node.is_dir() && self.is_attached(*slot))
            .map(|(slot, _)| slot)
    }

    /// Absolute path of an attached node
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != self.root {
            let node = self.nodes.get(current)?;
            names.push(node.name.as_str());
            current = node.parent?;
        }
        if names.is_empty() {
            return Some("/".to_string());
        }
        Some(names.iter().rev().fold(String::new(), |mut path, name| {
            path.push('/');
            path.push_str(name);
            path
        }))
    }

    /// Release a node and everything below it
    pub fn free(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let Some(node) = self.nodes.try_remove(id) else {
            return;
        };
        match node.kind {
            OverlayKind::File(Content::Bytes(data)) => {
                self.stored = self.stored.saturating_sub(data.len() as u64);
            }
            OverlayKind::File(Content::Shadow { .. }) => {}
            OverlayKind::Directory { children, .. } => {
                for slot in children.into_values() {
                    if let Slot::Node(child) = slot {
                        self.free(child);
                    }
                }
            }
        }
    }

    /// Replace lazily referenced shadow content with owned bytes
    pub fn materialize(&mut self, id: NodeId, bytes: &[u8], quota: Option<u64>) -> SyscallResult<()> {
        let stored = self.stored;
        let node = self.nodes.get_mut(id).ok_or(SyscallError::BadFd)?;
        let OverlayKind::File(content) = &mut node.kind else {
            return Err(SyscallError::IsADirectory);
        };
        if matches!(content, Content::Bytes(_)) {
            return Ok(());
        }
        check_quota(stored, bytes.len() as u64, quota)?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| SyscallError::OutOfMemory)?;
        data.extend_from_slice(bytes);
        *content = Content::Bytes(data);
        self.stored += bytes.len() as u64;
        Ok(())
    }

    /// Write `bytes` at `offset`, zero-filling any gap
    ///
    /// Capacity is reserved before anything is copied, so a failed write
    /// leaves the file untouched.
    pub fn write(
        &mut self,
        id: NodeId,
        offset: u64,
        bytes: &[u8],
        now: f64,
        quota: Option<u64>,
    ) -> SyscallResult<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let stored = self.stored;
        let node = self.nodes.get_mut(id).ok_or(SyscallError::BadFd)?;
        let data = match &mut node.kind {
            OverlayKind::File(Content::Bytes(data)) => data,
            OverlayKind::File(Content::Shadow { .. }) => return Err(SyscallError::InvalidArgument),
            OverlayKind::Directory { .. } => return Err(SyscallError::IsADirectory),
        };

        let offset = usize::try_from(offset).map_err(|_| SyscallError::InvalidArgument)?;
        let end = offset
            .checked_add(bytes.len())
            .ok_or(SyscallError::InvalidArgument)?;
        let grow = end.saturating_sub(data.len());
        check_quota(stored, grow as u64, quota)?;
        data.try_reserve(grow)
            .map_err(|_| SyscallError::OutOfMemory)?;

        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
        node.modified = now;
        node.dirty = true;
        self.stored += grow as u64;
        Ok(bytes.len())
    }

    pub fn truncate(&mut self, id: NodeId, now: f64) -> SyscallResult<()> {
        let node = self.nodes.get_mut(id).ok_or(SyscallError::BadFd)?;
        let OverlayKind::File(content) = &mut node.kind else {
            return Err(SyscallError::IsADirectory);
        };
        let released = match content {
            Content::Bytes(data) => data.len() as u64,
            Content::Shadow { .. } => 0,
        };
        *content = Content::Bytes(Vec::new());
        node.modified = now;
        node.dirty = true;
        self.stored = self.stored.saturating_sub(released);
        Ok(())
    }

    // ========== SNAPSHOTS ==========

    /// Serializable copy of the attached tree
    pub fn snapshot(&self) -> OverlaySnapshot {
        OverlaySnapshot {
            next_id: self.next_id,
            root: self.snapshot_node(self.root),
        }
    }

    fn snapshot_node(&self, id: NodeId) -> SnapshotNode {
        let node = &self.nodes[id];
        let kind = match &node.kind {
            OverlayKind::File(content) => SnapshotKind::File {
                content: content.clone(),
            },
            OverlayKind::Directory { children, opaque } => SnapshotKind::Directory {
                opaque: *opaque,
                entries: children
                    .iter()
                    .map(|(name, slot)| match slot {
                        Slot::Node(child) => SnapshotEntry::Node(self.snapshot_node(*child)),
                        Slot::Whiteout => SnapshotEntry::Whiteout(name.clone()),
                    })
                    .collect(),
            },
        };
        SnapshotNode {
            id: node.id.clone(),
            name: node.name.clone(),
            created: node.created,
            modified: node.modified,
            dirty: node.dirty,
            kind,
        }
    }

    /// Rebuild an overlay from a snapshot
    pub fn restore(snapshot: &OverlaySnapshot) -> SyscallResult<Self> {
        let SnapshotKind::Directory { opaque, entries } = &snapshot.root.kind else {
            return Err(SyscallError::InvalidArgument);
        };
        let mut overlay = Overlay::new(snapshot.root.created);
        overlay.next_id = snapshot.next_id;
        if *opaque {
            overlay.set_opaque(overlay.root);
        }
        let root = overlay.root;
        overlay.restore_entries(root, entries)?;
        Ok(overlay)
    }

    fn restore_entries(&mut self, parent: NodeId, entries: &[SnapshotEntry]) -> SyscallResult<()> {
        for entry in entries {
            match entry {
                SnapshotEntry::Whiteout(name) => {
                    validate_name(name)?;
                    self.whiteout(parent, name);
                }
                SnapshotEntry::Node(snap) => {
                    validate_name(&snap.name)?;
                    let mut node = match &snap.kind {
                        SnapshotKind::File { content } => OverlayNode::file(
                            snap.id.clone(),
                            &snap.name,
                            content.clone(),
                            snap.created,
                        ),
                        SnapshotKind::Directory { opaque, .. } => {
                            OverlayNode::directory(snap.id.clone(), &snap.name, *opaque, snap.created)
                        }
                    };
                    node.modified = snap.modified;
                    node.dirty = snap.dirty;
                    let id = self.insert(parent, node)?;
                    if let SnapshotKind::Directory { entries, .. } = &snap.kind {
                        self.restore_entries(id, entries)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_quota(stored: u64, grow: u64, quota: Option<u64>) -> SyscallResult<()> {
    match quota {
        Some(limit) if stored.saturating_add(grow) > limit => {
            log::error!(
                "overlay quota exhausted: {} stored, {} requested, limit {}",
                stored,
                grow,
                limit
            );
            Err(SyscallError::OutOfMemory)
        }
        _ => Ok(()),
    }
}

fn validate_name(name: &str) -> SyscallResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(())
}

/// JSON form of the overlay tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub next_id: u64,
    pub root: SnapshotNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    pub created: f64,
    pub modified: f64,
    pub dirty: bool,
    pub kind: SnapshotKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotKind {
    File { content: Content },
    Directory { opaque: bool, entries: Vec<SnapshotEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotEntry {
    Node(SnapshotNode),
    Whiteout(String),
}

impl OverlaySnapshot {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> SyscallResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            log::debug!("rejecting overlay snapshot: {}", e);
            SyscallError::InvalidArgument
        })
    }
}
