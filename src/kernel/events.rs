//! Filesystem change events
//!
//! Every successful mutation queues an event. The host drains the queue
//! after each call and hands the events to its subscribers, so a desktop
//! can refresh views without polling.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Events kept between drains before the queue collapses
pub const MAX_PENDING_EVENTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsEventKind {
    /// File content changed
    #[serde(rename = "FS_WRITE")]
    Write,
    #[serde(rename = "FS_RENAME")]
    Rename,
    #[serde(rename = "FS_DELETE")]
    Delete,
    /// Something at or below `path` changed
    #[serde(rename = "FS_CHANGED")]
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    #[serde(rename = "type")]
    pub kind: FsEventKind,
    pub path: String,
    /// Destination of a rename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Position in the kernel's event stream
    pub seq: u64,
}

impl FsEvent {
    fn same_change(&self, kind: FsEventKind, path: &str, to: Option<&str>) -> bool {
        self.kind == kind && self.path == path && self.to.as_deref() == to
    }
}

/// Pending events, oldest first
///
/// Repeats of the newest event are dropped. When the queue is full it is
/// replaced by a single `FS_CHANGED` for `/` that stands for everything
/// until the next drain.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<FsEvent>,
    next_seq: u64,
    collapsed: bool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: FsEventKind, path: &str, to: Option<&str>) {
        if self.collapsed {
            return;
        }
        if self
            .queue
            .back()
            .is_some_and(|last| last.same_change(kind, path, to))
        {
            return;
        }
        if self.queue.len() >= MAX_PENDING_EVENTS {
            log::debug!("{} pending fs events, collapsing", self.queue.len());
            self.queue.clear();
            self.collapsed = true;
            self.push_event(FsEventKind::Changed, "/", None);
            return;
        }
        self.push_event(kind, path, to);
    }

    fn push_event(&mut self, kind: FsEventKind, path: &str, to: Option<&str>) {
        self.next_seq += 1;
        self.queue.push_back(FsEvent {
            kind,
            path: path.to_string(),
            to: to.map(str::to_string),
            seq: self.next_seq,
        });
    }

    pub fn write(&mut self, path: &str) {
        self.push(FsEventKind::Write, path, None);
    }

    pub fn changed(&mut self, path: &str) {
        self.push(FsEventKind::Changed, path, None);
    }

    pub fn deleted(&mut self, path: &str) {
        self.push(FsEventKind::Delete, path, None);
    }

    pub fn renamed(&mut self, from: &str, to: &str) {
        self.push(FsEventKind::Rename, from, Some(to));
    }

    /// Take every pending event
    pub fn drain(&mut self) -> Vec<FsEvent> {
        self.collapsed = false;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_queue_fifo() {
        let mut queue = EventQueue::new();
        queue.write("/a");
        queue.renamed("/a", "/b");
        queue.deleted("/b");

        let events = queue.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![FsEventKind::Write, FsEventKind::Rename, FsEventKind::Delete]
        );
        assert_eq!(events[1].to.as_deref(), Some("/b"));
        assert_eq!(events[2].seq, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_repeats_are_coalesced() {
        let mut queue = EventQueue::new();
        queue.write("/log");
        queue.write("/log");
        queue.write("/other");
        queue.write("/log");
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_overflow_collapses_to_root() {
        let mut queue = EventQueue::new();
        for i in 0..=MAX_PENDING_EVENTS {
            queue.write(&format!("/f{}", i));
        }
        queue.deleted("/late");

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FsEventKind::Changed);
        assert_eq!(events[0].path, "/");

        // a drain reopens the queue
        queue.write("/again");
        assert_eq!(queue.drain()[0].path, "/again");
    }

    #[test]
    fn test_event_json_shape() {
        let mut queue = EventQueue::new();
        queue.renamed("/a", "/b");
        queue.changed("/");
        let events = queue.drain();
        assert_eq!(
            serde_json::to_string(&events[0]).unwrap(),
            r#"{"type":"FS_RENAME","path":"/a","to":"/b","seq":1}"#
        );
        assert_eq!(
            serde_json::to_string(&events[1]).unwrap(),
            r#"{"type":"FS_CHANGED","path":"/","seq":2}"#
        );
    }
}
