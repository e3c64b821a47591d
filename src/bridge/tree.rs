//! Desktop tree view of the filesystem
//!
//! The desktop works with nested `{id, name, type, content?, children?}`
//! items addressed by a folder path (a list of names below the root) plus
//! an item id. These helpers translate that model into bridge calls.
//! Ids of incoming items are ignored; the kernel assigns its own.

use super::{BridgeResult, HostBridge};
use crate::kernel::{OpenFlags, SyscallError};
use crate::vfs::{DirEntry, NodeKind, join_path};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsItem {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FsItem>>,
}

impl FsItem {
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            kind: ItemKind::File,
            content: Some(content.into()),
            children: None,
        }
    }

    pub fn folder(name: impl Into<String>, children: Vec<FsItem>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            kind: ItemKind::Folder,
            content: None,
            children: Some(children),
        }
    }

    pub fn child(&self, name: &str) -> Option<&FsItem> {
        self.children.as_ref()?.iter().find(|c| c.name == name)
    }
}

/// Absolute path of a folder given as segments below the root
pub fn tree_path(segments: &[String]) -> String {
    segments
        .iter()
        .fold(String::from("/"), |path, segment| join_path(&path, segment))
}

fn check_name(name: &str) -> BridgeResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SyscallError::InvalidArgument.into());
    }
    Ok(())
}

impl HostBridge {
    /// The whole visible tree, file contents included
    pub async fn root_item(&self) -> BridgeResult<FsItem> {
        let children = self.load_children("/".to_string()).await?;
        Ok(FsItem {
            id: ROOT_ID.to_string(),
            name: ROOT_ID.to_string(),
            kind: ItemKind::Folder,
            content: None,
            children: Some(children),
        })
    }

    fn load_children(&self, dir: String) -> LocalBoxFuture<'_, BridgeResult<Vec<FsItem>>> {
        async move {
            let mut items = Vec::new();
            for entry in self.read_dir(&dir).await? {
                let path = join_path(&dir, &entry.name);
                let item = match entry.kind {
                    NodeKind::File => {
                        let bytes = self.read_file(&path).await?;
                        FsItem {
                            id: entry.id,
                            name: entry.name,
                            kind: ItemKind::File,
                            content: Some(String::from_utf8_lossy(&bytes).into_owned()),
                            children: None,
                        }
                    }
                    NodeKind::Directory => FsItem {
                        id: entry.id,
                        name: entry.name,
                        kind: ItemKind::Folder,
                        content: None,
                        children: Some(self.load_children(path).await?),
                    },
                };
                items.push(item);
            }
            Ok(items)
        }
        .boxed_local()
    }

    /// Create `items` (recursively) inside the folder at `path`
    pub async fn add_items(&self, path: &[String], items: &[FsItem]) -> BridgeResult<()> {
        self.create_items(tree_path(path), items).await
    }

    fn create_items<'a>(
        &'a self,
        dir: String,
        items: &'a [FsItem],
    ) -> LocalBoxFuture<'a, BridgeResult<()>> {
        async move {
            for item in items {
                check_name(&item.name)?;
                let path = join_path(&dir, &item.name);
                match item.kind {
                    ItemKind::File => {
                        let content = item.content.as_deref().unwrap_or("");
                        self.safe_write(&path, content.as_bytes()).await?;
                    }
                    ItemKind::Folder => {
                        self.mkdir(&path).await?;
                        if let Some(children) = &item.children {
                            self.create_items(path, children).await?;
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed_local()
    }

    pub async fn rename_item(&self, path: &[String], id: &str, new_name: &str) -> BridgeResult<()> {
        check_name(new_name)?;
        let dir = tree_path(path);
        let entry = self.find_entry(&dir, id).await?;
        if entry.name == new_name {
            return Ok(());
        }
        self.rename(&join_path(&dir, &entry.name), &join_path(&dir, new_name))
            .await
    }

    /// Remove an item; folders are removed with everything inside them
    pub async fn delete_item(&self, path: &[String], id: &str) -> BridgeResult<()> {
        let dir = tree_path(path);
        let entry = self.find_entry(&dir, id).await?;
        self.remove_tree(join_path(&dir, &entry.name), entry.kind)
            .await
    }

    fn remove_tree(&self, path: String, kind: NodeKind) -> LocalBoxFuture<'_, BridgeResult<()>> {
        async move {
            if kind == NodeKind::File {
                return self.unlink(&path).await;
            }
            for child in self.read_dir(&path).await? {
                self.remove_tree(join_path(&path, &child.name), child.kind)
                    .await?;
            }
            self.rmdir(&path).await
        }
        .boxed_local()
    }

    pub async fn move_item(&self, from_path: &[String], id: &str, to_path: &[String]) -> BridgeResult<()> {
        let from = tree_path(from_path);
        let to = tree_path(to_path);
        let entry = self.find_entry(&from, id).await?;
        if from == to {
            return Ok(());
        }
        self.rename(&join_path(&from, &entry.name), &join_path(&to, &entry.name))
            .await
    }

    /// Replace a file's content in place; the item keeps its id
    pub async fn update_file_content(&self, path: &[String], id: &str, content: &str) -> BridgeResult<()> {
        let dir = tree_path(path);
        let entry = self.find_entry(&dir, id).await?;
        if entry.kind != NodeKind::File {
            return Err(SyscallError::IsADirectory.into());
        }
        let flags = OpenFlags(OpenFlags::O_WRONLY | OpenFlags::O_TRUNC);
        let fd = self.open(&join_path(&dir, &entry.name), flags).await?;
        let written = self.write_all(fd, content.as_bytes()).await;
        let closed = self.close(fd).await;
        written.and(closed)
    }

    async fn find_entry(&self, dir: &str, id: &str) -> BridgeResult<DirEntry> {
        self.read_dir(dir)
            .await?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| SyscallError::NotFound.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeError;
    use crate::config::KernelConfig;
    use crate::platform::StaticHost;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::rc::Rc;

    const MANIFEST: &str = r#"[
        {"id":"docs","name":"docs","type":"folder"},
        {"id":"docs/readme.txt","name":"readme.txt","type":"file","contentPath":"/shadow/docs/readme.txt"}
    ]"#;

    fn setup_bridge(pool: &LocalPool) -> HostBridge {
        let host = StaticHost::new()
            .with("/shadow-manifest.json", MANIFEST)
            .with("/shadow/docs/readme.txt", "base");
        let (bridge, worker) = HostBridge::new(KernelConfig::default(), Rc::new(host));
        pool.spawner().spawn_local(worker.run()).unwrap();
        bridge
    }

    fn segments(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tree_path() {
        assert_eq!(tree_path(&[]), "/");
        assert_eq!(tree_path(&segments(&["a", "b"])), "/a/b");
    }

    #[test]
    fn test_item_json_shape() {
        let item: FsItem =
            serde_json::from_str(r#"{"id":"x","name":"a.txt","type":"file","content":"hi"}"#).unwrap();
        assert_eq!(item.kind, ItemKind::File);
        assert_eq!(item.content.as_deref(), Some("hi"));
        let json = serde_json::to_string(&FsItem::folder("f", vec![])).unwrap();
        assert_eq!(json, r#"{"id":"","name":"f","type":"folder","children":[]}"#);
    }

    #[test]
    fn test_root_item_reflects_shadow() {
        let mut pool = LocalPool::new();
        let bridge = setup_bridge(&pool);

        pool.run_until(async {
            bridge.initialize_once().await.unwrap();
            let root = bridge.root_item().await.unwrap();
            assert_eq!(root.id, ROOT_ID);
            let docs = root.child("docs").unwrap();
            assert_eq!(docs.id, "docs");
            let readme = docs.child("readme.txt").unwrap();
            assert_eq!(readme.id, "docs/readme.txt");
            assert_eq!(readme.content.as_deref(), Some("base"));
        });
    }

    #[test]
    fn test_add_and_delete_items() {
        let mut pool = LocalPool::new();
        let bridge = setup_bridge(&pool);

        pool.run_until(async {
            let project = FsItem::folder(
                "project",
                vec![
                    FsItem::file("main.rs", "fn main() {}"),
                    FsItem::folder("src", vec![FsItem::file("lib.rs", "")]),
                ],
            );
            bridge.add_items(&[], &[project]).await.unwrap();
            assert_eq!(bridge.read_file("/project/main.rs").await.unwrap(), b"fn main() {}");
            assert!(bridge.stat("/project/src/lib.rs").await.unwrap().is_file());

            let root = bridge.root_item().await.unwrap();
            let id = root.child("project").unwrap().id.clone();
            bridge.delete_item(&[], &id).await.unwrap();
            assert!(bridge.stat("/project").await.is_err());
        });
    }

    #[test]
    fn test_rename_move_and_update() {
        let mut pool = LocalPool::new();
        let bridge = setup_bridge(&pool);

        pool.run_until(async {
            bridge.initialize_once().await.unwrap();
            bridge
                .add_items(&[], &[FsItem::folder("archive", vec![])])
                .await
                .unwrap();
            let docs = segments(&["docs"]);

            bridge
                .update_file_content(&docs, "docs/readme.txt", "edited")
                .await
                .unwrap();
            assert_eq!(bridge.read_file("/docs/readme.txt").await.unwrap(), b"edited");

            let id = bridge.stat("/docs/readme.txt").await.unwrap().id;
            assert_eq!(id, "docs/readme.txt");
            bridge.rename_item(&docs, &id, "notes.txt").await.unwrap();
            bridge
                .move_item(&docs, &id, &segments(&["archive"]))
                .await
                .unwrap();
            assert_eq!(bridge.read_file("/archive/notes.txt").await.unwrap(), b"edited");
            assert!(bridge.stat("/docs/readme.txt").await.is_err());
        });
    }

    #[test]
    fn test_repeated_updates_keep_the_id() {
        let mut pool = LocalPool::new();
        let bridge = setup_bridge(&pool);

        pool.run_until(async {
            bridge
                .add_items(&[], &[FsItem::file("todo.txt", "one")])
                .await
                .unwrap();
            let id = bridge.stat("/todo.txt").await.unwrap().id;

            bridge.update_file_content(&[], &id, "two, longer").await.unwrap();
            bridge.update_file_content(&[], &id, "3").await.unwrap();
            assert_eq!(bridge.stat("/todo.txt").await.unwrap().id, id);
            assert_eq!(bridge.read_file("/todo.txt").await.unwrap(), b"3");
            assert_eq!(
                bridge.update_file_content(&[], "ovl-missing", "x").await,
                Err(BridgeError::Syscall(SyscallError::NotFound))
            );
        });
    }

    #[test]
    fn test_unknown_id() {
        let mut pool = LocalPool::new();
        let bridge = setup_bridge(&pool);

        pool.run_until(async {
            assert_eq!(
                bridge.delete_item(&[], "nope").await,
                Err(BridgeError::Syscall(SyscallError::NotFound))
            );
            assert_eq!(
                bridge.rename_item(&[], "nope", "a/b").await,
                Err(BridgeError::Syscall(SyscallError::InvalidArgument))
            );
        });
    }
}
