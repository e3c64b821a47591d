//! Native host over a directory
//!
//! Serves the same URLs the dev server does: the manifest URL yields a
//! manifest generated from the shadow directory, and `<prefix>/<id>`
//! yields file bytes. Sleeping blocks the thread, which is fine for a
//! single-threaded CLI.

use super::HostServices;
use crate::vfs::{FetchError, ShadowManifest};
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const SHADOW_PREFIX: &str = "/shadow";

#[derive(Debug, Clone)]
pub struct NativeHost {
    root: PathBuf,
    manifest_url: String,
}

impl NativeHost {
    pub fn new(root: impl Into<PathBuf>, manifest_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manifest_url: manifest_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if url == self.manifest_url {
            let manifest = ShadowManifest::scan_dir(&self.root, SHADOW_PREFIX)
                .map_err(|e| FetchError::Failed(e.to_string()))?;
            return manifest
                .to_json()
                .map_err(|e| FetchError::Failed(e.to_string()));
        }

        let rel = url
            .strip_prefix(SHADOW_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or(FetchError::NotFound)?;
        let rel = Path::new(rel);
        // stay inside the shadow directory
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(FetchError::NotFound);
        }
        match std::fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound),
            Err(e) => Err(FetchError::Failed(e.to_string())),
        }
    }
}

impl HostServices for NativeHost {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>, FetchError>> {
        log::debug!("fetch {}", url);
        future::ready(self.load(url)).boxed_local()
    }

    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()> {
        std::thread::sleep(Duration::from_millis(ms as u64));
        future::ready(()).boxed_local()
    }

    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn setup_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("desktop-kernel-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("docs")).unwrap();
        std::fs::write(dir.join("docs/readme.txt"), "base").unwrap();
        dir
    }

    #[test]
    fn test_manifest_from_directory() {
        let dir = setup_dir("manifest");
        let host = NativeHost::new(&dir, "/shadow-manifest.json");
        let bytes = block_on(host.fetch("/shadow-manifest.json")).unwrap();
        let manifest = ShadowManifest::from_json(&bytes).unwrap();
        let ids: Vec<_> = manifest.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["docs", "docs/readme.txt"]);
        assert_eq!(
            manifest.entries[1].content_path.as_deref(),
            Some("/shadow/docs/readme.txt")
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_fetch_content() {
        let dir = setup_dir("content");
        let host = NativeHost::new(&dir, "/shadow-manifest.json");
        assert_eq!(block_on(host.fetch("/shadow/docs/readme.txt")).unwrap(), b"base");
        assert_eq!(block_on(host.fetch("/shadow/missing")), Err(FetchError::NotFound));
        assert_eq!(block_on(host.fetch("/shadow/../etc/passwd")), Err(FetchError::NotFound));
        assert_eq!(block_on(host.fetch("/elsewhere")), Err(FetchError::NotFound));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
