//! Platform Abstraction Layer
//!
//! The kernel never touches the host directly. Everything it needs from
//! the environment goes through [`HostServices`]:
//!
//! - fetching shadow content and the manifest
//! - sleeping between polls of a blocking call
//! - the wall clock
//!
//! Implementations:
//! - Browser (`web`): `fetch`, `setTimeout`, `Date.now`
//! - Native (`native`): a directory on disk, thread sleep
//! - [`StaticHost`]: in-memory, for tests and embedding

#[cfg(target_arch = "wasm32")]
pub mod web;

#[cfg(not(target_arch = "wasm32"))]
pub mod native;

use crate::vfs::FetchError;
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// What the kernel's host provides
pub trait HostServices {
    /// Fetch the bytes behind a URL or content location
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>, FetchError>>;

    /// Resolve after roughly `ms` milliseconds
    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()>;

    /// Milliseconds since epoch
    fn now(&self) -> f64;
}

/// In-memory host
///
/// Content is looked up in a map; sleeping returns immediately and advances
/// a fake clock by the requested duration. Fetches are counted.
#[derive(Debug, Default)]
pub struct StaticHost {
    files: RefCell<HashMap<String, Vec<u8>>>,
    clock: Cell<f64>,
    fetches: Cell<usize>,
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.borrow_mut().insert(url.into(), bytes.into());
    }

    pub fn with(self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(url, bytes);
        self
    }

    pub fn set_clock(&self, now: f64) {
        self.clock.set(now);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.get()
    }
}

impl HostServices for StaticHost {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>, FetchError>> {
        self.fetches.set(self.fetches.get() + 1);
        let result = self
            .files
            .borrow()
            .get(url)
            .cloned()
            .ok_or(FetchError::NotFound);
        future::ready(result).boxed_local()
    }

    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()> {
        self.clock.set(self.clock.get() + ms as f64);
        future::ready(()).boxed_local()
    }

    fn now(&self) -> f64 {
        self.clock.get()
    }
}
