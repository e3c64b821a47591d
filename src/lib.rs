//! desktop-kernel - an embedded micro-kernel for a browser desktop
//!
//! Design principles:
//! - Tractable: one message in, one message out, comprehensible by one human
//! - Explicit values: no global kernel, any number of instances can coexist
//! - Two layers: an immutable shadow tree under a mutable overlay
//! - Every failure is an errno; fatal ones stop the kernel
//!
//! Layout:
//! - `protocol`: the fixed-layout binary message format
//! - `kernel`: syscalls, processes, the pty and the message bus
//! - `vfs`: shadow and overlay layers and their merge
//! - `bridge`: the async, serialized surface the desktop calls
//! - `platform`: host services (fetch, sleep, clock) per target

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod bridge;
pub mod config;
pub mod kernel;
pub mod logging;
pub mod platform;
pub mod protocol;
pub mod vfs;

pub use bridge::{BridgeError, HostBridge, Worker};
pub use config::KernelConfig;

/// Initialize panic hook for better error messages in browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Module start: panic hook and console logging. Kernels are created from
/// JS through `WasmKernel`.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    logging::init(log::LevelFilter::Info);
}
