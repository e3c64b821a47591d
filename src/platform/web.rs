//! Browser Platform Implementation
//!
//! - [`WebHost`]: shadow content via the Fetch API, sleeping via
//!   `setTimeout`, wall clock via `Date.now()`
//! - [`WasmKernel`]: the promise-returning surface exported to JS
//!
//! Errors reach JS as `Error` objects with a numeric `code` property when
//! they carry an errno.

use super::HostServices;
use crate::bridge::{BridgeError, FsItem, HostBridge};
use crate::config::KernelConfig;
use crate::kernel::{ExitStatus, Fd, IoctlRequest, OpenFlags, Pid, ProcessState, SyscallError, TtySide};
use crate::vfs::{DirEntry, FetchError, Metadata};
use futures::StreamExt;
use futures::future::{FutureExt, LocalBoxFuture, abortable};
use js_sys::{Promise, Uint8Array};
use serde::de::DeserializeOwned;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{JsFuture, future_to_promise, spawn_local};

#[derive(Debug, Default)]
pub struct WebHost;

impl WebHost {
    pub fn new() -> Self {
        Self
    }
}

impl HostServices for WebHost {
    fn fetch(&self, url: &str) -> LocalBoxFuture<'static, Result<Vec<u8>, FetchError>> {
        let url = url.to_string();
        async move { fetch_bytes(&url).await }.boxed_local()
    }

    fn sleep(&self, ms: u32) -> LocalBoxFuture<'static, ()> {
        async move {
            let promise = Promise::new(&mut |resolve, _reject| {
                if let Some(window) = web_sys::window() {
                    let _ = window.set_timeout_with_callback_and_timeout_and_arguments_0(
                        &resolve,
                        ms as i32,
                    );
                } else {
                    let _ = resolve.call0(&JsValue::UNDEFINED);
                }
            });
            let _ = JsFuture::from(promise).await;
        }
        .boxed_local()
    }

    fn now(&self) -> f64 {
        js_sys::Date::now()
    }
}

/// GET a URL and return the body
async fn fetch_bytes(url: &str) -> Result<Vec<u8>, FetchError> {
    let window = web_sys::window().ok_or_else(|| FetchError::Failed("no window object".into()))?;

    let resp_value = JsFuture::from(window.fetch_with_str(url))
        .await
        .map_err(|e| FetchError::Failed(format!("{:?}", e)))?;
    let resp: web_sys::Response = resp_value
        .dyn_into()
        .map_err(|_| FetchError::Failed("not a Response".into()))?;

    if resp.status() == 404 {
        return Err(FetchError::NotFound);
    }
    if !resp.ok() {
        return Err(FetchError::Failed(format!("HTTP {} for {}", resp.status(), url)));
    }

    let body = resp
        .array_buffer()
        .map_err(|e| FetchError::Failed(format!("{:?}", e)))?;
    let buffer = JsFuture::from(body)
        .await
        .map_err(|e| FetchError::Failed(format!("{:?}", e)))?;
    Ok(Uint8Array::new(&buffer).to_vec())
}

// ========== JS SURFACE ==========

fn to_js(err: BridgeError) -> JsValue {
    let error = js_sys::Error::new(&err.to_string());
    if let Some(code) = err.errno() {
        let _ = js_sys::Reflect::set(&error, &"code".into(), &JsValue::from(code));
    }
    error.into()
}

fn json_to_js(value: serde_json::Value) -> Result<JsValue, JsValue> {
    js_sys::JSON::parse(&value.to_string())
}

fn from_js<T: DeserializeOwned>(value: &JsValue) -> Result<T, JsValue> {
    let text: String = js_sys::JSON::stringify(value)?.into();
    serde_json::from_str(&text).map_err(|e| js_sys::Error::new(&e.to_string()).into())
}

fn tty_side(side: u32) -> Result<TtySide, JsValue> {
    match side {
        0 => Ok(TtySide::Input),
        1 => Ok(TtySide::Output),
        _ => Err(to_js(SyscallError::InvalidArgument.into())),
    }
}

fn metadata_json(meta: &Metadata) -> serde_json::Value {
    serde_json::json!({
        "id": meta.id,
        "type": if meta.is_dir() { "folder" } else { "file" },
        "size": meta.size,
        "created": meta.created,
        "modified": meta.modified,
        "origin": format!("{:?}", meta.origin).to_lowercase(),
        "dirty": meta.dirty,
    })
}

fn entry_json(entry: &DirEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "name": entry.name,
        "type": if entry.kind == crate::vfs::NodeKind::Directory { "folder" } else { "file" },
        "size": entry.size,
        "origin": format!("{:?}", entry.origin).to_lowercase(),
    })
}

fn status_json(status: ExitStatus) -> serde_json::Value {
    match status {
        ExitStatus::Code(code) => serde_json::json!({ "code": code }),
        ExitStatus::Killed => serde_json::json!({ "killed": true }),
    }
}

/// A kernel instance driven from JS
///
/// Every method returns a promise; calls run one at a time in the order
/// they were made.
#[wasm_bindgen]
pub struct WasmKernel {
    bridge: Rc<HostBridge>,
}

#[wasm_bindgen]
impl WasmKernel {
    /// Create a kernel from an optional JSON configuration
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<WasmKernel, JsValue> {
        let config = match config_json {
            Some(json) => KernelConfig::from_json(json.as_bytes())
                .map_err(|e| JsValue::from(js_sys::Error::new(&e.to_string())))?,
            None => KernelConfig::default(),
        };
        let (bridge, worker) = HostBridge::new(config, Rc::new(WebHost::new()));
        spawn_local(worker.run());
        Ok(Self {
            bridge: Rc::new(bridge),
        })
    }

    #[wasm_bindgen(js_name = isPoisoned)]
    pub fn is_poisoned(&self) -> bool {
        self.bridge.is_poisoned()
    }

    // ===== Files =====

    pub fn open(&self, path: &str, flags: u32) -> Promise {
        let call = self.bridge.open(path, OpenFlags(flags));
        future_to_promise(async move { call.await.map(|fd| JsValue::from(fd.0)).map_err(to_js) })
    }

    pub fn read(&self, fd: u32, count: u32) -> Promise {
        let call = self.bridge.read(Fd(fd), count);
        future_to_promise(async move {
            call.await
                .map(|bytes| Uint8Array::from(bytes.as_slice()).into())
                .map_err(to_js)
        })
    }

    pub fn write(&self, fd: u32, data: &[u8]) -> Promise {
        let call = self.bridge.write(Fd(fd), data);
        future_to_promise(async move { call.await.map(JsValue::from).map_err(to_js) })
    }

    pub fn close(&self, fd: u32) -> Promise {
        let call = self.bridge.close(Fd(fd));
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn stat(&self, path: &str) -> Promise {
        let call = self.bridge.stat(path);
        future_to_promise(async move { json_to_js(metadata_json(&call.await.map_err(to_js)?)) })
    }

    pub fn mkdir(&self, path: &str) -> Promise {
        let call = self.bridge.mkdir(path);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn rmdir(&self, path: &str) -> Promise {
        let call = self.bridge.rmdir(path);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn unlink(&self, path: &str) -> Promise {
        let call = self.bridge.unlink(path);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn rename(&self, from: &str, to: &str) -> Promise {
        let call = self.bridge.rename(from, to);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    #[wasm_bindgen(js_name = readDir)]
    pub fn read_dir(&self, path: &str) -> Promise {
        let call = self.bridge.read_dir(path);
        future_to_promise(async move {
            let entries = call.await.map_err(to_js)?;
            json_to_js(entries.iter().map(entry_json).collect())
        })
    }

    #[wasm_bindgen(js_name = safeWrite)]
    pub fn safe_write(&self, path: String, data: Vec<u8>) -> Promise {
        let bridge = self.bridge.clone();
        future_to_promise(async move {
            bridge
                .safe_write(&path, &data)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        })
    }

    // ===== Processes =====

    pub fn spawn(&self, command: &str, parent: Option<u32>) -> Promise {
        let call = self.bridge.spawn(command, parent.map(Pid));
        future_to_promise(async move { call.await.map(|pid| JsValue::from(pid.0)).map_err(to_js) })
    }

    pub fn kill(&self, pid: u32) -> Promise {
        let call = self.bridge.kill(Pid(pid));
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn wait(&self, pid: u32) -> Promise {
        let call = self.bridge.wait(Pid(pid));
        future_to_promise(async move { json_to_js(status_json(call.await.map_err(to_js)?)) })
    }

    #[wasm_bindgen(js_name = waitBlocking)]
    pub fn wait_blocking(&self, pid: u32) -> Promise {
        let bridge = self.bridge.clone();
        future_to_promise(async move {
            let status = bridge.wait_blocking(Pid(pid)).await.map_err(to_js)?;
            json_to_js(status_json(status))
        })
    }

    pub fn exit(&self, pid: u32, code: i32) -> Promise {
        let call = self.bridge.exit(Pid(pid), code);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    pub fn list(&self) -> Promise {
        let call = self.bridge.list();
        future_to_promise(async move {
            let list = call.await.map_err(to_js)?;
            let list: Vec<_> = list
                .iter()
                .map(|p| {
                    let status = match p.state {
                        ProcessState::Running => serde_json::Value::Null,
                        ProcessState::Exited(status) => status_json(status),
                    };
                    serde_json::json!({
                        "pid": p.pid.0,
                        "ppid": p.ppid,
                        "command": p.command,
                        "running": p.state == ProcessState::Running,
                        "status": status,
                        "fds": p.fds.iter().map(|fd| fd.0).collect::<Vec<u32>>(),
                    })
                })
                .collect();
            json_to_js(list.into())
        })
    }

    // ===== TTY =====

    /// Read from a tty side (0 input, 1 output)
    #[wasm_bindgen(js_name = ttyRead)]
    pub fn tty_read(&self, side: u32, count: u32) -> Result<Promise, JsValue> {
        let call = self.bridge.tty_read(tty_side(side)?, count);
        Ok(future_to_promise(async move {
            call.await
                .map(|bytes| Uint8Array::from(bytes.as_slice()).into())
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = ttyReadBlocking)]
    pub fn tty_read_blocking(&self, side: u32, count: u32) -> Result<Promise, JsValue> {
        let side = tty_side(side)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .tty_read_blocking(side, count)
                .await
                .map(|bytes| Uint8Array::from(bytes.as_slice()).into())
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = ttyWrite)]
    pub fn tty_write(&self, side: u32, data: &[u8]) -> Result<Promise, JsValue> {
        let call = self.bridge.tty_write(tty_side(side)?, data);
        Ok(future_to_promise(async move { call.await.map(JsValue::from).map_err(to_js) }))
    }

    pub fn ioctl(&self, request: u32, arg: &[u8]) -> Result<Promise, JsValue> {
        let request = IoctlRequest::from_u32(request)
            .ok_or_else(|| to_js(SyscallError::InvalidArgument.into()))?;
        let call = self.bridge.ioctl(request, arg);
        Ok(future_to_promise(async move {
            call.await
                .map(|bytes| Uint8Array::from(bytes.as_slice()).into())
                .map_err(to_js)
        }))
    }

    // ===== Layers =====

    #[wasm_bindgen(js_name = initializeOnce)]
    pub fn initialize_once(&self) -> Promise {
        let bridge = self.bridge.clone();
        future_to_promise(async move {
            bridge
                .initialize_once()
                .await
                .map(JsValue::from_bool)
                .map_err(to_js)
        })
    }

    #[wasm_bindgen(js_name = forceReloadFromShadow)]
    pub fn force_reload_from_shadow(&self) -> Promise {
        let call = self.bridge.force_reload_from_shadow();
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    #[wasm_bindgen(js_name = exportOverlay)]
    pub fn export_overlay(&self) -> Promise {
        let call = self.bridge.export_overlay();
        future_to_promise(async move {
            call.await
                .map(|bytes| Uint8Array::from(bytes.as_slice()).into())
                .map_err(to_js)
        })
    }

    #[wasm_bindgen(js_name = importOverlay)]
    pub fn import_overlay(&self, snapshot: &[u8]) -> Promise {
        let call = self.bridge.import_overlay(snapshot);
        future_to_promise(async move { call.await.map(|_| JsValue::UNDEFINED).map_err(to_js) })
    }

    // ===== Desktop tree =====

    #[wasm_bindgen(js_name = rootItem)]
    pub fn root_item(&self) -> Promise {
        let bridge = self.bridge.clone();
        future_to_promise(async move {
            let root = bridge.root_item().await.map_err(to_js)?;
            let value = serde_json::to_value(&root)
                .map_err(|e| JsValue::from(js_sys::Error::new(&e.to_string())))?;
            json_to_js(value)
        })
    }

    #[wasm_bindgen(js_name = addItems)]
    pub fn add_items(&self, path: JsValue, items: JsValue) -> Result<Promise, JsValue> {
        let path: Vec<String> = from_js(&path)?;
        let items: Vec<FsItem> = from_js(&items)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .add_items(&path, &items)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = renameItem)]
    pub fn rename_item(&self, path: JsValue, id: String, new_name: String) -> Result<Promise, JsValue> {
        let path: Vec<String> = from_js(&path)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .rename_item(&path, &id, &new_name)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = deleteItem)]
    pub fn delete_item(&self, path: JsValue, id: String) -> Result<Promise, JsValue> {
        let path: Vec<String> = from_js(&path)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .delete_item(&path, &id)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = moveItem)]
    pub fn move_item(&self, from_path: JsValue, id: String, to_path: JsValue) -> Result<Promise, JsValue> {
        let from_path: Vec<String> = from_js(&from_path)?;
        let to_path: Vec<String> = from_js(&to_path)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .move_item(&from_path, &id, &to_path)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        }))
    }

    #[wasm_bindgen(js_name = updateFileContent)]
    pub fn update_file_content(&self, path: JsValue, id: String, content: String) -> Result<Promise, JsValue> {
        let path: Vec<String> = from_js(&path)?;
        let bridge = self.bridge.clone();
        Ok(future_to_promise(async move {
            bridge
                .update_file_content(&path, &id, &content)
                .await
                .map(|_| JsValue::UNDEFINED)
                .map_err(to_js)
        }))
    }

    /// Call `callback` with every filesystem change event
    ///
    /// Events look like `{type: "FS_WRITE", path, seq}`; renames add `to`.
    /// Returns a function that unsubscribes.
    #[wasm_bindgen(js_name = onFileSystemEvent)]
    pub fn on_file_system_event(&self, callback: js_sys::Function) -> JsValue {
        let mut events = self.bridge.subscribe();
        let (listen, handle) = abortable(async move {
            while let Some(event) = events.next().await {
                let value = match serde_json::to_value(&event).map(json_to_js) {
                    Ok(Ok(value)) => value,
                    _ => continue,
                };
                if let Err(e) = callback.call1(&JsValue::NULL, &value) {
                    log::warn!("filesystem event listener threw: {:?}", e);
                }
            }
        });
        spawn_local(async move {
            let _ = listen.await;
        });
        Closure::once_into_js(move || handle.abort())
    }
}
