//! Browser tests for the JS surface
//!
//! Run with `wasm-pack test --headless --firefox`. No dev server is
//! involved: these kernels never load a shadow layer.

#![cfg(target_arch = "wasm32")]

use desktop_kernel::platform::web::WasmKernel;
use js_sys::{Promise, Reflect, Uint8Array};
use wasm_bindgen::JsCast;
use wasm_bindgen::JsValue;
use wasm_bindgen::prelude::Closure;
use wasm_bindgen_futures::JsFuture;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

const O_WRONLY_CREAT: u32 = 0x0041;

fn get(value: &JsValue, key: &str) -> JsValue {
    Reflect::get(value, &JsValue::from_str(key)).unwrap()
}

/// Let spawned listeners run
async fn settle() {
    let promise = Promise::new(&mut |resolve, _reject| {
        web_sys::window()
            .unwrap()
            .set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, 0)
            .unwrap();
    });
    JsFuture::from(promise).await.unwrap();
}

#[wasm_bindgen_test]
async fn test_write_and_read_file() {
    let kernel = WasmKernel::new(None).unwrap();
    let fd = JsFuture::from(kernel.open("/hello.txt", O_WRONLY_CREAT)).await.unwrap();
    let fd = fd.as_f64().unwrap() as u32;
    let written = JsFuture::from(kernel.write(fd, b"hi there")).await.unwrap();
    assert_eq!(written.as_f64(), Some(8.0));
    JsFuture::from(kernel.close(fd)).await.unwrap();

    let fd = JsFuture::from(kernel.open("/hello.txt", 0)).await.unwrap();
    let bytes = JsFuture::from(kernel.read(fd.as_f64().unwrap() as u32, 64)).await.unwrap();
    assert_eq!(Uint8Array::new(&bytes).to_vec(), b"hi there");
}

#[wasm_bindgen_test]
async fn test_stat_object() {
    let kernel = WasmKernel::new(None).unwrap();
    JsFuture::from(kernel.mkdir("/home")).await.unwrap();
    let meta = JsFuture::from(kernel.stat("/home")).await.unwrap();
    assert_eq!(get(&meta, "type").as_string().as_deref(), Some("folder"));
    assert_eq!(get(&meta, "origin").as_string().as_deref(), Some("overlay"));
}

#[wasm_bindgen_test]
async fn test_errors_carry_errno() {
    let kernel = WasmKernel::new(None).unwrap();
    let err = JsFuture::from(kernel.stat("/missing")).await.unwrap_err();
    assert_eq!(get(&err, "code").as_f64(), Some(2.0));
}

#[wasm_bindgen_test]
async fn test_config_is_validated() {
    assert!(WasmKernel::new(Some(r#"{"ttyBufferSize": 0}"#.to_string())).is_err());
    assert!(WasmKernel::new(Some("{}".to_string())).is_ok());
}

#[wasm_bindgen_test]
async fn test_tty_round_trip() {
    let kernel = WasmKernel::new(None).unwrap();
    JsFuture::from(kernel.tty_write(0, b"pwd\r").unwrap()).await.unwrap();
    let line = JsFuture::from(kernel.tty_read(0, 64).unwrap()).await.unwrap();
    assert_eq!(Uint8Array::new(&line).to_vec(), b"pwd\n");
    assert!(kernel.tty_read(7, 64).is_err());
}

#[wasm_bindgen_test]
async fn test_tree_items() {
    let kernel = WasmKernel::new(None).unwrap();
    let items = js_sys::JSON::parse(r#"[{"id":"","name":"todo.md","type":"file","content":"- ship"}]"#)
        .unwrap();
    JsFuture::from(kernel.add_items(js_sys::Array::new().into(), items).unwrap())
        .await
        .unwrap();
    let root = JsFuture::from(kernel.root_item()).await.unwrap();
    assert_eq!(get(&root, "id").as_string().as_deref(), Some("root"));
    let children = js_sys::Array::from(&get(&root, "children"));
    assert_eq!(children.length(), 1);
    assert_eq!(get(&children.get(0), "content").as_string().as_deref(), Some("- ship"));
}

#[wasm_bindgen_test]
async fn test_file_system_events() {
    let kernel = WasmKernel::new(None).unwrap();
    let seen = js_sys::Array::new();
    let sink = seen.clone();
    let listener = Closure::<dyn FnMut(JsValue)>::new(move |event: JsValue| {
        sink.push(&event);
    });
    let unsubscribe = kernel.on_file_system_event(listener.as_ref().unchecked_ref::<js_sys::Function>().clone());

    JsFuture::from(kernel.mkdir("/home")).await.unwrap();
    settle().await;
    assert_eq!(seen.length(), 1);
    let event = seen.get(0);
    assert_eq!(get(&event, "type").as_string().as_deref(), Some("FS_CHANGED"));
    assert_eq!(get(&event, "path").as_string().as_deref(), Some("/home"));

    unsubscribe
        .unchecked_into::<js_sys::Function>()
        .call0(&JsValue::NULL)
        .unwrap();
    JsFuture::from(kernel.mkdir("/tmp")).await.unwrap();
    settle().await;
    assert_eq!(seen.length(), 1);
}
