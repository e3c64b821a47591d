//! Development server for the desktop kernel
//!
//! A minimal static file server. Besides static files it serves the shadow
//! layer: `/shadow-manifest.json` is generated on every request from the
//! shadow directory, and `/shadow/<id>` serves the files in it.
//!
//! Usage: `serve [port] [shadow-dir]`

use desktop_kernel::logging;
use desktop_kernel::platform::native::SHADOW_PREFIX;
use desktop_kernel::vfs::ShadowManifest;
use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tiny_http::{Header, Response, Server};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SHADOW_DIR: &str = "shadow";
const MANIFEST_PATH: &str = "/shadow-manifest.json";

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init(log::LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let port = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let shadow_dir = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_SHADOW_DIR.to_string()));

    let addr = format!("0.0.0.0:{}", port);
    let server = Server::http(&addr)?;

    println!("┌─────────────────────────────────────┐");
    println!("│  desktop-kernel dev server          │");
    println!("├─────────────────────────────────────┤");
    println!("│  http://localhost:{}              │", port);
    println!("└─────────────────────────────────────┘");
    log::info!("serving shadow layer from {}", shadow_dir.display());

    for request in server.incoming_requests() {
        let url_path = request.url().split('?').next().unwrap_or("/").to_string();
        let response = route(&url_path, &shadow_dir);
        log::debug!("{} {} -> {}", request.method(), url_path, response.status_code().0);
        if let Err(e) = request.respond(response) {
            log::warn!("responding to {}: {}", url_path, e);
        }
    }
    Ok(())
}

fn route(url_path: &str, shadow_dir: &Path) -> Response<Cursor<Vec<u8>>> {
    if url_path == MANIFEST_PATH {
        return serve_manifest(shadow_dir);
    }
    if let Some(rest) = url_path
        .strip_prefix(SHADOW_PREFIX)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return serve_file(shadow_dir, rest);
    }
    let file_path = if url_path == "/" {
        "index.html"
    } else {
        url_path.trim_start_matches('/')
    };
    serve_file(Path::new("."), file_path)
}

fn serve_manifest(shadow_dir: &Path) -> Response<Cursor<Vec<u8>>> {
    let json = ShadowManifest::scan_dir(shadow_dir, SHADOW_PREFIX)
        .map_err(|e| e.to_string())
        .and_then(|manifest| manifest.to_json().map_err(|e| e.to_string()));
    match json {
        Ok(json) => with_type(Response::from_data(json), "application/json"),
        Err(e) => {
            log::error!("building shadow manifest from {}: {}", shadow_dir.display(), e);
            with_type(
                Response::from_string("500 Internal Server Error").with_status_code(500),
                "text/plain",
            )
        }
    }
}

fn serve_file(root: &Path, rel: &str) -> Response<Cursor<Vec<u8>>> {
    let rel = Path::new(rel);
    let escapes = rel.components().any(|c| !matches!(c, Component::Normal(_)));
    let contents = if escapes {
        None
    } else {
        fs::read(root.join(rel)).ok()
    };
    match contents {
        Some(contents) => with_type(Response::from_data(contents), mime_type(rel)),
        None => with_type(
            Response::from_string("404 Not Found").with_status_code(404),
            "text/plain",
        ),
    }
}

fn with_type(response: Response<Cursor<Vec<u8>>>, mime: &str) -> Response<Cursor<Vec<u8>>> {
    match Header::from_bytes("Content-Type", mime) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("wasm") => "application/wasm",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
