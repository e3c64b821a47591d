//! Log sink
//!
//! Everything logs through the `log` facade. In the browser records go to
//! the developer console; natively they go to stderr via `env_logger`.
//! Calling [`init`] more than once keeps the first sink and only updates
//! the level.

use log::LevelFilter;

#[cfg(target_arch = "wasm32")]
mod console {
    use log::{Level, Metadata, Record};

    pub(super) static LOGGER: ConsoleLogger = ConsoleLogger;

    pub(super) struct ConsoleLogger;

    impl log::Log for ConsoleLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let line = format!("[{}] {}: {}", record.level(), record.target(), record.args());
            let line = wasm_bindgen::JsValue::from_str(&line);
            match record.level() {
                Level::Error => web_sys::console::error_1(&line),
                Level::Warn => web_sys::console::warn_1(&line),
                Level::Info => web_sys::console::info_1(&line),
                Level::Debug | Level::Trace => web_sys::console::debug_1(&line),
            }
        }

        fn flush(&self) {}
    }
}

/// Install the platform log sink
#[cfg(target_arch = "wasm32")]
pub fn init(level: LevelFilter) {
    // a second set_logger fails; the console sink is already in place
    let _ = log::set_logger(&console::LOGGER);
    log::set_max_level(level);
}

/// Install the platform log sink
///
/// `RUST_LOG` overrides `level` when set.
#[cfg(not(target_arch = "wasm32"))]
pub fn init(level: LevelFilter) {
    let installed = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
    if installed.is_err() {
        log::set_max_level(level);
    }
}

/// Parse a level name such as `"debug"`, falling back to `Info`
pub fn level_from_str(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::Info)
}
