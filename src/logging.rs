use std::sync::Once;

use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Filter directives from `EIT_LOG`, falling back to `RUST_LOG`, then `info`.
fn env_filters() -> String {
    std::env::var("EIT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| level_to_str(LevelFilter::Info).to_string())
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize logging for Rust binaries (stderr formatter) based on `EIT_LOG`/`RUST_LOG`.
///
/// An explicit `verbosity` (e.g. from a CLI flag) wins over the environment.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_rust_logging(verbosity: Option<LevelFilter>) {
    RUST_LOG_ONCE.call_once(|| {
        let filters = match verbosity {
            Some(level) => level_to_str(level).to_string(),
            None => env_filters(),
        };
        let _ = env_logger::Builder::new()
            .parse_filters(&filters)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}
