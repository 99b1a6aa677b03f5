use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

fn enabled() -> bool {
    match std::env::var("FANMUX_OBSERVABILITY") {
        Ok(value) => !matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off" | "disabled"
        ),
        Err(_) => true,
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("FANMUX_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initializes logging once per process.
///
/// Environment variables:
/// - `FANMUX_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `FANMUX_LOG_LEVEL`: level/filter override (`info`, `debug`, ...).
/// - `FANMUX_JSON_LOG_PATH`: when set, logs are JSONL in that file instead
///   of human-readable console output on stdout.
/// - `RUST_LOG`: standard filter override.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !enabled() {
            return;
        }
        let filter = env_filter();
        if let Ok(path_raw) = std::env::var("FANMUX_JSON_LOG_PATH") {
            let path = std::path::PathBuf::from(path_raw);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("fanmux.logs.jsonl");
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init();
        }
    });
}
