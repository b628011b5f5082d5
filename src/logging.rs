use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives, e.g. `saga_migrator=debug,sqlx=warn`.
pub const LOG_FILTER_ENV: &str = "SAGA_MIGRATOR_LOG";
/// `json` (default) or `pretty`.
pub const LOG_FORMAT_ENV: &str = "SAGA_MIGRATOR_LOG_FORMAT";
/// When set, logs are also written to a daily rolling file in this directory.
pub const LOG_DIR_ENV: &str = "SAGA_MIGRATOR_LOG_DIR";

const DEFAULT_FILTER: &str = "saga_migrator=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "saga-migrator.log";

// Keeps the file writer's worker alive for the life of the process.
static FILE_GUARD: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging() {
    FILE_GUARD.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let pretty = matches!(std::env::var(LOG_FORMAT_ENV).as_deref(), Ok("pretty"));

        let json_layer = (!pretty).then(|| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(std::io::stderr)
        });
        let pretty_layer = pretty.then(|| {
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(std::io::stderr)
        });

        let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(pretty_layer)
            .with(file_layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            // sqlx reports through `log`.
            let _ = tracing_log::LogTracer::init();
        }
        guard
    });
}
