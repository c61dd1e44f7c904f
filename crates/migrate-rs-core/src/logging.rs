//! Logging integration for migrate-rs.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`LogSettings`](crate::settings::LogSettings) and for creating per-run
//! spans.

use crate::settings::LogSettings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.level` (e.g. "debug", "info",
/// "migrate_rs_mongodb=trace"); an invalid directive falls back to "info".
/// Human-readable output is used unless `settings.json` is set.
///
/// Installing a subscriber twice is not an error; the second call is a no-op.
pub fn setup_logging(settings: &LogSettings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.json {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one migration run.
///
/// # Examples
///
/// ```
/// use migrate_rs_core::logging::run_span;
///
/// let span = run_span("testMigration", Some(3));
/// let _guard = span.enter();
/// tracing::info!("applying migration");
/// ```
pub fn run_span(database: &str, version: Option<i64>) -> tracing::Span {
    tracing::info_span!("migration_run", database, version)
}
