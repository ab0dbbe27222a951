//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Redirects the human readable log to a daily rolling file when set.
pub const LOG_PATH_ENV_VAR: &str = "WEBHOOK_LOG_PATH";

const DEFAULT_LOG_FILE_NAME: &str = "webhook.log";

/// A boxed fmt layer plus the guard that keeps its background writer alive.
pub type FmtLayer<S> = (
    Box<dyn Layer<S> + Send + Sync + 'static>,
    Option<WorkerGuard>,
);

/// Split a log file path into the directory and the rolling file prefix.
pub fn split_log_path(log_path: &Path) -> (&Path, &str) {
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE_NAME);
    (dir, prefix)
}

/// Build the fmt layer, writing to stderr or to a daily rolling file under
/// `log_path`.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> FmtLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path {
        Some(log_path) => {
            let (dir, prefix) = split_log_path(Path::new(&log_path));
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (fmt_layer, Some(guard))
        }
        None => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed();
            (fmt_layer, None)
        }
    }
}

/// initiate the global tracing subscriber
pub fn init() -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let (fmt_layer, guard) = get_fmt_layer(std::env::var(LOG_PATH_ENV_VAR).ok());

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn split_log_path_with_directory() {
        let (dir, prefix) = split_log_path(Path::new("/var/log/webhook/audit.log"));
        assert_eq!(dir, Path::new("/var/log/webhook"));
        assert_eq!(prefix, "audit.log");
    }

    #[test]
    fn split_log_path_bare_file_name_uses_current_dir() {
        let (dir, prefix) = split_log_path(Path::new("audit.log"));
        assert_eq!(dir, Path::new("."));
        assert_eq!(prefix, "audit.log");
    }

    #[test]
    fn split_log_path_without_file_name_uses_default() {
        let (_, prefix) = split_log_path(Path::new("/"));
        assert_eq!(prefix, DEFAULT_LOG_FILE_NAME);
    }

    #[test]
    fn rolling_file_layer_is_built_under_directory() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("webhook.log");

        let (_layer, guard): FmtLayer<tracing_subscriber::Registry> =
            get_fmt_layer(Some(path.to_string_lossy().into_owned()));

        assert!(guard.is_some(), "file logging should return a writer guard");
    }
}
