//! Tracing subscriber for the webhook binary.
//!
//! Admission decisions are logged on the `audit` target. With an audit file
//! configured they are written there as one line per decision and kept out
//! of the main log.

use std::env;
use std::fmt::Write as _;
use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::split_log_path;
use utils::logging::LOG_PATH_ENV_VAR;

pub const AUDIT_TARGET: &str = "audit";

const AUDIT_FILES_KEPT: usize = 7;

/// One line per event: `<level> <message> key=value ...`.
struct AuditFormatter;

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value}");
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, format_args!("{value:?}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // multi-line reports must not break the one-line format
        let rendered = format!("{value:?}").replace('\n', " | ");
        self.push(field, format_args!("{rendered}"));
    }
}

impl<S, N> FormatEvent<S, N> for AuditFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        writeln!(
            writer,
            "{} {}{}",
            event.metadata().level(),
            visitor.message,
            visitor.fields
        )
    }
}

fn is_audit(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == AUDIT_TARGET
}

/// initiate the global tracing subscriber
///
/// The returned guards must be held for as long as logs are written.
pub fn init(audit_log_file: Option<&Path>) -> anyhow::Result<Vec<WorkerGuard>> {
    let (fmt_layer, main_guard) =
        utils::logging::get_fmt_layer(env::var(LOG_PATH_ENV_VAR).ok());
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    let mut guards: Vec<WorkerGuard> = main_guard.into_iter().collect();

    let Some(audit_log_file) = audit_log_file else {
        registry().with(fmt_layer.with_filter(env_filter)).init();
        return Ok(guards);
    };

    let (dir, prefix) = split_log_path(audit_log_file);
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(AUDIT_FILES_KEPT)
        .build(dir)
        .with_context(|| format!("failed to create audit log under {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    guards.push(file_guard);

    let fmt_layer = fmt_layer.with_filter(
        env_filter.and(filter::filter_fn(|metadata| !is_audit(metadata))),
    );
    let audit_layer = layer()
        .event_format(AuditFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_audit));

    registry().with(fmt_layer).with(audit_layer).init();
    Ok(guards)
}
