//! Tracing setup for terminal and log-file output.

use std::fmt::Write as _;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::field::MakeExt as _;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Longest `message` field written before it is cut off with `...`.
const MAX_MESSAGE_CHARS: usize = 280;

const LOG_FILE_PREFIX: &str = "murmur.log";

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

fn format_field(
    writer: &mut format::Writer<'_>,
    field: &tracing::field::Field,
    value: &dyn std::fmt::Debug,
) -> std::fmt::Result {
    let field_name = field.name();
    if field_name == "message" {
        let formatted = format!("{value:?}");
        let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
        write!(writer, "{truncated}")?;
        if was_truncated {
            write!(writer, "...")?;
        }
        Ok(())
    } else {
        write!(writer, "{field_name}={value:?}")
    }
}

/// `debug` forces the debug level; otherwise `RUST_LOG` wins when set.
fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

/// Initialize tracing for foreground (terminal) mode.
pub fn init_foreground_tracing(debug: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .fmt_fields(format::debug_fn(format_field).delimited(" "))
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

/// Initialize tracing into a daily rolling file under `log_dir`.
///
/// The returned guard flushes buffered lines on drop; keep it alive for the
/// lifetime of the process.
pub fn init_file_tracing(log_dir: &Path, debug: bool) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .fmt_fields(format::debug_fn(format_field).delimited(" "))
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();

    guard
}
