//! Logging setup for the streaming engine.
//!
//! Structured tracing with dual output: a non-blocking log file plus
//! stdout, filtered through `RUST_LOG` (defaulting to `info`). Pipeline
//! modules emit per-tile fields (`tile`, `request_id`, `call_id`) so one
//! tile's journey through fetch, decode and the bridge can be grepped
//! out of a session log.

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keep this alive for the logging session; dropping it flushes and
/// closes the file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Default directory for session logs.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default session log file name.
pub fn default_log_file() -> &'static str {
    "tilestream.log"
}

/// Initialize the global tracing subscriber.
///
/// Creates `log_dir` if needed and truncates the previous session's
/// file. Fails if the directory cannot be created or the file cannot be
/// written.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    // Truncate last session's log.
    fs::write(Path::new(log_dir).join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = PathBuf::from(format!("test_logs_{nanos}"));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "tilestream.log");
    }

    #[test]
    fn test_creates_directory_and_file() {
        let dir = scratch_dir();
        let guard = init_logging(dir.to_str().unwrap(), "session.log").unwrap();
        assert!(dir.join("session.log").exists());
        drop(guard);
        let _ = fs::remove_dir_all(&dir);
    }
}
