use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

use crate::config::Config;

pub const LOG_FILE_NAME: &str = "warden-supervisor.log";

/// Holds the supervisor's own log file open while the subscriber is installed.
pub struct LogGuard {
    pub path: Option<PathBuf>,
    _file: Option<Arc<File>>,
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level. Returns
/// `None` if a subscriber was already installed.
pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let path = log_file_path(&config.log_dir);
    let file = match path.as_deref().map(append_to) {
        Some(Ok(file)) => Some(Arc::new(file)),
        Some(Err(err)) => {
            eprintln!("log_file_error: {err}");
            None
        }
        None => None,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(console_and(file.clone()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard {
        path: file.as_ref().and(path),
        _file: file,
    })
}

pub fn log_file_path(log_dir: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    (!log_dir.is_empty()).then(|| Path::new(log_dir).join(LOG_FILE_NAME))
}

fn console_and(file: Option<Arc<File>>) -> BoxMakeWriter {
    match file {
        Some(file) => BoxMakeWriter::new(io::stdout.and(file)),
        None => BoxMakeWriter::new(io::stdout),
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn empty_log_dir_means_console_only() {
        assert_eq!(log_file_path("  "), None);
        assert_eq!(
            log_file_path("/var/log/warden"),
            Some(PathBuf::from("/var/log/warden/warden-supervisor.log"))
        );
    }

    #[test]
    fn writer_tees_into_log_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let log_dir = dir.path().join("nested").to_string_lossy().to_string();
        let path = log_file_path(&log_dir).expect("path");
        let file = Arc::new(append_to(&path).expect("open"));

        let make_writer = console_and(Some(file));
        let mut writer = make_writer.make_writer();
        writer.write_all(b"event=process_started\n").expect("write");
        writer.flush().expect("flush");
        drop(writer);

        let contents = std::fs::read_to_string(path).expect("read log");
        assert_eq!(contents, "event=process_started\n");
    }

    #[test]
    fn reopening_appends() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join(LOG_FILE_NAME);
        append_to(&path)
            .and_then(|mut file| file.write_all(b"first\n"))
            .expect("first write");
        append_to(&path)
            .and_then(|mut file| file.write_all(b"second\n"))
            .expect("second write");
        let contents = std::fs::read_to_string(path).expect("read log");
        assert_eq!(contents, "first\nsecond\n");
    }
}
