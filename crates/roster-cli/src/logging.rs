use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub struct LogGuard {
    file: Option<Arc<File>>,
}

/// Installs the global subscriber. `RUST_LOG` wins over `--debug`, which
/// wins over `ROSTER_LOG_LEVEL`. Logs go to stderr, or only to the file under
/// `log_dir`, so the roster owns stdout.
pub fn init_logging(debug: bool, log_dir: Option<&str>, run_id: &str) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("ROSTER_LOG_LEVEL") {
        level
    } else {
        "warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir.unwrap_or_default(), run_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_writer(writer.file.clone()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

/// The log file when one is open, otherwise stderr. Never both.
fn log_writer(file: Option<Arc<File>>) -> BoxMakeWriter {
    match file {
        Some(file) => BoxMakeWriter::new(file),
        None => BoxMakeWriter::new(io::stderr),
    }
}

fn open_log_file(log_dir: &str, run_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("roster-{run_id}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(file)),
    })
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
