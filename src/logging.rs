use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
pub enum LogMode {
    /// Console + file logging
    ConsoleAndFile,
    /// File-only logging (for embedding hosts that own stderr)
    FileOnly,
    /// Console only
    ConsoleOnly,
}

pub struct LoggingConfig {
    pub mode: LogMode,
    pub log_dir: PathBuf,
    pub session_id: String,
}

impl LoggingConfig {
    pub fn new(mode: LogMode, log_dir: impl AsRef<Path>) -> Self {
        let session_id = generate_session_id();
        Self {
            mode,
            log_dir: log_dir.as_ref().to_path_buf(),
            session_id,
        }
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("streammux-{}.log", self.session_id))
    }
}

/// Initialize logging based on the configuration
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    // Get log level from environment or default to INFO
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.mode {
        LogMode::ConsoleAndFile => {
            std::fs::create_dir_all(&config.log_dir)?;
            let log_file = std::fs::File::create(config.log_file_path())
                .map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

            let (file_writer, _file_guard) = non_blocking(log_file);

            // Store the guard to prevent it from being dropped
            std::mem::forget(_file_guard);

            use tracing_subscriber::fmt::writer::MakeWriterExt;
            let multi_writer = std::io::stderr.and(file_writer);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(multi_writer)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .init();
        }
        LogMode::FileOnly => {
            std::fs::create_dir_all(&config.log_dir)?;
            let log_file = std::fs::File::create(config.log_file_path())
                .map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

            let (file_writer, _file_guard) = non_blocking(log_file);

            // Store the guard to prevent it from being dropped
            std::mem::forget(_file_guard);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .init();
        }
        LogMode::ConsoleOnly => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .init();
        }
    }

    tracing::info!(
        session_id = %config.session_id,
        mode = ?config.mode,
        "Logging initialized"
    );

    Ok(())
}

/// Generate a unique session ID with timestamp
fn generate_session_id() -> String {
    let now: DateTime<Utc> = Utc::now();
    format!("{}", now.format("%Y%m%d_%H%M%S_%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let session_id = generate_session_id();
        // Should be in format: YYYYMMDD_HHMMSS_mmm
        assert_eq!(session_id.len(), 19);
        assert!(session_id.contains('_'));
    }

    #[test]
    fn test_logging_config() {
        let config = LoggingConfig::new(LogMode::FileOnly, "/tmp/streammux-test");
        assert_eq!(config.mode, LogMode::FileOnly);
        assert!(config
            .log_file_path()
            .to_string_lossy()
            .contains("streammux-"));
    }
}
