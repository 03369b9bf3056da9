//! # Logger Setup
//!
//! Wires the `log` facade to stdout and to a rolling file through `fern`.
//! The file side is a `tracing_appender` rolling appender behind its
//! non-blocking writer; the returned guard flushes it on drop.

use anyhow::{anyhow, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl LogRotation {
    fn rotation(self) -> Rotation {
        match self {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minutely" => Ok(LogRotation::Minutely),
            "hourly" => Ok(LogRotation::Hourly),
            "daily" => Ok(LogRotation::Daily),
            "never" => Ok(LogRotation::Never),
            other => Err(format!("'{}' is not minutely, hourly, daily or never", other)),
        }
    }
}

/// # Log Options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Directory holding the log files. Created if missing.
    pub dir: PathBuf,
    /// `trace`, `debug`, `info`, `warn` or `error`; anything else means `info`.
    pub level: String,
    /// `name.ext`; rolled files are named `name.<date>.ext`.
    pub file_name: String,
    pub rotation: LogRotation,
    /// Log files kept on disk, the active one included.
    pub max_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            level: "info".to_string(),
            file_name: "canary_forwarder.log".to_string(),
            rotation: LogRotation::Daily,
            max_files: 4,
        }
    }
}

/// Maps a level name to a filter, case-insensitively.
pub fn parse_level(level: &str) -> log::LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "critical" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Builds the rolling appender for `options`, creating the directory.
pub fn file_appender(options: &LogOptions) -> Result<RollingFileAppender> {
    if !options.dir.exists() {
        fs::create_dir_all(&options.dir)?;
    }

    let name = Path::new(&options.file_name);
    let prefix = name
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("invalid log file name '{}'", options.file_name))?;

    let mut builder = RollingFileAppender::builder()
        .rotation(options.rotation.rotation())
        .filename_prefix(prefix)
        .max_log_files(options.max_files.max(1));
    if let Some(suffix) = name.extension().and_then(|s| s.to_str()) {
        builder = builder.filename_suffix(suffix);
    }

    Ok(builder.build(&options.dir)?)
}

/// Installs the global logger. Can only succeed once per process. Keep the
/// returned guard alive until exit so buffered lines reach the file.
pub fn setup_logging(options: &LogOptions) -> Result<WorkerGuard> {
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender(options)?);
    let file_output: Box<dyn io::Write + Send> = Box::new(file_writer);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(&options.level))
        .chain(io::stdout())
        .chain(file_output)
        .apply()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warning"), log::LevelFilter::Warn);
        assert_eq!(parse_level("nonsense"), log::LevelFilter::Info);
    }

    #[test]
    fn test_parse_rotation() {
        assert_eq!("Daily".parse::<LogRotation>().unwrap(), LogRotation::Daily);
        assert_eq!(" hourly ".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_appender_writes_into_created_dir() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            dir: dir.path().join("logs"),
            ..Default::default()
        };

        let mut appender = file_appender(&options).unwrap();
        writeln!(appender, "[2024-03-01 12:00:00][test][INFO] hello").unwrap();
        appender.flush().unwrap();

        let files: Vec<String> = fs::read_dir(&options.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("canary_forwarder."));
        assert!(files[0].ends_with(".log"));

        let content = fs::read_to_string(options.dir.join(&files[0])).unwrap();
        assert!(content.contains("hello"));
    }

    #[test]
    fn test_never_rotation_keeps_plain_name() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            dir: dir.path().to_path_buf(),
            rotation: LogRotation::Never,
            ..Default::default()
        };

        let mut appender = file_appender(&options).unwrap();
        writeln!(appender, "line").unwrap();
        appender.flush().unwrap();

        assert!(dir.path().join("canary_forwarder.log").exists());
    }

    #[test]
    fn test_rejects_empty_file_name() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            dir: dir.path().to_path_buf(),
            file_name: String::new(),
            ..Default::default()
        };
        assert!(file_appender(&options).is_err());
    }
}
