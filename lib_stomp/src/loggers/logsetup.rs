use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use thiserror::Error;

/// Target of the per-message trace lines written by dispatchers.
pub const MESSAGE_TARGET: &str = "stomp::message";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger already installed: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `error`, `warn`, `info`, `debug` or `trace`; anything else means `info`.
    pub level: String,
    /// Also write to a file in this directory.
    pub log_dir: Option<PathBuf>,
    /// Log file prefix.
    pub app_name: String,
    /// Emit the body of every decoded inbound frame.
    pub message_trace: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            app_name: "stomp".to_string(),
            message_trace: false,
        }
    }
}

pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

pub fn setup_logging(options: &LogOptions) -> Result<(), LoggerError> {
    let message_level = if options.message_trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Off
    };

    let mut dispatch = fern::Dispatch::new()
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
        .level_for(MESSAGE_TARGET, message_level)
        .chain(std::io::stdout());

    if let Some(log_dir) = &options.log_dir {
        if !log_dir.exists() {
            fs::create_dir_all(log_dir)?;
        }

        // Keep only the most recent file of this app.
        cleanup_old_logs(log_dir, &options.app_name)?;

        let log_file_name = format!(
            "{}_{}.log",
            options.app_name,
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        dispatch = dispatch.chain(fern::log_file(log_dir.join(log_file_name))?);
    }

    dispatch.apply()?;
    Ok(())
}

fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> Result<(), LoggerError> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
