/// `fern` logger bootstrap for binaries.
pub mod logsetup;

pub use logsetup::{setup_logging, LogOptions, LoggerError, MESSAGE_TARGET};
