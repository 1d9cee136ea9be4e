use log::{self, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;
use std::thread;

/// Adapted from SimpleLogger in crate `log`. Writes to stderr; the host
/// program owns stdout.
struct NumasightLogger;

impl Log for NumasightLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{:?}[{}:{}:{}] {}",
                thread::current().id(),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: NumasightLogger = NumasightLogger;

pub fn init() -> Result<(), SetLoggerError> {
    match env::var("RUST_LOG") {
        Ok(log_level) => match log_level.as_ref() {
            "OFF" => log::set_max_level(LevelFilter::Off),
            "ERROR" => log::set_max_level(LevelFilter::Error),
            "WARN" => log::set_max_level(LevelFilter::Warn),
            "INFO" => log::set_max_level(LevelFilter::Info),
            "DEBUG" => log::set_max_level(LevelFilter::Debug),
            "TRACE" => log::set_max_level(LevelFilter::Trace),
            _ => log::set_max_level(LevelFilter::Warn),
        },
        Err(_) => log::set_max_level(LevelFilter::Warn),
    }
    // The host program may have installed its own logger already; that is
    // fine, ours is best effort.
    log::set_logger(&LOGGER)
}
