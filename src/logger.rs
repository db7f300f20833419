use chrono::Utc;
use colored::*;
use log::{ Level, LevelFilter, Metadata, Record };

/// Minimal colored logger behind the `log` facade.
///
/// Every module logs through `log::debug!` / `log::warn!` etc.; this just
/// decides formatting and the level threshold.
struct CacheLogger {
    level: LevelFilter,
}

impl log::Log for CacheLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Utc::now().format("%H:%M:%S%.3f");
        let prefix = format!("[{}]", timestamp).dimmed();
        let message = format!("{}", record.args());

        match record.level() {
            Level::Error => println!("{} {} {}", prefix, "ERROR".red().bold(), message.red()),
            Level::Warn => println!("{} {} {}", prefix, "WARN ".yellow().bold(), message.yellow()),
            Level::Info => println!("{} {} {}", prefix, "INFO ".blue().bold(), message),
            Level::Debug => println!("{} {} {}", prefix, "DEBUG".purple(), message.dimmed()),
            Level::Trace => println!("{} {} {}", prefix, "TRACE".normal(), message.dimmed()),
        }
    }

    fn flush(&self) {}
}

/// Install the logger. `level` accepts the usual names ("debug", "info", ...).
pub fn init(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };

    // Ignore the error if a logger is already installed (tests).
    let _ = log::set_boxed_logger(Box::new(CacheLogger { level })).map(|()|
        log::set_max_level(level)
    );
}
