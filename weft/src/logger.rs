//! Runtime logger: level-colored, worker-id-prefixed lines on stderr.

use std::io::Write;

use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;

struct RuntimeLogger {
    // Serializes whole records so concurrent workers do not interleave.
    lock: spin::Mutex<()>,
}

static LOGGER: RuntimeLogger = RuntimeLogger {
    lock: spin::Mutex::new(()),
};

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = self.lock.lock();
        let mut err = std::io::stderr().lock();

        let level = record.level();
        let _ = match level {
            Level::Error => write!(err, "{} ", format_args!("{level:5}").bright_red()),
            Level::Warn => write!(err, "{} ", format_args!("{level:5}").bright_yellow()),
            Level::Info => write!(err, "{} ", format_args!("{level:5}").bright_blue()),
            Level::Debug => write!(err, "{} ", format_args!("{level:5}").bright_cyan()),
            Level::Trace => write!(err, "{} ", format_args!("{level:5}").bright_magenta()),
        };
        match crate::platform::try_current_worker() {
            Some(m) => {
                let _ = write!(err, "{} ", format_args!("[w{}]", m.id()).dimmed());
            }
            None => {
                let _ = write!(err, "{} ", "[--]".dimmed());
            }
        }
        let _ = writeln!(err, "{}", record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger. Level comes from `WEFT_LOG`
/// (`error|warn|info|debug|trace|off`), default `warn`. Idempotent.
pub fn init() {
    static INIT: spin::Once = spin::Once::new();
    INIT.call_once(|| {
        let level = match std::env::var("WEFT_LOG").as_deref() {
            Ok("off") => LevelFilter::Off,
            Ok("error") => LevelFilter::Error,
            Ok("info") => LevelFilter::Info,
            Ok("debug") => LevelFilter::Debug,
            Ok("trace") => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        };
        log::set_max_level(level);
        let _ = log::set_logger(&LOGGER);
    });
}
