//! An embeddable library cannot assume it owns the process's stdout/stderr or logging
//! configuration, so instead of picking a sink directly we implement a `Drain` that hands each
//! record to whatever callback the host installed via `on_log`. Lazy formatting, structured
//! key-value pairs, and a leveled hierarchy of loggers built with `.new(o!(...))` all still work
//! exactly as they would against any other `slog` drain.

use slog::{Drain, Key, OwnedKVList, Record, Serializer, KV};
use std::fmt;
use std::sync::Arc;

/// Mirrors `slog::Level` without forcing callers to depend on `slog` themselves.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<slog::Level> for LogLevel {
    fn from(level: slog::Level) -> LogLevel {
        match level {
            slog::Level::Critical => LogLevel::Critical,
            slog::Level::Error => LogLevel::Error,
            slog::Level::Warning => LogLevel::Warning,
            slog::Level::Info => LogLevel::Info,
            slog::Level::Debug => LogLevel::Debug,
            slog::Level::Trace => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Critical => "CRIT",
            LogLevel::Error => "ERRO",
            LogLevel::Warning => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBG",
            LogLevel::Trace => "TRCE",
        };
        f.write_str(name)
    }
}

/// The shape of a user-supplied `on_log` callback: level, rendered message (including its
/// key-value pairs, formatted `key=value` in declaration order), never blocking or panicking.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// A `slog::Drain` that never writes to a fixed sink; it renders each record (lazily — only
/// once the level filter above it has already let the record through) and forwards it.
pub struct CallbackDrain {
    callback: LogCallback,
}

impl CallbackDrain {
    pub fn new(callback: LogCallback) -> CallbackDrain {
        CallbackDrain { callback }
    }
}

impl Drain for CallbackDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let mut rendered = format!("{}", record.msg());

        let mut collector = PairCollector { out: &mut rendered };
        let _ = record.kv().serialize(record, &mut collector);
        let _ = values.serialize(record, &mut collector);

        (self.callback)(record.level().into(), &rendered);

        Ok(())
    }
}

struct PairCollector<'a> {
    out: &'a mut String,
}

impl<'a> Serializer for PairCollector<'a> {
    fn emit_arguments(&mut self, key: Key, val: &fmt::Arguments) -> slog::Result {
        use std::fmt::Write;
        let _ = write!(self.out, " {}={}", key, val);
        Ok(())
    }
}

/// Wraps a [`CallbackDrain`] in `slog`'s standard `Fuse` so it can back a root `slog::Logger`
/// via `slog::Logger::root(drain, o!())`.
pub fn root_logger(callback: LogCallback, level: slog::Level) -> slog::Logger {
    let drain = CallbackDrain::new(callback);
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A logger that discards everything, used where no `on_log` callback was installed.
pub fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
