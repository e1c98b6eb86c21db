use core::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, Ordering},
};
use std::{
    io::{self, Write as _},
    sync::OnceLock,
    time::Instant,
};

use snafu::Snafu;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*));
    };
}

#[expect(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*);
    };
}

macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*);
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*);
    };
}

macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*);
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*);
    };
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static START: OnceLock<Instant> = OnceLock::new();

/// Sets the most verbose level that is still written and starts the clock.
pub fn init(max_level: LogLevel) {
    START.get_or_init(Instant::now);
    MAX_LEVEL.store(max_level as u8, Ordering::Relaxed);
}

fn enabled(level: LogLevel) -> bool {
    level as u8 >= MAX_LEVEL.load(Ordering::Relaxed)
}

pub fn log(level: LogLevel, message: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let now = START.get_or_init(Instant::now).elapsed();
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{now:?} {} {}", LevelFormat(level), message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown log level {value:?}, expected one of trace, debug, info, warn, error"))]
pub struct ParseLogLevelError {
    value: String,
}

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => ParseLogLevelSnafu { value: s }.fail(),
        }
    }
}

struct LevelFormat(LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        let err = "loud".parse::<LogLevel>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown log level \"loud\", expected one of trace, debug, info, warn, error"
        );
    }

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_format() {
        assert_eq!(
            LevelFormat(LogLevel::Warn).to_string(),
            "\x1B[33;1m WARN\x1B[0m"
        );
    }
}
