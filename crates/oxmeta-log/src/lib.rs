//! Leveled diagnostics for the `oxmeta` runtime.
//!
//! The runtime reports type registration, class lifecycle and recorded
//! failures through the macros in this crate. Output goes to stderr and is
//! filtered by a process-wide minimum level that can be set in code or from
//! the environment.
//!
//! # Environment
//!
//! - `OXMETA_LOG`: minimum level (`error`, `warn`, `info`, `debug`, `trace`)
//! - `OXMETA_LOG_STYLE`: `never` disables ANSI colors
//!
//! # Example
//!
//! ```
//! use oxmeta_log::{debug, info, Level};
//!
//! oxmeta_log::set_level(Level::Debug);
//!
//! let ty = "Color";
//! info!("registered {}", ty);
//! debug!("class size {} bytes", 16);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Environment variable holding the minimum level.
pub const LEVEL_ENV: &str = "OXMETA_LOG";

/// Environment variable controlling colored output.
pub const STYLE_ENV: &str = "OXMETA_LOG_STYLE";

/// Severity of a log message.
///
/// Lower discriminants are more severe, so `Error < Trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the caller has to act on.
    Error = 0,
    /// Suspicious but recoverable situations.
    Warn = 1,
    /// Lifecycle milestones.
    Info = 2,
    /// Registration and failure details.
    Debug = 3,
    /// Per-class and per-converter chatter.
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Upper-case name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError {
    input: String,
}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.input)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case and surrounding whitespace.
    ///
    /// # Example
    ///
    /// ```
    /// use oxmeta_log::Level;
    ///
    /// assert_eq!("debug".parse::<Level>(), Ok(Level::Debug));
    /// assert_eq!(" WARN ".parse::<Level>(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseLevelError {
                input: s.to_string(),
            })
    }
}

/// Process-wide filter state.
pub struct Logger {
    level: AtomicU8,
    colored: AtomicBool,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
            colored: AtomicBool::new(true),
        }
    }

    /// Sets the minimum level that gets printed.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Returns true if a message at `level` would be printed.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }

    /// Enables or disables ANSI colors.
    pub fn set_colored(&self, colored: bool) {
        self.colored.store(colored, Ordering::Relaxed);
    }

    fn colored(&self) -> bool {
        self.colored.load(Ordering::Relaxed)
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Returns the process logger. The default level is `Warn`.
pub fn logger() -> &'static Logger {
    LOGGER.get_or_init(|| Logger::new(Level::Warn))
}

/// Sets the minimum level of the process logger.
pub fn set_level(level: Level) {
    logger().set_level(level);
}

/// Parses `s` and sets it as the minimum level.
///
/// # Errors
///
/// Returns [`ParseLevelError`] and leaves the level untouched if `s` is not a
/// level name.
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Configures the logger from `OXMETA_LOG` and `OXMETA_LOG_STYLE`.
///
/// Unset variables keep the current settings.
///
/// # Errors
///
/// Returns [`ParseLevelError`] if `OXMETA_LOG` is set to something that is
/// not a level name. The style variable is still applied.
pub fn init_from_env() -> Result<(), ParseLevelError> {
    if let Ok(style) = std::env::var(STYLE_ENV) {
        logger().set_colored(!style.trim().eq_ignore_ascii_case("never"));
    }
    match std::env::var(LEVEL_ENV) {
        Ok(value) => set_level_from_str(&value),
        Err(_) => Ok(()),
    }
}

#[doc(hidden)]
pub fn __write(level: Level, target: &str, args: fmt::Arguments<'_>) {
    let logger = logger();
    if !logger.enabled(level) {
        return;
    }

    if logger.colored() {
        eprintln!("{}[{}]\x1b[0m {target}: {args}", level.color_code(), level);
    } else {
        eprintln!("[{level}] {target}: {args}");
    }
}

/// Logs at an explicit level, tagged with the caller's module path.
///
/// ```
/// use oxmeta_log::{log, Level};
///
/// log!(level: Level::Info, "{} types registered", 22);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::logger().enabled(level) {
            $crate::__write(level, module_path!(), format_args!($($arg)*));
        }
    }};
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Error, $($arg)*) };
}

/// Logs at [`Level::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Warn, $($arg)*) };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Info, $($arg)*) };
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Debug, $($arg)*) };
}

/// Logs at [`Level::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::log!(level: $crate::Level::Trace, $($arg)*) };
}
