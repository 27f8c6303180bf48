//! Logging Infrastructure
//!
//! Leveled, structured logging for the memory subsystem. Entries carry a
//! level, a message and key-value fields and go to stderr as plain text or
//! JSON.
//!
//! Level and format live in atomics so that the fault handler can ask
//! [`would_log`] without taking a lock. Emitting an entry allocates and
//! must not happen in signal context; the handler writes its own report.
//!
//! # Example
//!
//! ```rust,ignore
//! use redzone_runtime::log::{self, LogBuilder, LogLevel};
//!
//! log::warn("page protection unavailable");
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .message("guard zone installed")
//!     .field_str("region", "det-stack")
//!     .field_addr("zone_start", 0x7f00_0000_e000)
//!     .field_int("zone_size", 16384)
//!     .emit();
//! ```

use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Target name written with every entry.
pub const TARGET: &str = "redzone";

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level; includes every guard-zone relaxation.
    Debug = 1,
    /// Info level.
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    /// Level name as written in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "warning" => Some(LogLevel::Warn),
            "err" => Some(LogLevel::Error),
            "none" => Some(LogLevel::Off),
            _ => Self::ALL.into_iter().find(|l| l.as_str().eq_ignore_ascii_case(s)),
        }
    }

    fn from_u8(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or_default()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// `[secs.millis] LEVEL [redzone] message {k=v, ...}`
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogValue {
    /// Text.
    Str(String),
    /// Signed integer.
    Int(i64),
    /// Address, rendered in hex.
    Addr(usize),
    /// Flag.
    Bool(bool),
}

impl LogValue {
    fn write_plain(&self, out: &mut String) -> fmt::Result {
        match self {
            LogValue::Str(s) => out.write_str(s),
            LogValue::Int(i) => write!(out, "{}", i),
            LogValue::Addr(a) => write!(out, "{:#x}", a),
            LogValue::Bool(b) => write!(out, "{}", b),
        }
    }

    fn write_json(&self, out: &mut String) -> fmt::Result {
        match self {
            LogValue::Str(s) => write_json_str(out, s),
            LogValue::Int(i) => write!(out, "{}", i),
            LogValue::Addr(a) => write!(out, "\"{:#x}\"", a),
            LogValue::Bool(b) => write!(out, "{}", b),
        }
    }
}

/// One log line before rendering.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Structured fields, in insertion order.
    pub fields: Vec<(&'static str, LogValue)>,
    /// Unix time in milliseconds.
    pub timestamp: u64,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Render in `format`.
    pub fn render(&self, format: LogFormat) -> String {
        let mut out = String::with_capacity(64 + self.message.len());
        // Writing into a String cannot fail.
        let _ = match format {
            LogFormat::Plain => self.render_plain(&mut out),
            LogFormat::Json => self.render_json(&mut out),
        };
        out
    }

    fn render_plain(&self, out: &mut String) -> fmt::Result {
        write!(
            out,
            "[{}.{:03}] {:<5} [{}] {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level,
            TARGET,
            self.message
        )?;
        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.write_str(if i == 0 { " {" } else { ", " })?;
            write!(out, "{}=", key)?;
            value.write_plain(out)?;
        }
        if !self.fields.is_empty() {
            out.write_char('}')?;
        }
        Ok(())
    }

    fn render_json(&self, out: &mut String) -> fmt::Result {
        write!(
            out,
            "{{\"timestamp\":{},\"level\":\"{}\",\"target\":\"{}\",\"message\":",
            self.timestamp, self.level, TARGET
        )?;
        write_json_str(out, &self.message)?;
        for (key, value) in &self.fields {
            out.write_char(',')?;
            write_json_str(out, key)?;
            out.write_char(':')?;
            value.write_json(out)?;
        }
        out.write_char('}')
    }
}

fn write_json_str(out: &mut String, s: &str) -> fmt::Result {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\t' => out.write_str("\\t")?,
            c if c.is_control() => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

static JSON: AtomicBool = AtomicBool::new(false);

/// Set the minimum level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    JSON.store(format == LogFormat::Json, Ordering::Relaxed);
}

/// Current output format.
pub fn format() -> LogFormat {
    if JSON.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Plain
    }
}

/// Whether an entry at `level` would be written. Signal-safe.
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level >= self::level()
}

/// Write `entry` to stderr if its level passes.
pub fn emit(entry: &LogEntry) {
    if would_log(entry.level) {
        let line = entry.render(format());
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
    }
}

/// Builder for entries with fields.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Start an entry at `level`.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Add a text field.
    pub fn field_str(self, key: &'static str, value: impl Into<String>) -> Self {
        self.field(key, LogValue::Str(value.into()))
    }

    /// Add an integer field.
    pub fn field_int(self, key: &'static str, value: i64) -> Self {
        self.field(key, LogValue::Int(value))
    }

    /// Add an address field.
    pub fn field_addr(self, key: &'static str, value: usize) -> Self {
        self.field(key, LogValue::Addr(value))
    }

    /// Add a flag field.
    pub fn field_bool(self, key: &'static str, value: bool) -> Self {
        self.field(key, LogValue::Bool(value))
    }

    fn field(mut self, key: &'static str, value: LogValue) -> Self {
        self.entry.fields.push((key, value));
        self
    }

    /// Emit the entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

fn log(level: LogLevel, message: impl Into<String>) {
    if would_log(level) {
        emit(&LogEntry::new(level, message));
    }
}

/// Log at debug level.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log at info level.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log at warn level.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log at error level.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}
