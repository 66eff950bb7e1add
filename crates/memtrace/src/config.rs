use serde::{Deserialize, Serialize};
use std::alloc::GlobalAlloc;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::level::Level;
use crate::output::{JsonPrettyReporter, JsonReporter, Reporter, TableReporter, TracingReporter};
use crate::tracer::Tracer;

/// Frames kept per stack when the caller asks for zero.
pub const DEFAULT_FRAMES: usize = 8;

/// Upper bound on frames kept per stack.
pub const MAX_FRAMES: usize = 128;

/// Percentiles of live allocation sizes included in each report.
pub const DEFAULT_PERCENTILES: &[u8] = &[50, 95, 99];

pub const LEVEL_ENV: &str = "MEMTRACE_LEVEL";
pub const FRAMES_ENV: &str = "MEMTRACE_FRAMES";
pub const FORMAT_ENV: &str = "MEMTRACE_FORMAT";

/// Clamps a requested frame limit into `1..=MAX_FRAMES`, mapping zero to [`DEFAULT_FRAMES`].
pub const fn clamp_frames(frames: usize) -> usize {
    match frames {
        0 => DEFAULT_FRAMES,
        n if n > MAX_FRAMES => MAX_FRAMES,
        n => n,
    }
}

/// Output format used when a tracer dumps without an explicitly installed reporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Format {
    /// Line-oriented report emitted through `tracing` at TRACE level.
    #[default]
    Log,
    Table,
    Json,
    JsonPretty,
}

impl Format {
    pub fn reporter(self) -> Box<dyn Reporter> {
        match self {
            Format::Log => Box::new(TracingReporter),
            Format::Table => Box::new(TableReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Log => write!(f, "log"),
            Format::Table => write!(f, "table"),
            Format::Json => write!(f, "json"),
            Format::JsonPretty => write!(f, "json-pretty"),
        }
    }
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "tracing" => Ok(Format::Log),
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "json-pretty" | "json_pretty" => Ok(Format::JsonPretty),
            _ => Err(ConfigError::InvalidFormat(s.to_string())),
        }
    }
}

/// Format picked by `MEMTRACE_FORMAT`, falling back to [`Format::Log`].
pub(crate) fn env_format() -> Format {
    let Ok(raw) = std::env::var(FORMAT_ENV) else {
        return Format::default();
    };

    raw.parse().unwrap_or_else(|err| {
        tracing::warn!(target: "memtrace", "ignoring {FORMAT_ENV}: {err}");
        Format::default()
    })
}

pub(crate) fn normalize_percentiles(percentiles: &[u8]) -> Vec<u8> {
    let mut percentiles: Vec<u8> = percentiles.iter().copied().filter(|p| *p <= 100).collect();
    percentiles.sort_unstable();
    percentiles.dedup();
    percentiles
}

/// Builder for a [`Tracer`] with a non-default report sink or settings taken from
/// the environment.
///
/// # Examples
///
/// ```rust
/// use memtrace::{Format, Level, TracerBuilder};
/// use std::alloc::System;
///
/// let tracer = TracerBuilder::new()
///     .level(Level::Bytes)
///     .format(Format::Json)
///     .build(System);
///
/// assert_eq!(tracer.level(), Level::Bytes);
/// ```
pub struct TracerBuilder {
    level: Level,
    frames: usize,
    format: Format,
    percentiles: Vec<u8>,
    reporter: Option<Box<dyn Reporter>>,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TracerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerBuilder")
            .field("level", &self.level)
            .field("frames", &self.frames)
            .field("format", &self.format)
            .field("percentiles", &self.percentiles)
            .field("custom_reporter", &self.reporter.is_some())
            .finish()
    }
}

impl TracerBuilder {
    pub fn new() -> Self {
        Self {
            level: Level::Stacks,
            frames: DEFAULT_FRAMES,
            format: Format::default(),
            percentiles: DEFAULT_PERCENTILES.to_vec(),
            reporter: None,
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Frames kept per captured stack. Clamped when the tracer is built.
    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Selects one of the bundled reporters. Ignored when [`reporter`](Self::reporter) is set.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Percentiles (0-100) of live allocation sizes to include in reports.
    pub fn percentiles(mut self, percentiles: &[u8]) -> Self {
        self.percentiles = normalize_percentiles(percentiles);
        self
    }

    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Applies `MEMTRACE_LEVEL`, `MEMTRACE_FRAMES` and `MEMTRACE_FORMAT` overrides.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides produced by `lookup`, keyed by the same names as [`from_env`](Self::from_env).
    pub fn from_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(LEVEL_ENV) {
            self.level = raw.parse()?;
        }

        if let Some(raw) = lookup(FRAMES_ENV) {
            self.frames = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidFrames(raw.clone()))?;
        }

        if let Some(raw) = lookup(FORMAT_ENV) {
            self.format = raw.parse()?;
        }

        Ok(self)
    }

    pub fn build<A: GlobalAlloc>(self, delegate: A) -> Tracer<A> {
        let reporter = self.reporter.unwrap_or_else(|| self.format.reporter());
        Tracer::from_parts(
            delegate,
            self.level,
            self.frames,
            self.percentiles,
            Some(reporter),
        )
    }
}
