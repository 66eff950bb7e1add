use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// How much a [`Tracer`](crate::Tracer) records about each allocation.
///
/// Levels are ordered: every level records everything the previous one does.
///
/// * `None` - pure passthrough, nothing is recorded
/// * `Bytes` - size, acquisition time and count of every live allocation
/// * `Stacks` - additionally attributes each allocation to its call stack
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    None,
    Bytes,
    Stacks,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::None => "none",
            Level::Bytes => "bytes",
            Level::Stacks => "stacks",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "0" => Ok(Level::None),
            "bytes" | "1" => Ok(Level::Bytes),
            "stacks" | "2" => Ok(Level::Stacks),
            _ => Err(ConfigError::InvalidLevel(s.to_string())),
        }
    }
}
