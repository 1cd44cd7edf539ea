use std::{fmt, str::FromStr};

use crate::Error;

/// Which compute device a pipeline should be placed on.
///
/// `Ordinal` asks for the accelerator with that index and falls back to the
/// CPU when no accelerator is compiled in or present; `auto` is `Ordinal(0)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => f.write_str("cpu"),
            Self::Ordinal(0) => f.write_str("auto"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let ordinal = match s.as_str() {
            "cpu" => return Ok(Self::ForceCpu),
            "auto" | "gpu" | "cuda" | "metal" => return Ok(Self::default()),
            other => other
                .strip_prefix("cuda:")
                .or_else(|| other.strip_prefix("metal:"))
                .or_else(|| other.strip_prefix("gpu:"))
                .unwrap_or(other),
        };
        ordinal
            .parse()
            .map(Self::Ordinal)
            .map_err(|_| Error::validation(format!("invalid device: {s}")))
    }
}
