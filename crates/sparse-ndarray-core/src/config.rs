//! Platform configuration and the per-call context.
//!
//! Callers pass configuration as a flat string dictionary (the platform
//! config). [`PlatformConfig`] parses the keys this crate understands and
//! keeps typed defaults for the rest:
//!
//! | key                          | type   | default     |
//! |------------------------------|--------|-------------|
//! | `soma.read.batch_cells`      | usize  | 65536       |
//! | `soma.write.flush_cells`     | usize  | 1048576     |
//! | `soma.write.compression`     | string | `zstd`      |
//! | `soma.write.commit_retries`  | usize  | 16          |
//!
//! Unknown keys are ignored with a warning.
use std::{collections::HashMap, fmt, str::FromStr};

use chrono::Utc;
use log::warn;
use snafu::prelude::*;

/// Key for the number of cells per read batch.
pub const READ_BATCH_CELLS_KEY: &str = "soma.read.batch_cells";
/// Key for the number of buffered cells that triggers a fragment flush.
pub const WRITE_FLUSH_CELLS_KEY: &str = "soma.write.flush_cells";
/// Key for the fragment compression codec.
pub const WRITE_COMPRESSION_KEY: &str = "soma.write.compression";
/// Key for the number of commit attempts on version races.
pub const WRITE_COMMIT_RETRIES_KEY: &str = "soma.write.commit_retries";

/// Errors raised while parsing configuration.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A value could not be parsed for its key.
    #[snafu(display("Invalid value {value:?} for {key}: {reason}"))]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value supplied.
        value: String,
        /// What was expected.
        reason: String,
    },

    /// A timestamp window with `start > end`.
    #[snafu(display("Invalid timestamp window [{start}, {end}]"))]
    InvalidWindow {
        /// Window start in milliseconds.
        start: u64,
        /// Window end in milliseconds.
        end: u64,
    },
}

/// Compression codec used for fragment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Zstandard (default level).
    #[default]
    Zstd,
    /// Snappy.
    Snappy,
    /// No compression.
    Uncompressed,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(Compression::Zstd),
            "snappy" => Ok(Compression::Snappy),
            "uncompressed" | "none" => Ok(Compression::Uncompressed),
            _ => Err("expected one of zstd, snappy, uncompressed".to_string()),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Zstd => "zstd",
            Compression::Snappy => "snappy",
            Compression::Uncompressed => "uncompressed",
        };
        f.write_str(name)
    }
}

/// Typed view of the platform configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Maximum number of cells in one read batch.
    pub read_batch_cells: usize,
    /// Buffered cells that trigger a fragment flush during a write session.
    pub write_flush_cells: usize,
    /// Fragment compression codec.
    pub compression: Compression,
    /// Commit attempts before a write session gives up on version races.
    pub commit_retries: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            read_batch_cells: 65_536,
            write_flush_cells: 1_048_576,
            compression: Compression::Zstd,
            commit_retries: 16,
        }
    }
}

impl PlatformConfig {
    /// Parse a platform-config dictionary, starting from the defaults.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Sorted so warnings come out in a stable order.
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();

        for key in keys {
            let value = &map[key];
            match key.as_str() {
                READ_BATCH_CELLS_KEY => config.read_batch_cells = parse_positive(key, value)?,
                WRITE_FLUSH_CELLS_KEY => config.write_flush_cells = parse_positive(key, value)?,
                WRITE_COMMIT_RETRIES_KEY => config.commit_retries = parse_positive(key, value)?,
                WRITE_COMPRESSION_KEY => {
                    config.compression =
                        value
                            .parse()
                            .map_err(|reason| ConfigError::InvalidValue {
                                key: key.clone(),
                                value: value.clone(),
                                reason,
                            })?;
                }
                other => warn!("ignoring unknown platform config key {other:?}"),
            }
        }

        Ok(config)
    }

    /// Set the read batch size in cells (clamped to at least 1).
    pub fn with_read_batch_cells(mut self, cells: usize) -> Self {
        self.read_batch_cells = cells.max(1);
        self
    }

    /// Set the write flush threshold in cells (clamped to at least 1).
    pub fn with_write_flush_cells(mut self, cells: usize) -> Self {
        self.write_flush_cells = cells.max(1);
        self
    }

    /// Set the fragment compression codec.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the commit attempt budget (clamped to at least 1).
    pub fn with_commit_retries(mut self, attempts: usize) -> Self {
        self.commit_retries = attempts.max(1);
        self
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => InvalidValueSnafu {
            key,
            value,
            reason: "expected a positive integer",
        }
        .fail(),
    }
}

/// Inclusive window of logical commit stamps, in milliseconds since the Unix
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimestampWindow {
    start: u64,
    end: u64,
}

impl TimestampWindow {
    /// Window `[start, end]`; fails when `start > end`.
    pub fn new(start: u64, end: u64) -> Result<Self, ConfigError> {
        ensure!(start <= end, InvalidWindowSnafu { start, end });
        Ok(Self { start, end })
    }

    /// Window `[0, end]`.
    pub fn until(end: u64) -> Self {
        Self { start: 0, end }
    }

    /// Window `[0, now]`.
    pub fn until_now() -> Self {
        Self::until(now_ms())
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive upper bound; also the stamp given to commits made under it.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Whether `timestamp_ms` lies inside the window.
    pub fn contains(&self, timestamp_ms: u64) -> bool {
        self.start <= timestamp_ms && timestamp_ms <= self.end
    }
}

impl fmt::Display for TimestampWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Shared settings passed to array operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    config: PlatformConfig,
    timestamp: Option<TimestampWindow>,
}

impl Context {
    /// Context with default configuration and no fixed window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context built from a platform-config dictionary.
    pub fn from_platform_config(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            config: PlatformConfig::from_map(map)?,
            timestamp: None,
        })
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: PlatformConfig) -> Self {
        self.config = config;
        self
    }

    /// Fix the default timestamp window used when an open does not supply one.
    pub fn with_timestamp(mut self, window: TimestampWindow) -> Self {
        self.timestamp = Some(window);
        self
    }

    /// Typed configuration.
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Window to use for an open: the explicit one, else the context default,
    /// else `[0, now]`.
    pub fn resolve_window(&self, explicit: Option<TimestampWindow>) -> TimestampWindow {
        explicit
            .or(self.timestamp)
            .unwrap_or_else(TimestampWindow::until_now)
    }
}
