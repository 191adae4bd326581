//! Async helpers for persisting and reading the array log.
//!
//! This module owns all on-disk interactions with `_array_log/`:
//! - Tracking the `CURRENT` pointer and interpreting the "no file" case as
//!   version `0` (no array).
//! - Writing zero-padded commit files with optimistic concurrency control so
//!   each version is created exactly once.
//! - Rebasing commits whose actions commute with whatever won the race, with
//!   jittered exponential backoff between attempts.
//! - Publishing a commit file a crashed writer left behind without moving
//!   `CURRENT`.
use crate::storage::{self, ArrayLocation, StorageError};
use crate::transaction_log::actions::{Commit, LogAction};
use crate::transaction_log::*;
use chrono::Utc;
use log::{debug, warn};
use snafu::{Backtrace, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backoff ceiling after the first lost race; doubles per round.
const BASE_BACKOFF: Duration = Duration::from_millis(2);
/// Upper bound on a single backoff.
const MAX_BACKOFF: Duration = Duration::from_millis(250);
/// Rounds a writer waits for `CURRENT` to catch up with an existing next
/// commit before publishing that commit itself.
const STALL_ROUNDS: usize = 3;

/// Helper for reading and writing the commit log under an array root.
///
/// Layout:
///   <root>/_array_log/0000000001.json
///   <root>/_array_log/0000000002.json
///   <root>/_array_log/CURRENT
#[derive(Debug, Clone)]
pub struct TransactionLogStore {
    location: ArrayLocation,
}

impl TransactionLogStore {
    /// Name of the subdirectory containing the commit log.
    pub const LOG_DIR_NAME: &str = "_array_log";
    /// Name of the file that stores the current version pointer.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Number of digits used in zero-padded commit file names.
    pub const COMMIT_FILENAME_DIGITS: usize = 10;

    /// Create a new store rooted at an array directory.
    pub fn new(location: ArrayLocation) -> Self {
        Self { location }
    }

    /// Root location of the array.
    pub fn location(&self) -> &ArrayLocation {
        &self.location
    }

    fn log_rel_dir() -> PathBuf {
        PathBuf::from(Self::LOG_DIR_NAME)
    }

    fn current_rel_path() -> PathBuf {
        Self::log_rel_dir().join(Self::CURRENT_FILE_NAME)
    }

    fn commit_rel_path(version: u64) -> PathBuf {
        let file_name = format!(
            "{:0width$}.json",
            version,
            width = Self::COMMIT_FILENAME_DIGITS
        );
        Self::log_rel_dir().join(file_name)
    }

    async fn write_atomic_rel(&self, rel: &Path, contents: &[u8]) -> Result<(), CommitError> {
        storage::write_atomic(&self.location, rel, contents)
            .await
            .context(StorageSnafu)
    }

    /// Load a single commit by version.
    ///
    /// - On storage-layer failures, returns `CommitError::Storage`.
    /// - On JSON parse failures, returns `CommitError::CorruptState`.
    pub async fn load_commit(&self, version: u64) -> Result<Commit, CommitError> {
        let rel = Self::commit_rel_path(version);
        let json = storage::read_to_string(&self.location, &rel)
            .await
            .context(StorageSnafu)?;

        serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Load the CURRENT version pointer.
    ///
    /// A missing CURRENT file means no array exists yet and yields 0. Empty or
    /// non-numeric content is `CorruptState`.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        let rel = Self::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
            .fail();
        }

        trimmed
            .parse::<u64>()
            .map_err(|e| CommitError::CorruptState {
                msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
                backtrace: Backtrace::capture(),
            })
    }

    /// Commit a new version with an optimistic concurrency guard.
    ///
    /// The CURRENT check is advisory. The real guard is the create-only write
    /// of the commit file: a writer that loses that race gets
    /// `CommitError::Storage` wrapping `StorageError::AlreadyExists`.
    ///
    /// If the commit file is written but updating CURRENT fails, readers keep
    /// replaying up to the old CURRENT, and the next
    /// [`commit_with_retries`](Self::commit_with_retries) publishes the orphan
    /// before committing on top of it.
    pub async fn commit_with_expected_version(
        &self,
        expected: u64,
        timestamp_ms: u64,
        actions: Vec<LogAction>,
    ) -> Result<u64, CommitError> {
        let current = self.load_current_version().await?;
        if current != expected {
            return ConflictSnafu {
                expected,
                found: current,
            }
            .fail();
        }

        let version = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;

        let commit = Commit {
            version,
            base_version: expected,
            timestamp_ms,
            committed_at: Utc::now(),
            actions,
        };

        let json = serde_json::to_vec(&commit).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let commit_rel = Self::commit_rel_path(version);
        storage::write_new(&self.location, &commit_rel, &json)
            .await
            .context(StorageSnafu)?;

        let current_contents = format!("{version}\n");
        self.write_atomic_rel(&Self::current_rel_path(), current_contents.as_bytes())
            .await?;

        Ok(version)
    }

    /// Append `actions` on top of whatever version is current, rebasing when
    /// another writer wins the race.
    ///
    /// Only valid for actions that commute with concurrent commits (fragment
    /// appends and metadata updates). Each lost race is followed by a jittered,
    /// exponentially growing sleep. Only races lost to a published commit
    /// count against `max_attempts`; after that many the call fails with
    /// `RetriesExhausted`.
    ///
    /// A race where the next commit file exists but CURRENT stays put is a
    /// stall. After a few stalled rounds the commit is taken to be orphaned
    /// by a crashed writer and published (see
    /// [`publish_orphan`](Self::publish_orphan)).
    pub async fn commit_with_retries(
        &self,
        timestamp_ms: u64,
        actions: Vec<LogAction>,
        max_attempts: usize,
    ) -> Result<u64, CommitError> {
        let attempts = max_attempts.max(1);
        let mut lost = 0;
        let mut stalls = 0;
        let mut round = 0;
        loop {
            let current = self.load_current_version().await?;
            ensure!(
                current > 0,
                NoCommitsSnafu {
                    location: self.location.to_string(),
                }
            );

            match self
                .commit_with_expected_version(current, timestamp_ms, actions.clone())
                .await
            {
                Ok(version) => return Ok(version),
                Err(e) if e.is_version_race() => {}
                Err(e) => return Err(e),
            }

            if self.load_current_version().await? == current {
                stalls += 1;
                if stalls > STALL_ROUNDS {
                    self.publish_orphan(current).await?;
                    stalls = 0;
                    continue;
                }
            } else {
                stalls = 0;
                lost += 1;
                ensure!(lost < attempts, RetriesExhaustedSnafu { attempts });
                debug!(
                    "commit on top of version {current} lost a race \
                     ({lost}/{attempts}); rebasing"
                );
            }

            round += 1;
            tokio::time::sleep(backoff(round)).await;
        }
    }

    /// Point CURRENT at the commit following `current`, which was written
    /// but never published.
    ///
    /// Fails with `CorruptState` unless that commit parses and was built on
    /// `current`.
    pub async fn publish_orphan(&self, current: u64) -> Result<u64, CommitError> {
        let version = current.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;
        let orphan = self.load_commit(version).await?;
        ensure!(
            orphan.version == version && orphan.base_version == current,
            CorruptStateSnafu {
                msg: format!(
                    "commit {version} claims version {} on base {}, expected base {current}",
                    orphan.version, orphan.base_version
                ),
            }
        );

        let contents = format!("{version}\n");
        self.write_atomic_rel(&Self::current_rel_path(), contents.as_bytes())
            .await?;
        warn!(
            "published orphaned commit {version} under {}",
            self.location
        );
        Ok(version)
    }
}

/// Sleep before retry `round` (1-based): uniform in `[ceiling / 2, ceiling]`
/// where the ceiling doubles each round up to [`MAX_BACKOFF`].
fn backoff(round: u32) -> Duration {
    let ceiling = BASE_BACKOFF
        .saturating_mul(1_u32 << round.saturating_sub(1).min(16))
        .min(MAX_BACKOFF);
    let half = ceiling / 2;
    let span = u64::try_from((ceiling - half).as_micros()).unwrap_or(u64::MAX);

    // Nanosecond clock noise, mixed so concurrent writers spread out.
    let noise = Utc::now().timestamp_subsec_nanos();
    let digest = blake3::hash(&[noise.to_le_bytes(), round.to_le_bytes()].concat());
    let mut word = [0_u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    let jitter = u64::from_le_bytes(word) % span.saturating_add(1);

    half + Duration::from_micros(jitter)
}
