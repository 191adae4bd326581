//! Reconstructing array state by replaying log commits.
//!
//! [`ArrayState`] is the snapshot a handle binds at open time: the array
//! metadata, the fragments visible under a timestamp window, and the key/value
//! metadata as of that window.
use std::collections::{BTreeMap, HashSet};

use crate::config::TimestampWindow;
use crate::metadata::{ArrayMeta, FragmentMeta, MetadataValue};
use crate::transaction_log::*;

/// In-memory view of an array reconstructed from the log.
///
/// Invariant: `fragments` and `metadata` are the result of applying, in version
/// order, the bootstrap commit and every later commit whose stamp lies in the
/// window the state was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayState {
    /// Latest committed version recorded in CURRENT at rebuild time.
    pub version: u64,
    /// Array-level metadata from the bootstrap commit.
    pub meta: ArrayMeta,
    /// Visible fragments in commit order (oldest first).
    pub fragments: Vec<FragmentMeta>,
    /// Visible key/value metadata.
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl TransactionLogStore {
    /// Rebuild array state by replaying commits up to CURRENT.
    ///
    /// With `window = None` every commit is applied. Otherwise commit 1 is
    /// always applied and later commits only when `window` contains their
    /// stamp.
    ///
    /// Fails with `NoCommits` when the log is empty and `CorruptState` when the
    /// bootstrap commit does not create the array.
    pub async fn rebuild_array_state(
        &self,
        window: Option<TimestampWindow>,
    ) -> Result<ArrayState, CommitError> {
        let current_version = self.load_current_version().await?;
        ensure!(
            current_version > 0,
            NoCommitsSnafu {
                location: self.location().to_string(),
            }
        );

        let mut meta: Option<ArrayMeta> = None;
        let mut fragments: Vec<FragmentMeta> = Vec::new();
        let mut seen = HashSet::new();
        let mut metadata = BTreeMap::new();

        for v in 1..=current_version {
            let commit = self.load_commit(v).await?;

            if commit.version != v {
                return CorruptStateSnafu {
                    msg: format!(
                        "Commit version mismatch: expected {v}, found {} in payload",
                        commit.version
                    ),
                }
                .fail();
            }

            let visible = v == 1 || window.is_none_or(|w| w.contains(commit.timestamp_ms));
            if !visible {
                continue;
            }

            for action in commit.actions {
                match action {
                    LogAction::CreateArray(m) => meta = Some(m),
                    LogAction::AddFragment(fragment) => {
                        // The same content-addressed file can be committed twice;
                        // it keeps the position of its latest commit.
                        if !seen.insert(fragment.fragment_id.clone()) {
                            fragments.retain(|f| f.fragment_id != fragment.fragment_id);
                        }
                        fragments.push(fragment);
                    }
                    LogAction::PutMetadata { key, value } => {
                        metadata.insert(key, value);
                    }
                    LogAction::DeleteMetadata { key } => {
                        metadata.remove(&key);
                    }
                }
            }

            if v == 1 && meta.is_none() {
                return CorruptStateSnafu {
                    msg: "bootstrap commit does not create the array".to_string(),
                }
                .fail();
            }
        }

        let meta = meta.context(CorruptStateSnafu {
            msg: format!("No array metadata found in commits up to version {current_version}"),
        })?;

        Ok(ArrayState {
            version: current_version,
            meta,
            fragments,
            metadata,
        })
    }

    /// Whether the log holds at least one commit.
    pub async fn has_commits(&self) -> Result<bool, CommitError> {
        Ok(self.load_current_version().await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Dimension, FileFormat, FragmentId, LogicalDataType, SchemaDescriptor};
    use crate::storage::ArrayLocation;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log_store() -> (TempDir, TransactionLogStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let store = TransactionLogStore::new(ArrayLocation::local(tmp.path()));
        (tmp, store)
    }

    fn sample_meta() -> ArrayMeta {
        let schema = SchemaDescriptor::new(
            vec![Dimension::new("x", LogicalDataType::Int64, 0, 99)],
            vec![],
        )
        .expect("valid schema");
        ArrayMeta::new_sparse(schema)
    }

    fn fragment(id: &str) -> FragmentMeta {
        FragmentMeta {
            fragment_id: FragmentId(id.to_string()),
            path: format!("fragments/{id}.parquet"),
            format: FileFormat::Parquet,
            cell_count: 1,
            bounds: vec![(0, 0)],
            file_size: 0,
        }
    }

    fn put(key: &str, value: i64) -> LogAction {
        LogAction::PutMetadata {
            key: key.to_string(),
            value: MetadataValue::Int64(value),
        }
    }

    #[tokio::test]
    async fn rebuild_on_empty_log_is_no_commits() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        let err = store.rebuild_array_state(None).await.expect_err("empty log");
        assert!(matches!(err, CommitError::NoCommits { .. }));
        assert!(!store.has_commits().await?);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_applies_actions_in_order() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        store
            .commit_with_expected_version(0, 5, vec![LogAction::CreateArray(sample_meta())])
            .await?;
        store
            .commit_with_expected_version(
                1,
                10,
                vec![
                    LogAction::AddFragment(fragment("a")),
                    put("k", 1),
                    put("gone", 1),
                ],
            )
            .await?;
        store
            .commit_with_expected_version(
                2,
                20,
                vec![
                    LogAction::AddFragment(fragment("b")),
                    LogAction::AddFragment(fragment("a")),
                    put("k", 2),
                    LogAction::DeleteMetadata {
                        key: "gone".to_string(),
                    },
                ],
            )
            .await?;

        let state = store.rebuild_array_state(None).await?;
        assert_eq!(state.version, 3);
        let ids: Vec<_> = state
            .fragments
            .iter()
            .map(|f| f.fragment_id.0.as_str())
            .collect();
        // A re-added fragment moves to its latest commit position.
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(state.metadata.get("k"), Some(&MetadataValue::Int64(2)));
        assert!(!state.metadata.contains_key("gone"));
        Ok(())
    }

    #[tokio::test]
    async fn window_filters_later_commits_but_keeps_bootstrap() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        store
            .commit_with_expected_version(0, 100, vec![LogAction::CreateArray(sample_meta())])
            .await?;
        store
            .commit_with_expected_version(1, 10, vec![LogAction::AddFragment(fragment("t10"))])
            .await?;
        store
            .commit_with_expected_version(2, 20, vec![LogAction::AddFragment(fragment("t20"))])
            .await?;

        let only_first = store
            .rebuild_array_state(Some(TimestampWindow::until(15)))
            .await?;
        assert_eq!(only_first.fragments.len(), 1);
        assert_eq!(only_first.fragments[0].fragment_id.0, "t10");

        let only_second = store
            .rebuild_array_state(Some(TimestampWindow::new(15, 25)?))
            .await?;
        assert_eq!(only_second.fragments.len(), 1);
        assert_eq!(only_second.fragments[0].fragment_id.0, "t20");

        // The bootstrap commit applies even though its stamp is outside the window.
        let none = store
            .rebuild_array_state(Some(TimestampWindow::until(5)))
            .await?;
        assert!(none.fragments.is_empty());
        assert_eq!(none.meta.schema.ndim(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn bootstrap_without_create_is_corrupt() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        store.commit_with_expected_version(0, 1, vec![]).await?;

        let err = store.rebuild_array_state(None).await.expect_err("corrupt");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }
}
