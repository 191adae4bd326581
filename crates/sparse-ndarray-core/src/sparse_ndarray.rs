//! The sparse N-dimensional array handle.
//!
//! A [`SparseNDArray`] is a stable object over one array URI. It is either
//! closed or bound to exactly one session:
//!
//! ```text
//!            open(Read)                    open(Write)
//!   Closed ─────────────▶ OpenRead   Closed ─────────────▶ OpenWrite
//!     ▲                      │          ▲                      │
//!     └──────── close ───────┘          └──── close (commit) ──┘
//! ```
//!
//! There is no direct OpenRead ↔ OpenWrite transition: [`SparseNDArray::reopen`]
//! always closes first, committing any pending writes.
//!
//! The public API is blocking. Engine work runs on the shared runtime from
//! [`crate::runtime::global_runtime`], so handles must not be used from inside
//! one of that runtime's tasks.
//!
//! Reads are lazy: the state snapshot is taken at open, but fragments are only
//! read on the first [`SparseNDArray::read_next`]. Writes are buffered and
//! flushed into fragment files as they accumulate; all of a session's
//! fragments and metadata changes become visible together in one commit at
//! [`SparseNDArray::close`].
pub mod buffers;
pub mod error;
mod key_value;
mod read;
mod write;

pub use buffers::BufferBatch;
pub use error::{ArrayError, ArrayResult, HandleState};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use log::{debug, info, warn};
use snafu::prelude::*;
use tokio::runtime::Runtime;

use crate::config::{Context, TimestampWindow};
use crate::engine::query::{self, ResultOrder, ScanPlan};
use crate::engine::{CommitSnafu, EngineError, FragmentWriter};
use crate::metadata::array_meta::{ENCODING_VERSION, ENCODING_VERSION_KEY, OBJECT_TYPE_KEY};
use crate::metadata::{ArrayKind, ArrayMeta, MetadataValue, SchemaDescriptor};
use crate::runtime::global_runtime;
use crate::storage::ArrayLocation;
use crate::transaction_log::{ArrayState, CommitError, LogAction, TransactionLogStore};

use error::{
    AlreadyExistsSnafu, InvalidIndexColumnSnafu, InvalidStateSnafu, LocationSnafu,
    NotFoundSnafu, ReadFailureSnafu, RuntimeSnafu, SessionAbortedSnafu, WriteFailureSnafu,
    WrongArrayKindSnafu,
};
use read::{Pull, ReadCursor, ReadSession};
use write::{WriteSession, conform_batch};

/// Access mode requested at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read cells and metadata.
    Read,
    /// Write cells and metadata.
    Write,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Read => f.write_str("read"),
            OpenMode::Write => f.write_str("write"),
        }
    }
}

/// Optional parameters bound at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Dimension names to return and order by; empty means every dimension
    /// in schema order.
    pub column_names: Vec<String>,
    /// Order of cells returned by reads.
    pub result_order: ResultOrder,
    /// Timestamp window; defaults to the context's window.
    pub timestamp: Option<TimestampWindow>,
}

impl OpenOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select index columns.
    pub fn with_column_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the result order.
    pub fn with_result_order(mut self, order: ResultOrder) -> Self {
        self.result_order = order;
        self
    }

    /// Set the timestamp window.
    pub fn with_timestamp(mut self, window: TimestampWindow) -> Self {
        self.timestamp = Some(window);
        self
    }
}

#[derive(Debug)]
enum Session {
    Closed,
    Read(ReadSession),
    Write(WriteSession),
}

/// Handle over a sparse, attribute-bearing N-dimensional array.
#[derive(Debug)]
pub struct SparseNDArray {
    uri: String,
    location: ArrayLocation,
    log: TransactionLogStore,
    context: Context,
    schema: Arc<SchemaDescriptor>,
    column_names: Vec<String>,
    result_order: ResultOrder,
    runtime: Arc<Runtime>,
    session: Session,
}

impl SparseNDArray {
    /// Create a new, empty array at `uri` and return it opened for read.
    ///
    /// Fails with [`ArrayError::AlreadyExists`] if an array is already present,
    /// including when another creator wins a race for the same URI.
    pub fn create(uri: &str, schema: SchemaDescriptor, context: &Context) -> ArrayResult<Self> {
        let (location, runtime, log) = Self::resolve(uri)?;
        let window = context.resolve_window(None);

        let actions = vec![
            LogAction::CreateArray(ArrayMeta::new_sparse(schema)),
            LogAction::PutMetadata {
                key: OBJECT_TYPE_KEY.to_string(),
                value: MetadataValue::from(ArrayKind::Sparse.object_type()),
            },
            LogAction::PutMetadata {
                key: ENCODING_VERSION_KEY.to_string(),
                value: MetadataValue::from(ENCODING_VERSION),
            },
        ];

        let created = runtime.block_on(async {
            if log.has_commits().await? {
                return Ok(false);
            }
            log.commit_with_expected_version(0, window.end(), actions)
                .await
                .map(|_| true)
        });

        match created {
            Ok(true) => info!("created sparse array at {uri}"),
            Ok(false) => return AlreadyExistsSnafu { uri }.fail(),
            Err(e) if e.is_version_race() => return AlreadyExistsSnafu { uri }.fail(),
            Err(source) => {
                return Err(ArrayError::Create {
                    uri: uri.to_string(),
                    source: EngineError::Commit { source },
                });
            }
        }

        Self::bind(
            uri,
            location,
            runtime,
            log,
            context,
            OpenMode::Read,
            OpenOptions::new().with_timestamp(window),
        )
    }

    /// Open an existing array with default options.
    pub fn open(uri: &str, mode: OpenMode, context: &Context) -> ArrayResult<Self> {
        Self::open_with(uri, mode, context, OpenOptions::default())
    }

    /// Open an existing array.
    ///
    /// Fails with [`ArrayError::NotFound`] when nothing exists at `uri`,
    /// [`ArrayError::WrongArrayKind`] for non-sparse arrays and
    /// [`ArrayError::InvalidIndexColumn`] when `options.column_names` names a
    /// non-dimension or repeats a name.
    pub fn open_with(
        uri: &str,
        mode: OpenMode,
        context: &Context,
        options: OpenOptions,
    ) -> ArrayResult<Self> {
        let (location, runtime, log) = Self::resolve(uri)?;
        Self::bind(uri, location, runtime, log, context, mode, options)
    }

    /// Whether an array of any kind exists at `uri`.
    pub fn exists(uri: &str, _context: &Context) -> ArrayResult<bool> {
        let (_, runtime, log) = Self::resolve(uri)?;
        runtime
            .block_on(log.has_commits())
            .map_err(|source| ArrayError::Open {
                uri: uri.to_string(),
                source: EngineError::Commit { source },
            })
    }

    fn resolve(uri: &str) -> ArrayResult<(ArrayLocation, Arc<Runtime>, TransactionLogStore)> {
        let location = ArrayLocation::parse(uri).context(LocationSnafu)?;
        let runtime = global_runtime().context(RuntimeSnafu)?;
        let log = TransactionLogStore::new(location.clone());
        Ok((location, runtime, log))
    }

    fn bind(
        uri: &str,
        location: ArrayLocation,
        runtime: Arc<Runtime>,
        log: TransactionLogStore,
        context: &Context,
        mode: OpenMode,
        options: OpenOptions,
    ) -> ArrayResult<Self> {
        let window = context.resolve_window(options.timestamp);
        let state = load_state(&runtime, &log, uri, window)?;

        let kind = state.meta.kind;
        ensure!(kind == ArrayKind::Sparse, WrongArrayKindSnafu { kind });

        let schema = Arc::new(state.meta.schema.clone());
        let column_names = validate_index_columns(&schema, options.column_names)?;

        let mut array = Self {
            uri: uri.to_string(),
            location,
            log,
            context: context.clone(),
            schema,
            column_names,
            result_order: options.result_order,
            runtime,
            session: Session::Closed,
        };
        array.session = array.start_session(mode, window, state);
        debug!("opened {uri} for {mode} at {window}");
        Ok(array)
    }

    fn start_session(&self, mode: OpenMode, window: TimestampWindow, state: ArrayState) -> Session {
        let config = self.context.config();
        match mode {
            OpenMode::Read => {
                let plan = ScanPlan {
                    location: self.location.clone(),
                    fragments: state.fragments.clone(),
                    schema: Arc::clone(&self.schema),
                    index_columns: self.column_names.clone(),
                    order: self.result_order,
                    batch_cells: config.read_batch_cells,
                };
                Session::Read(ReadSession {
                    window,
                    state,
                    cursor: ReadCursor::new(plan),
                })
            }
            OpenMode::Write => {
                let writer = FragmentWriter::new(
                    self.location.clone(),
                    &self.schema,
                    window.end(),
                    config.compression,
                    config.write_flush_cells,
                );
                Session::Write(WriteSession::new(window, writer, state.metadata))
            }
        }
    }

    /// Close the handle and bind it again in `mode`.
    ///
    /// The handle always passes through Closed: a write session is committed
    /// first, and if that commit or the new bind fails the handle stays
    /// closed. `timestamp` defaults to the context's window.
    pub fn reopen(
        &mut self,
        mode: OpenMode,
        timestamp: Option<TimestampWindow>,
    ) -> ArrayResult<()> {
        self.close()?;

        let window = self.context.resolve_window(timestamp);
        let state = load_state(&self.runtime, &self.log, &self.uri, window)?;
        self.session = self.start_session(mode, window, state);
        debug!("reopened {} for {mode} at {window}", self.uri);
        Ok(())
    }

    /// Release the session, committing pending writes.
    ///
    /// Idempotent. The handle is closed afterwards even when an error is
    /// returned: [`ArrayError::WriteFailure`] if the final flush or commit
    /// failed, [`ArrayError::SessionAborted`] if an earlier write failure
    /// aborted the session.
    pub fn close(&mut self) -> ArrayResult<()> {
        match std::mem::replace(&mut self.session, Session::Closed) {
            Session::Closed => Ok(()),
            Session::Read(_) => {
                debug!("closed {} (read)", self.uri);
                Ok(())
            }
            Session::Write(session) => self.commit_session(session),
        }
    }

    fn commit_session(&self, session: WriteSession) -> ArrayResult<()> {
        ensure!(!session.aborted, SessionAbortedSnafu);

        let WriteSession {
            window,
            writer,
            metadata_actions,
            ..
        } = session;
        let retries = self.context.config().commit_retries;

        let committed = self
            .runtime
            .block_on(async {
                let fragments = writer.finish().await?;
                let mut actions: Vec<LogAction> =
                    fragments.into_iter().map(LogAction::AddFragment).collect();
                actions.extend(metadata_actions);
                if actions.is_empty() {
                    return Ok(None);
                }
                let count = actions.len();
                let version = self
                    .log
                    .commit_with_retries(window.end(), actions, retries)
                    .await
                    .context(CommitSnafu)?;
                Ok::<_, EngineError>(Some((version, count)))
            })
            .context(WriteFailureSnafu)?;

        match committed {
            Some((version, count)) => info!(
                "committed version {version} with {count} actions to {} at stamp {}",
                self.uri,
                window.end()
            ),
            None => debug!("closed {} (write, nothing to commit)", self.uri),
        }
        Ok(())
    }

    /// URI the handle was opened with.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Schema descriptor.
    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    /// Arrow schema of stored cells: dimensions, then attributes.
    pub fn arrow_schema(&self) -> SchemaRef {
        self.schema.arrow_schema()
    }

    /// Capacity of each dimension in schema order.
    pub fn shape(&self) -> Vec<i64> {
        self.schema.shape()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.schema.ndim()
    }

    /// Always `true`.
    pub fn is_sparse(&self) -> bool {
        true
    }

    /// `"SOMASparseNDArray"`.
    pub fn object_type(&self) -> &'static str {
        ArrayKind::Sparse.object_type()
    }

    /// Mode of the bound session, if any.
    pub fn mode(&self) -> Option<OpenMode> {
        match self.session {
            Session::Closed => None,
            Session::Read(_) => Some(OpenMode::Read),
            Session::Write(_) => Some(OpenMode::Write),
        }
    }

    /// Whether a session is bound.
    pub fn is_open(&self) -> bool {
        !matches!(self.session, Session::Closed)
    }

    /// Detailed lifecycle state.
    pub fn state(&self) -> HandleState {
        match &self.session {
            Session::Closed => HandleState::Closed,
            Session::Read(s) if s.cursor.is_failed() => HandleState::ReadFailed,
            Session::Read(_) => HandleState::OpenRead,
            Session::Write(s) if s.aborted => HandleState::WriteAborted,
            Session::Write(_) => HandleState::OpenWrite,
        }
    }

    /// Effective timestamp window while open.
    pub fn timestamp(&self) -> Option<TimestampWindow> {
        match &self.session {
            Session::Closed => None,
            Session::Read(s) => Some(s.window),
            Session::Write(s) => Some(s.window),
        }
    }

    /// Selected index columns; empty means all dimensions.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Result order bound at open.
    pub fn result_order(&self) -> ResultOrder {
        self.result_order
    }

    /// Context the handle was opened with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn read_session(&self, operation: &'static str) -> ArrayResult<&ReadSession> {
        match &self.session {
            Session::Read(s) => Ok(s),
            _ => InvalidStateSnafu {
                operation,
                state: self.state(),
            }
            .fail(),
        }
    }

    /// Number of distinct populated coordinates visible to this read handle.
    pub fn nnz(&self) -> ArrayResult<u64> {
        let session = self.read_session("count cells")?;
        self.runtime
            .block_on(query::count_cells(
                &self.location,
                &session.state.fragments,
                &self.schema,
            ))
            .context(ReadFailureSnafu)
    }

    /// Per-dimension `(min, max)` of populated coordinates, or `None` for an
    /// empty array.
    pub fn non_empty_domain(&self) -> ArrayResult<Option<Vec<(i64, i64)>>> {
        let session = self.read_session("read the non-empty domain")?;
        Ok(query::non_empty_domain(
            &session.state.fragments,
            self.schema.ndim(),
        ))
    }

    /// Next batch of results, or `None` once the read is exhausted.
    pub fn read_next(&mut self) -> ArrayResult<Option<BufferBatch>> {
        let state = self.state();
        let Session::Read(session) = &mut self.session else {
            return InvalidStateSnafu {
                operation: "read",
                state,
            }
            .fail();
        };

        match session.cursor.next_batch(&self.runtime) {
            Ok(Pull::Batch(batch)) => Ok(Some(BufferBatch::from_record_batch(&batch))),
            Ok(Pull::Done) => Ok(None),
            Ok(Pull::Poisoned) => InvalidStateSnafu {
                operation: "read",
                state: HandleState::ReadFailed,
            }
            .fail(),
            Err(source) => {
                warn!("read of {} failed: {source}", self.uri);
                Err(ArrayError::ReadFailure { source })
            }
        }
    }

    /// Validate and stage a batch of cells for the current write session.
    ///
    /// A rejected batch leaves earlier batches untouched. An engine failure
    /// while flushing aborts the session.
    pub fn write(&mut self, batch: BufferBatch) -> ArrayResult<()> {
        let state = self.state();
        let Session::Write(session) = &mut self.session else {
            return InvalidStateSnafu {
                operation: "write",
                state,
            }
            .fail();
        };
        ensure!(
            !session.aborted,
            InvalidStateSnafu {
                operation: "write",
                state,
            }
        );

        let cells = conform_batch(&self.schema, batch)?;
        if cells.num_rows() == 0 {
            return Ok(());
        }

        if let Err(source) = self.runtime.block_on(session.writer.push(cells)) {
            session.aborted = true;
            warn!("write to {} failed, aborting session: {source}", self.uri);
            return Err(ArrayError::WriteFailure { source });
        }
        Ok(())
    }
}

impl Drop for SparseNDArray {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing {} on drop failed: {e}", self.uri);
        }
    }
}

fn load_state(
    runtime: &Runtime,
    log: &TransactionLogStore,
    uri: &str,
    window: TimestampWindow,
) -> ArrayResult<ArrayState> {
    match runtime.block_on(log.rebuild_array_state(Some(window))) {
        Ok(state) => Ok(state),
        Err(CommitError::NoCommits { .. }) => NotFoundSnafu { uri }.fail(),
        Err(source) => Err(ArrayError::Open {
            uri: uri.to_string(),
            source: EngineError::Commit { source },
        }),
    }
}

fn validate_index_columns(
    schema: &SchemaDescriptor,
    names: Vec<String>,
) -> ArrayResult<Vec<String>> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in &names {
        ensure!(
            schema.dimension(name).is_some() && seen.insert(name.as_str()),
            InvalidIndexColumnSnafu {
                column: name.clone(),
            }
        );
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::engine::test_util::{TestResult, cells, triples, two_dim_schema};
    use tempfile::TempDir;

    fn uri(tmp: &TempDir) -> String {
        tmp.path().join("array").display().to_string()
    }

    fn write_cells(array: &mut SparseNDArray, rows: &[(i64, i64, f64)]) -> ArrayResult<()> {
        let batch = cells(&array.arrow_schema(), rows).map_err(|e| ArrayError::MalformedBatch {
            reason: e.to_string(),
        })?;
        array.write(BufferBatch::from(batch))
    }

    #[test]
    fn state_tracks_the_bound_session() -> TestResult {
        let tmp = TempDir::new()?;
        let ctx = Context::new();
        let mut array = SparseNDArray::create(&uri(&tmp), two_dim_schema(), &ctx)?;
        assert_eq!(array.state(), HandleState::OpenRead);
        assert_eq!(array.mode(), Some(OpenMode::Read));
        assert!(array.timestamp().is_some());

        array.reopen(OpenMode::Write, None)?;
        assert_eq!(array.state(), HandleState::OpenWrite);

        array.close()?;
        assert_eq!(array.state(), HandleState::Closed);
        assert_eq!(array.mode(), None);
        assert!(array.timestamp().is_none());
        array.close()?;
        Ok(())
    }

    #[test]
    fn flush_failure_aborts_the_write_session() -> TestResult {
        let tmp = TempDir::new()?;
        let uri = uri(&tmp);
        let ctx = Context::new().with_config(PlatformConfig::default().with_write_flush_cells(1));
        SparseNDArray::create(&uri, two_dim_schema(), &ctx)?;

        // A plain file where the fragments directory should go.
        std::fs::write(tmp.path().join("array").join("fragments"), b"")?;

        let mut array = SparseNDArray::open(&uri, OpenMode::Write, &ctx)?;
        let err = write_cells(&mut array, &[(0, 0, 1.0)]).expect_err("flush fails");
        assert!(matches!(err, ArrayError::WriteFailure { .. }));
        assert!(err.is_retryable());
        assert_eq!(array.state(), HandleState::WriteAborted);

        let err = write_cells(&mut array, &[(1, 1, 1.0)]).expect_err("aborted");
        assert!(matches!(
            err,
            ArrayError::InvalidState {
                state: HandleState::WriteAborted,
                ..
            }
        ));
        assert!(matches!(
            array.set_metadata("k", 1_i64),
            Err(ArrayError::InvalidState { .. })
        ));

        assert!(matches!(array.close(), Err(ArrayError::SessionAborted)));
        assert_eq!(array.state(), HandleState::Closed);

        let reader = SparseNDArray::open(&uri, OpenMode::Read, &ctx)?;
        assert_eq!(reader.nnz()?, 0);
        Ok(())
    }

    #[test]
    fn lost_fragment_poisons_the_read_cursor() -> TestResult {
        let tmp = TempDir::new()?;
        let uri = uri(&tmp);
        let ctx = Context::new();
        SparseNDArray::create(&uri, two_dim_schema(), &ctx)?;

        let mut writer = SparseNDArray::open(&uri, OpenMode::Write, &ctx)?;
        write_cells(&mut writer, &[(0, 0, 1.0), (1, 2, 3.0)])?;
        writer.close()?;

        let mut reader = SparseNDArray::open(&uri, OpenMode::Read, &ctx)?;
        std::fs::remove_dir_all(tmp.path().join("array").join("fragments"))?;

        let err = reader.read_next().expect_err("fragment is gone");
        assert!(matches!(err, ArrayError::ReadFailure { .. }));
        assert_eq!(reader.state(), HandleState::ReadFailed);
        assert!(matches!(
            reader.read_next(),
            Err(ArrayError::InvalidState {
                state: HandleState::ReadFailed,
                ..
            })
        ));

        reader.close()?;
        assert_eq!(reader.state(), HandleState::Closed);
        Ok(())
    }

    #[test]
    fn reopen_for_read_sees_committed_cells() -> TestResult {
        let tmp = TempDir::new()?;
        let ctx = Context::new();
        let mut array = SparseNDArray::create(&uri(&tmp), two_dim_schema(), &ctx)?;

        array.reopen(OpenMode::Write, None)?;
        write_cells(&mut array, &[(3, 4, 0.5)])?;
        array.reopen(OpenMode::Read, None)?;

        let batch = array.read_next()?.expect("one batch");
        let batch = batch.into_record_batch()?;
        assert_eq!(triples(&batch), vec![(3, 4, 0.5)]);
        assert!(array.read_next()?.is_none());
        assert!(array.read_next()?.is_none());
        Ok(())
    }

    #[test]
    fn index_columns_must_be_distinct_dimensions() {
        let schema = two_dim_schema();
        assert!(validate_index_columns(&schema, vec!["y".into(), "x".into()]).is_ok());
        assert!(matches!(
            validate_index_columns(&schema, vec!["v".into()]),
            Err(ArrayError::InvalidIndexColumn { column }) if column == "v"
        ));
        assert!(matches!(
            validate_index_columns(&schema, vec!["x".into(), "x".into()]),
            Err(ArrayError::InvalidIndexColumn { column }) if column == "x"
        ));
    }
}
