//! User key/value metadata on the array handle.
//!
//! Reads see the snapshot taken at open. A write session sees its own
//! changes immediately; other handles see them only after `close` commits.
use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::metadata::MetadataValue;
use crate::metadata::array_meta::is_reserved_key;
use crate::sparse_ndarray::error::{
    ArrayResult, InvalidMetadataValueSnafu, InvalidStateSnafu, ReservedMetadataKeySnafu,
};
use crate::sparse_ndarray::write::WriteSession;
use crate::sparse_ndarray::{HandleState, Session, SparseNDArray};
use crate::transaction_log::LogAction;

impl SparseNDArray {
    /// All metadata visible to the open session, reserved keys included.
    pub fn metadata(&self) -> ArrayResult<BTreeMap<String, MetadataValue>> {
        self.metadata_view("read metadata").cloned()
    }

    /// Value for `key`, if set.
    pub fn metadata_value(&self, key: &str) -> ArrayResult<Option<MetadataValue>> {
        Ok(self.metadata_view("read metadata")?.get(key).cloned())
    }

    /// Set a user metadata key. Requires a write session.
    ///
    /// Keys starting with `soma_` are reserved. Floats must be finite.
    pub fn set_metadata(&mut self, key: &str, value: impl Into<MetadataValue>) -> ArrayResult<()> {
        let value = value.into();
        check_key(key)?;
        if let MetadataValue::Float64(f) = value {
            ensure!(
                f.is_finite(),
                InvalidMetadataValueSnafu {
                    key,
                    reason: format!("{f} is not a finite number"),
                }
            );
        }

        let session = self.metadata_session("set metadata")?;
        session.metadata.insert(key.to_string(), value.clone());
        session.metadata_actions.push(LogAction::PutMetadata {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Delete a user metadata key. Deleting an absent key is not an error.
    pub fn delete_metadata(&mut self, key: &str) -> ArrayResult<()> {
        check_key(key)?;

        let session = self.metadata_session("delete metadata")?;
        if session.metadata.remove(key).is_some() {
            session.metadata_actions.push(LogAction::DeleteMetadata {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn metadata_view(
        &self,
        operation: &'static str,
    ) -> ArrayResult<&BTreeMap<String, MetadataValue>> {
        match &self.session {
            Session::Read(s) => Ok(&s.state.metadata),
            Session::Write(s) => Ok(&s.metadata),
            Session::Closed => InvalidStateSnafu {
                operation,
                state: HandleState::Closed,
            }
            .fail(),
        }
    }

    fn metadata_session(&mut self, operation: &'static str) -> ArrayResult<&mut WriteSession> {
        let state = self.state();
        match &mut self.session {
            Session::Write(s) if !s.aborted => Ok(s),
            _ => InvalidStateSnafu { operation, state }.fail(),
        }
    }
}

fn check_key(key: &str) -> ArrayResult<()> {
    ensure!(
        !key.is_empty(),
        InvalidMetadataValueSnafu {
            key,
            reason: "key must not be empty",
        }
    );
    ensure!(!is_reserved_key(key), ReservedMetadataKeySnafu { key });
    Ok(())
}
