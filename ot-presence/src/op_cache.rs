//! Version-indexed buffer of ops applied while a stale remote value catches up.
//!
//! ```text
//!  pending.v = 2            document.version = 5
//!       │                           │
//!       ▼                           ▼
//!   ┌───────┬───────┬───────┐
//!   │ v2→v3 │ v3→v4 │ v4→v5 │   entries keyed by the version they advance *from*
//!   │  op   │ Reset │  op   │
//!   └───────┴───────┴───────┘
//! ```
//!
//! Versions are gapless, so replay walks the map one key at a time and stops
//! at the first missing key.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::PresenceError;
use crate::ot::{transform_in_place, PresenceType};

/// One cached document change.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedOp {
    Operation { op: Value, is_own_op: bool },
    /// Create or delete: the presence no longer means anything.
    Reset,
}

#[derive(Debug, Clone, Default)]
pub struct OpCache {
    entries: BTreeMap<u64, CachedOp>,
}

impl OpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the change that advanced the document from `version` to
    /// `version + 1`.
    pub fn insert(&mut self, version: u64, entry: CachedOp) {
        self.entries.insert(version, entry);
    }

    pub fn get(&self, version: u64) -> Option<&CachedOp> {
        self.entries.get(&version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advance `value` from `version` through every consecutive cached entry.
    ///
    /// Returns the version reached and the transformed value. A `Reset`
    /// clears the value; an absent value is carried forward without calling
    /// the type.
    pub fn replay(
        &self,
        mut version: u64,
        mut value: Option<Value>,
        doc_type: Option<&dyn PresenceType>,
    ) -> Result<(u64, Option<Value>), PresenceError> {
        while let Some(entry) = self.entries.get(&version) {
            match entry {
                CachedOp::Reset => value = None,
                CachedOp::Operation { .. } if value.is_none() => {}
                CachedOp::Operation { op, is_own_op } => {
                    let doc_type = doc_type.ok_or(PresenceError::DocumentNotCreated)?;
                    transform_in_place(doc_type, &mut value, op, *is_own_op)?;
                }
            }
            log::trace!("Replayed cached op v{version} -> v{}", version + 1);
            version += 1;
        }
        Ok((version, value))
    }
}
