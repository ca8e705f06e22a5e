//! # Remote Document
//!
//! The per-user document exchanged with the remote store.
//!
//! ```text
//! {
//!   "books":      [ {record}, ... ],
//!   "entries":    [ {record}, ... ],
//!   "categories": [ {record}, ... ],
//!   "lastSyncAt": "2026-03-01T10:00:00Z"      // assigned by the writer
//! }
//! ```
//!
//! Collections are held as raw JSON so a record this build cannot decode is
//! still carried back on upload instead of being erased.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncResult;
use tally_core::{Entity, EntityKind, Syncable};

/// Whole remote state for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    #[serde(default)]
    pub books: Vec<Value>,
    #[serde(default)]
    pub entries: Vec<Value>,
    #[serde(default)]
    pub categories: Vec<Value>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// One collection split into records that decoded and raw leftovers.
#[derive(Debug, Default)]
pub struct DecodedCollection {
    pub records: Vec<Entity>,
    pub undecodable: Vec<Value>,
}

impl RemoteDocument {
    pub fn collection(&self, kind: EntityKind) -> &[Value] {
        match kind {
            EntityKind::Book => &self.books,
            EntityKind::Entry => &self.entries,
            EntityKind::Category => &self.categories,
        }
    }

    pub fn set_collection(&mut self, kind: EntityKind, records: Vec<Value>) {
        match kind {
            EntityKind::Book => self.books = records,
            EntityKind::Entry => self.entries = records,
            EntityKind::Category => self.categories = records,
        }
    }

    /// Decodes one collection record by record. Records that fail are kept
    /// raw and logged.
    pub fn decode(&self, kind: EntityKind) -> DecodedCollection {
        let mut out = DecodedCollection::default();
        for raw in self.collection(kind) {
            match Entity::from_json(kind, raw.clone()) {
                Ok(entity) => out.records.push(entity),
                Err(e) => {
                    warn!(
                        kind = %kind,
                        id = raw_id(raw).unwrap_or("<unknown>"),
                        error = %e,
                        "Skipping undecodable remote record"
                    );
                    out.undecodable.push(raw.clone());
                }
            }
        }
        out
    }

    pub fn record_count(&self) -> usize {
        self.books.len() + self.entries.len() + self.categories.len()
    }
}

/// Encodes merged records for upload, appending the raw records that could
/// not be decoded. A raw record whose id is also among `records` is dropped.
pub fn encode_collection(records: &[Entity], undecodable: &[Value]) -> SyncResult<Vec<Value>> {
    let mut out = Vec::with_capacity(records.len() + undecodable.len());
    for record in records {
        out.push(record.to_json()?);
    }
    for raw in undecodable {
        match raw_id(raw) {
            Some(id) if records.iter().any(|r| r.id() == id) => {
                warn!(id = %id, "Dropping undecodable remote copy shadowed by a local record");
            }
            _ => out.push(raw.clone()),
        }
    }
    Ok(out)
}

fn raw_id(raw: &Value) -> Option<&str> {
    raw.get("id").and_then(Value::as_str)
}
