//! # Conflicts
//!
//! A conflict is produced when both replicas changed the same field of the
//! same record since their last exchange, or when one replica deleted a
//! record the other edited. Conflicts never fail a sync round; the merge
//! engine applies a default outcome and reports the conflict so a person
//! can override it later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::equality::FieldValue;
use crate::types::{Entity, EntityKind};

/// Synthetic field name for delete/edit conflicts.
pub const DELETED_FIELD: &str = "deleted";

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ConflictValue {
    /// A field value.
    Value(FieldValue),
    /// This side tombstoned the record.
    Deleted,
    /// This side edited a record the other side deleted.
    Edited,
}

impl fmt::Display for ConflictValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictValue::Value(v) => write!(f, "{}", v),
            ConflictValue::Deleted => f.write_str("DELETED"),
            ConflictValue::Edited => f.write_str("EDITED"),
        }
    }
}

/// Outcome the merge engine applied before anyone looked at the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultResolution {
    RemoteWins,
    DeletionWins,
}

/// A field-level disagreement between the local and the remote copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub field: String,
    pub local_value: ConflictValue,
    pub cloud_value: ConflictValue,
    pub local_version: i64,
    pub cloud_version: i64,
    pub default_resolution: DefaultResolution,
    pub detected_at: DateTime<Utc>,
    /// For delete/edit conflicts: the edited copy, so choosing it can
    /// restore the record exactly as it was edited.
    #[serde(default)]
    pub edited_snapshot: Option<Entity>,
}

impl Conflict {
    /// A field conflict, resolved remote-wins by default.
    pub fn field(
        kind: EntityKind,
        entity_id: &str,
        field: &str,
        local: FieldValue,
        cloud: FieldValue,
        local_version: i64,
        cloud_version: i64,
    ) -> Self {
        Conflict {
            id: Uuid::new_v4().to_string(),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            local_value: ConflictValue::Value(local),
            cloud_value: ConflictValue::Value(cloud),
            local_version,
            cloud_version,
            default_resolution: DefaultResolution::RemoteWins,
            detected_at: Utc::now(),
            edited_snapshot: None,
        }
    }

    /// A delete/edit conflict, resolved deletion-wins by default.
    pub fn deletion(
        kind: EntityKind,
        entity_id: &str,
        local_deleted: bool,
        edited: Entity,
        local_version: i64,
        cloud_version: i64,
    ) -> Self {
        let (local_value, cloud_value) = if local_deleted {
            (ConflictValue::Deleted, ConflictValue::Edited)
        } else {
            (ConflictValue::Edited, ConflictValue::Deleted)
        };
        Conflict {
            id: Uuid::new_v4().to_string(),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            field: DELETED_FIELD.to_string(),
            local_value,
            cloud_value,
            local_version,
            cloud_version,
            default_resolution: DefaultResolution::DeletionWins,
            detected_at: Utc::now(),
            edited_snapshot: Some(edited),
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.field == DELETED_FIELD
    }

    /// The side a choice selects. `Custom` carries its own value.
    pub fn chosen(&self, choice: &ConflictChoice) -> ConflictValue {
        match choice {
            ConflictChoice::Local => self.local_value.clone(),
            ConflictChoice::Remote => self.cloud_value.clone(),
            ConflictChoice::Custom(v) => ConflictValue::Value(v.clone()),
        }
    }
}

/// What a person picked for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum ConflictChoice {
    Local,
    Remote,
    Custom(FieldValue),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::Book;

    #[test]
    fn test_field_conflict_defaults_to_remote() {
        let c = Conflict::field(
            EntityKind::Entry,
            "e-1",
            "amount",
            Money::from_cents(300).into(),
            Money::from_cents(200).into(),
            2,
            2,
        );
        assert_eq!(c.default_resolution, DefaultResolution::RemoteWins);
        assert!(!c.is_deletion());
        assert_eq!(c.local_value.to_string(), "3.00");
        assert_eq!(
            c.chosen(&ConflictChoice::Remote),
            ConflictValue::Value(Money::from_cents(200).into())
        );
    }

    #[test]
    fn test_deletion_conflict_sides() {
        let book = Book::new("Trips", "USD");
        let c = Conflict::deletion(EntityKind::Book, &book.meta.id, false, book.clone().into(), 2, 2);

        assert!(c.is_deletion());
        assert_eq!(c.local_value, ConflictValue::Edited);
        assert_eq!(c.cloud_value, ConflictValue::Deleted);
        assert_eq!(c.default_resolution, DefaultResolution::DeletionWins);
        assert_eq!(c.edited_snapshot, Some(Entity::Book(book)));
    }

    #[test]
    fn test_conflict_json_round_trip() {
        let c = Conflict::field(
            EntityKind::Category,
            "c-1",
            "name",
            "Food".into(),
            "Groceries".into(),
            3,
            4,
        );
        let text = serde_json::to_string(&c).unwrap();
        let back: Conflict = serde_json::from_str(&text).unwrap();
        assert_eq!(back, c);
    }
}
