//! # Syncable Records
//!
//! The capability every synchronized record shares: sync metadata plus a
//! uniform view of its domain fields. The merge engine and the conflict
//! surface only ever talk to records through this trait.

use chrono::Utc;
use std::collections::BTreeMap;

use crate::equality::FieldValue;
use crate::error::{CoreError, CoreResult};
use crate::types::{Book, Budget, Category, Entity, EntityKind, Entry, SyncMeta};

/// A record that takes part in synchronization.
pub trait Syncable {
    fn kind(&self) -> EntityKind;

    fn meta(&self) -> &SyncMeta;

    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Domain fields in declaration order. Sync metadata is not included.
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Replaces one domain field, coercing text input where the field type
    /// allows it.
    fn set_field(&mut self, field: &str, value: FieldValue) -> CoreResult<()>;

    fn id(&self) -> &str {
        &self.meta().id
    }

    fn version(&self) -> i64 {
        self.meta().version
    }

    fn last_synced_version(&self) -> Option<i64> {
        self.meta().last_synced_version
    }

    fn is_deleted(&self) -> bool {
        self.meta().deleted
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        self.fields()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// True when the record changed since its last exchange.
    fn has_unsynced_changes(&self) -> bool {
        self.version() > self.last_synced_version().unwrap_or(0)
    }

    /// Records one local mutation.
    fn touch(&mut self) {
        let meta = self.meta_mut();
        meta.version += 1;
        meta.updated_at = Utc::now();
    }

    /// Sets the tombstone. The caller bumps the version.
    fn mark_deleted(&mut self) {
        let meta = self.meta_mut();
        if !meta.deleted {
            meta.deleted = true;
            meta.deleted_at = Some(Utc::now());
        }
    }

    /// Clears the tombstone. The caller bumps the version.
    fn clear_deleted(&mut self) {
        let meta = self.meta_mut();
        meta.deleted = false;
        meta.deleted_at = None;
    }
}

fn unknown(kind: EntityKind, field: &str) -> CoreError {
    CoreError::UnknownField {
        kind,
        field: field.to_string(),
    }
}

// =============================================================================
// Book
// =============================================================================

impl Syncable for Book {
    fn kind(&self) -> EntityKind {
        EntityKind::Book
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.clone().into()),
            ("currency", self.currency.clone().into()),
            ("description", self.description.clone().into()),
        ]
    }

    fn set_field(&mut self, field: &str, value: FieldValue) -> CoreResult<()> {
        match field {
            "name" => self.name = value.into_text(field)?,
            "currency" => self.currency = value.into_text(field)?.to_uppercase(),
            "description" => self.description = value.into_optional_text(field)?,
            _ => return Err(unknown(EntityKind::Book, field)),
        }
        Ok(())
    }
}

// =============================================================================
// Entry
// =============================================================================

impl Syncable for Entry {
    fn kind(&self) -> EntityKind {
        EntityKind::Entry
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("bookId", self.book_id.clone().into()),
            ("categoryId", self.category_id.clone().into()),
            ("kind", self.kind.as_str().into()),
            ("amount", self.amount.into()),
            ("note", self.note.clone().into()),
            ("occurredAt", self.occurred_at.into()),
            ("tags", self.tags.clone().into()),
        ]
    }

    fn set_field(&mut self, field: &str, value: FieldValue) -> CoreResult<()> {
        match field {
            "bookId" => self.book_id = value.into_text(field)?,
            "categoryId" => self.category_id = value.into_optional_text(field)?,
            "kind" => self.kind = value.into_text(field)?.parse()?,
            "amount" => self.amount = value.into_money(field)?,
            "note" => self.note = value.into_optional_text(field)?,
            "occurredAt" => self.occurred_at = value.into_timestamp(field)?,
            "tags" => self.tags = value.into_text_list(field)?,
            _ => return Err(unknown(EntityKind::Entry, field)),
        }
        Ok(())
    }
}

// =============================================================================
// Category
// =============================================================================

fn budget_to_field(budget: &Option<Budget>) -> FieldValue {
    match budget {
        None => FieldValue::Null,
        Some(b) => {
            let mut map = BTreeMap::new();
            map.insert("limit".to_string(), FieldValue::Money(b.limit));
            map.insert("period".to_string(), FieldValue::from(b.period.as_str()));
            FieldValue::Map(map)
        }
    }
}

/// Accepts a map, null, or `"<limit>/<period>"` text such as `400/monthly`.
fn budget_from_field(value: FieldValue) -> CoreResult<Option<Budget>> {
    const FIELD: &str = "budget";
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Map(mut map) => {
            let limit = map
                .remove("limit")
                .ok_or_else(|| unknown(EntityKind::Category, "budget.limit"))?
                .into_money("budget.limit")?;
            let period = map
                .remove("period")
                .ok_or_else(|| unknown(EntityKind::Category, "budget.period"))?
                .into_text("budget.period")?
                .parse()?;
            Ok(Some(Budget { limit, period }))
        }
        FieldValue::Text(s) => match s.split_once('/') {
            Some((limit, period)) => Ok(Some(Budget {
                limit: limit.parse()?,
                period: period.trim().parse()?,
            })),
            None => Err(CoreError::FieldType {
                field: FIELD.to_string(),
                expected: "limit/period",
                actual: s,
            }),
        },
        other => Err(CoreError::FieldType {
            field: FIELD.to_string(),
            expected: "budget",
            actual: other.type_name().to_string(),
        }),
    }
}

impl Syncable for Category {
    fn kind(&self) -> EntityKind {
        EntityKind::Category
    }

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.clone().into()),
            ("kind", self.kind.as_str().into()),
            ("color", self.color.clone().into()),
            ("budget", budget_to_field(&self.budget)),
        ]
    }

    fn set_field(&mut self, field: &str, value: FieldValue) -> CoreResult<()> {
        match field {
            "name" => self.name = value.into_text(field)?,
            "kind" => self.kind = value.into_text(field)?.parse()?,
            "color" => self.color = value.into_optional_text(field)?,
            "budget" => self.budget = budget_from_field(value)?,
            _ => return Err(unknown(EntityKind::Category, field)),
        }
        Ok(())
    }
}

// =============================================================================
// Entity
// =============================================================================

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Entity::Book($inner) => $body,
            Entity::Entry($inner) => $body,
            Entity::Category($inner) => $body,
        }
    };
}

impl Syncable for Entity {
    fn kind(&self) -> EntityKind {
        delegate!(self, r => r.kind())
    }

    fn meta(&self) -> &SyncMeta {
        delegate!(self, r => r.meta())
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        delegate!(self, r => r.meta_mut())
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        delegate!(self, r => r.fields())
    }

    fn set_field(&mut self, field: &str, value: FieldValue) -> CoreResult<()> {
        delegate!(self, r => r.set_field(field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::{BudgetPeriod, EntryKind};

    #[test]
    fn test_touch_increments_version_by_one() {
        let mut book = Book::new("Household", "EUR");
        let before = book.meta.updated_at;
        for expected in 2..=5 {
            book.touch();
            assert_eq!(book.version(), expected);
        }
        assert!(book.meta.updated_at >= before);
    }

    #[test]
    fn test_unsynced_changes() {
        let mut book = Book::new("Household", "EUR");
        assert!(book.has_unsynced_changes());
        book.meta.last_synced_version = Some(1);
        assert!(!book.has_unsynced_changes());
        book.touch();
        assert!(book.has_unsynced_changes());
    }

    #[test]
    fn test_tombstone_keeps_metadata() {
        let mut entity = Entity::Book(Book::new("Old", "EUR"));
        entity.mark_deleted();
        entity.touch();
        assert!(entity.is_deleted());
        assert!(entity.meta().deleted_at.is_some());
        assert_eq!(entity.version(), 2);

        entity.clear_deleted();
        assert!(!entity.is_deleted());
        assert!(entity.meta().deleted_at.is_none());
    }

    #[test]
    fn test_entry_set_field_coerces_text() {
        let mut entry = Entry::new("b", EntryKind::Expense, Money::from_cents(100), Utc::now());
        entry.set_field("amount", FieldValue::from("3.00")).unwrap();
        entry.set_field("kind", FieldValue::from("income")).unwrap();
        entry.set_field("note", FieldValue::Null).unwrap();
        entry.set_field("tags", FieldValue::from("a,b")).unwrap();

        assert_eq!(entry.amount.cents(), 300);
        assert_eq!(entry.kind, EntryKind::Income);
        assert_eq!(entry.note, None);
        assert_eq!(entry.tags, vec!["a", "b"]);
        assert!(entry.set_field("colour", FieldValue::Null).is_err());
    }

    #[test]
    fn test_category_budget_field() {
        let mut category = Category::new("Groceries", EntryKind::Expense);
        category.set_field("budget", FieldValue::from("400/monthly")).unwrap();
        assert_eq!(
            category.budget,
            Some(Budget {
                limit: Money::from_cents(40000),
                period: BudgetPeriod::Monthly
            })
        );

        let as_field = category.field("budget").unwrap();
        let mut copy = Category::new("Copy", EntryKind::Expense);
        copy.set_field("budget", as_field).unwrap();
        assert_eq!(copy.budget, category.budget);

        copy.set_field("budget", FieldValue::Null).unwrap();
        assert_eq!(copy.budget, None);
    }

    #[test]
    fn test_fields_exclude_metadata() {
        let book = Entity::Book(Book::new("Household", "EUR"));
        let names: Vec<_> = book.fields().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["name", "currency", "description"]);
    }
}
