//! # Domain Types
//!
//! The three synchronized record types and the metadata they share.
//!
//! ## Record Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ┌──────────────┐  1      *  ┌──────────────┐  *     0..1 ┌─────────┐ │
//! │   │     Book     │────────────│    Entry     │─────────────│Category │ │
//! │   │ name         │  book_id   │ kind, amount │ category_id │ budget  │ │
//! │   │ currency     │            │ occurred_at  │  (lookup)   │ color   │ │
//! │   └──────────────┘            └──────────────┘             └─────────┘ │
//! │                                                                         │
//! │   Every record flattens a SyncMeta:                                    │
//! │   id · version · lastSyncedVersion · deleted · deletedAt ·             │
//! │   createdAt · updatedAt                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shape
//! Records serialize in camelCase with explicit `null` for absent optionals.
//! Timestamps are written as RFC 3339 strings and read from either RFC 3339
//! strings or epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::money::Money;

// =============================================================================
// Entity Kind
// =============================================================================

/// The closed set of synchronized collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Book,
    Entry,
    Category,
}

impl EntityKind {
    /// Every collection, in the order a sync round processes them.
    pub const ALL: [EntityKind; 3] = [EntityKind::Book, EntityKind::Category, EntityKind::Entry];

    /// Name of the collection in the remote document and the local table.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Book => "books",
            EntityKind::Entry => "entries",
            EntityKind::Category => "categories",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Book => "book",
            EntityKind::Entry => "entry",
            EntityKind::Category => "category",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "book" | "books" => Ok(EntityKind::Book),
            "entry" | "entries" => Ok(EntityKind::Entry),
            "category" | "categories" => Ok(EntityKind::Category),
            other => Err(ValidationError::InvalidFormat {
                field: "kind".to_string(),
                reason: format!("unknown record kind '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Metadata carried by every synchronized record.
///
/// ## Version Lifecycle
/// ```text
/// create        version=1  lastSyncedVersion=None
///   │
/// edit          version=2
///   │
/// sync          version=2  lastSyncedVersion=2   (exchanged)
///   │
/// delete        version=3  deleted=true          (tombstone, kept forever)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// UUID v4, never reused.
    pub id: String,

    /// Incremented by exactly one on every local mutation.
    pub version: i64,

    /// Version last exchanged with the remote store. The implicit merge base.
    #[serde(default)]
    pub last_synced_version: Option<i64>,

    #[serde(default)]
    pub deleted: bool,

    #[serde(default, deserialize_with = "flexible_time::option")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(deserialize_with = "flexible_time::required")]
    pub created_at: DateTime<Utc>,

    #[serde(deserialize_with = "flexible_time::required")]
    pub updated_at: DateTime<Utc>,
}

impl SyncMeta {
    /// Metadata for a brand-new record: fresh id, version 1, never synced.
    pub fn new() -> Self {
        let now = Utc::now();
        SyncMeta {
            id: Uuid::new_v4().to_string(),
            version: 1,
            last_synced_version: None,
            deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Enumerations
// =============================================================================

/// Direction of money flow for an entry or category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Expense,
    Income,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Expense => "expense",
            EntryKind::Income => "income",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expense" | "out" => Ok(EntryKind::Expense),
            "income" | "in" => Ok(EntryKind::Income),
            other => Err(ValidationError::InvalidFormat {
                field: "kind".to_string(),
                reason: format!("expected expense or income, got '{}'", other),
            }),
        }
    }
}

/// Budget reset period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Weekly,
    Monthly,
    Yearly,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Yearly => "yearly",
        }
    }
}

impl FromStr for BudgetPeriod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weekly" | "week" => Ok(BudgetPeriod::Weekly),
            "monthly" | "month" => Ok(BudgetPeriod::Monthly),
            "yearly" | "year" => Ok(BudgetPeriod::Yearly),
            other => Err(ValidationError::InvalidFormat {
                field: "period".to_string(),
                reason: format!("expected weekly, monthly or yearly, got '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A ledger. Owns many entries; carries the currency they are recorded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub name: String,

    /// ISO-4217 code.
    pub currency: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl Book {
    pub fn new(name: impl Into<String>, currency: impl Into<String>) -> Self {
        Book {
            meta: SyncMeta::new(),
            name: name.into(),
            currency: currency.into(),
            description: None,
        }
    }
}

/// A single transaction in a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub book_id: String,

    /// Weak reference; a dangling id renders as "uncategorized".
    #[serde(default)]
    pub category_id: Option<String>,

    pub kind: EntryKind,

    /// Always positive; direction comes from `kind`.
    pub amount: Money,

    #[serde(default)]
    pub note: Option<String>,

    #[serde(deserialize_with = "flexible_time::required")]
    pub occurred_at: DateTime<Utc>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl Entry {
    pub fn new(
        book_id: impl Into<String>,
        kind: EntryKind,
        amount: Money,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Entry {
            meta: SyncMeta::new(),
            book_id: book_id.into(),
            category_id: None,
            kind,
            amount,
            note: None,
            occurred_at,
            tags: Vec::new(),
        }
    }

    /// Amount with the sign implied by `kind` (income positive).
    pub fn signed_amount(&self) -> Money {
        match self.kind {
            EntryKind::Income => self.amount,
            EntryKind::Expense => -self.amount,
        }
    }
}

/// Spending limit attached to a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub limit: Money,
    pub period: BudgetPeriod,
}

/// A classification for entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    #[serde(flatten)]
    pub meta: SyncMeta,

    pub name: String,

    pub kind: EntryKind,

    /// `#RRGGBB`.
    #[serde(default)]
    pub color: Option<String>,

    #[serde(default)]
    pub budget: Option<Budget>,
}

impl Category {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Category {
            meta: SyncMeta::new(),
            name: name.into(),
            kind,
            color: None,
            budget: None,
        }
    }
}

// =============================================================================
// Entity (closed union)
// =============================================================================

/// Any synchronized record.
///
/// The tagged form (`{"kind": "entry", "record": {...}}`) is only used where a
/// record is stored outside its own collection, such as the edited side of a
/// delete/edit conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Book(Book),
    Entry(Entry),
    Category(Category),
}

impl Entity {
    /// Decodes one record of a known collection from its untagged JSON form.
    pub fn from_json(kind: EntityKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::Book => Entity::Book(serde_json::from_value(value)?),
            EntityKind::Entry => Entity::Entry(serde_json::from_value(value)?),
            EntityKind::Category => Entity::Category(serde_json::from_value(value)?),
        })
    }

    /// Encodes the record without the kind tag.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Entity::Book(b) => serde_json::to_value(b),
            Entity::Entry(e) => serde_json::to_value(e),
            Entity::Category(c) => serde_json::to_value(c),
        }
    }

    pub fn as_book(&self) -> Option<&Book> {
        match self {
            Entity::Book(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            Entity::Entry(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<&Category> {
        match self {
            Entity::Category(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Book> for Entity {
    fn from(b: Book) -> Self {
        Entity::Book(b)
    }
}

impl From<Entry> for Entity {
    fn from(e: Entry) -> Self {
        Entity::Entry(e)
    }
}

impl From<Category> for Entity {
    fn from(c: Category) -> Self {
        Entity::Category(c)
    }
}

// =============================================================================
// Book Summary
// =============================================================================

/// Totals over the live entries of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BookSummary {
    pub income: Money,
    pub expense: Money,
    pub balance: Money,
    pub entry_count: usize,
}

/// Sums entries, skipping tombstones.
pub fn summarize<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> BookSummary {
    let mut summary = BookSummary::default();
    for entry in entries.into_iter().filter(|e| !e.meta.deleted) {
        match entry.kind {
            EntryKind::Income => summary.income += entry.amount,
            EntryKind::Expense => summary.expense += entry.amount,
        }
        summary.entry_count += 1;
    }
    summary.balance = summary.income - summary.expense;
    summary
}

// =============================================================================
// Timestamp decoding
// =============================================================================

/// Accepts RFC 3339 strings (any offset) or epoch milliseconds.
pub(crate) mod flexible_time {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    fn convert<E: de::Error>(raw: Raw) -> Result<DateTime<Utc>, E> {
        match raw {
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| E::custom(format!("invalid timestamp '{}': {}", s, e))),
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {}", ms))),
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        convert(Raw::deserialize(d)?)
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(convert).transpose()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
