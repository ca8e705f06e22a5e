//! # Structural Equality
//!
//! Field comparison for the merge engine. Reference or representation
//! equality is not good enough once records have crossed the wire:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  local   occurredAt = 2024-03-01T10:00:00+02:00                        │
//! │  remote  occurredAt = 2024-03-01T08:00:00Z                             │
//! │                                                                         │
//! │  Same instant ──► equal ──► no conflict                                │
//! │                                                                         │
//! │  local   budget = { limit: 400.00, period: monthly }                   │
//! │  remote  budget = { limit: 400.00, period: monthly }   (new object)    │
//! │                                                                         │
//! │  Same content ──► equal ──► no conflict                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Record fields are projected into [`FieldValue`] so the merge engine and
//! the conflict log can treat every field the same way.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

// =============================================================================
// StructuralEq
// =============================================================================

/// Equality by content rather than by representation.
pub trait StructuralEq {
    fn structural_eq(&self, other: &Self) -> bool;
}

macro_rules! plain_structural_eq {
    ($($t:ty),*) => {
        $(
            impl StructuralEq for $t {
                #[inline]
                fn structural_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

plain_structural_eq!(bool, i64, String, str, Money);

/// Timestamps compare by instant, whatever offset they carry.
impl<Tz: TimeZone> StructuralEq for DateTime<Tz> {
    fn structural_eq(&self, other: &Self) -> bool {
        self.naive_utc() == other.naive_utc()
    }
}

impl<T: StructuralEq> StructuralEq for Option<T> {
    fn structural_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.structural_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: StructuralEq> StructuralEq for [T] {
    fn structural_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.structural_eq(b))
    }
}

impl<T: StructuralEq> StructuralEq for Vec<T> {
    fn structural_eq(&self, other: &Self) -> bool {
        self.as_slice().structural_eq(other.as_slice())
    }
}

impl<K: Ord, V: StructuralEq> StructuralEq for BTreeMap<K, V> {
    fn structural_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| v.structural_eq(o)))
    }
}

// =============================================================================
// FieldValue
// =============================================================================

/// A record field lifted out of its struct.
///
/// Used for per-field comparison, conflict payloads and conflict resolution.
/// `PartialEq` is structural.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Money(Money),
    Timestamp(DateTime<Utc>),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl StructuralEq for FieldValue {
    fn structural_eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Money(a), Money(b)) => a == b,
            (Timestamp(a), Timestamp(b)) => a.structural_eq(b),
            // Text that carries a timestamp (custom resolution values, legacy
            // payloads) compares by instant.
            (Text(t), Timestamp(ts)) | (Timestamp(ts), Text(t)) => {
                parse_instant(t).is_some_and(|p| p == *ts)
            }
            (Text(a), Text(b)) => {
                a == b
                    || matches!((parse_instant(a), parse_instant(b)), (Some(x), Some(y)) if x == y)
            }
            (List(a), List(b)) => a.structural_eq(b),
            (Map(a), Map(b)) => a.structural_eq(b),
            _ => false,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.structural_eq(other)
    }
}

impl FieldValue {
    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "integer",
            FieldValue::Text(_) => "text",
            FieldValue::Money(_) => "money",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::List(_) => "list",
            FieldValue::Map(_) => "map",
        }
    }

    /// Interprets raw user input: `null` is Null, anything else is Text.
    /// Typed coercion happens when the value is applied to a field.
    pub fn from_input(input: &str) -> Self {
        match input.trim() {
            "null" => FieldValue::Null,
            other => FieldValue::Text(other.to_string()),
        }
    }

    fn mismatch(self, field: &str, expected: &'static str) -> CoreError {
        CoreError::FieldType {
            field: field.to_string(),
            expected,
            actual: self.type_name().to_string(),
        }
    }

    pub fn into_text(self, field: &str) -> CoreResult<String> {
        match self {
            FieldValue::Text(s) => Ok(s),
            other => Err(other.mismatch(field, "text")),
        }
    }

    /// Null and empty text both clear an optional text field.
    pub fn into_optional_text(self, field: &str) -> CoreResult<Option<String>> {
        match self {
            FieldValue::Null => Ok(None),
            FieldValue::Text(s) if s.trim().is_empty() => Ok(None),
            FieldValue::Text(s) => Ok(Some(s)),
            other => Err(other.mismatch(field, "text or null")),
        }
    }

    pub fn into_money(self, field: &str) -> CoreResult<Money> {
        match self {
            FieldValue::Money(m) => Ok(m),
            FieldValue::Text(s) => Ok(s.parse::<Money>()?),
            other => Err(other.mismatch(field, "money")),
        }
    }

    pub fn into_timestamp(self, field: &str) -> CoreResult<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Ok(ts),
            FieldValue::Text(s) => match parse_instant(&s) {
                Some(ts) => Ok(ts),
                None => Err(FieldValue::Text(s).mismatch(field, "RFC 3339 timestamp")),
            },
            other => Err(other.mismatch(field, "timestamp")),
        }
    }

    pub fn into_bool(self, field: &str) -> CoreResult<bool> {
        match self {
            FieldValue::Bool(b) => Ok(b),
            FieldValue::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            FieldValue::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(other.mismatch(field, "bool")),
        }
    }

    /// Lists of text, or comma-separated text.
    pub fn into_text_list(self, field: &str) -> CoreResult<Vec<String>> {
        match self {
            FieldValue::Null => Ok(Vec::new()),
            FieldValue::Text(s) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()),
            FieldValue::List(items) => items
                .into_iter()
                .map(|item| item.into_text(field))
                .collect(),
            other => Err(other.mismatch(field, "list of text")),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Money(m) => write!(f, "{}", m),
            FieldValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            FieldValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            FieldValue::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<Money> for FieldValue {
    fn from(m: Money) -> Self {
        FieldValue::Money(m)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(ts: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(ts)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(FieldValue::Null, Into::into)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(items: Vec<T>) -> Self {
        FieldValue::List(items.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_timestamps_equal_across_offsets() {
        let plus_two = DateTime::parse_from_rfc3339("2024-03-01T10:00:00+02:00").unwrap();
        let utc = DateTime::parse_from_rfc3339("2024-03-01T08:00:00+00:00").unwrap();
        assert!(plus_two.structural_eq(&utc));

        let later: DateTime<FixedOffset> =
            DateTime::parse_from_rfc3339("2024-03-01T08:00:01+00:00").unwrap();
        assert!(!plus_two.structural_eq(&later));
    }

    #[test]
    fn test_text_timestamp_matches_instant() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            FieldValue::Text("2024-03-01T10:00:00+02:00".into()),
            FieldValue::Timestamp(ts)
        );
        assert_eq!(
            FieldValue::Text("2024-03-01T10:00:00+02:00".into()),
            FieldValue::Text("2024-03-01T08:00:00Z".into())
        );
        assert_ne!(FieldValue::Text("lunch".into()), FieldValue::Timestamp(ts));
    }

    #[test]
    fn test_nested_maps_compare_recursively() {
        let budget = |limit: i64, period: &str| {
            let mut map = BTreeMap::new();
            map.insert("limit".to_string(), FieldValue::Money(Money::from_cents(limit)));
            map.insert("period".to_string(), FieldValue::from(period));
            FieldValue::Map(map)
        };

        assert_eq!(budget(40000, "monthly"), budget(40000, "monthly"));
        assert_ne!(budget(40000, "monthly"), budget(40000, "weekly"));
        assert_ne!(budget(40000, "monthly"), budget(30000, "monthly"));
        assert_ne!(budget(40000, "monthly"), FieldValue::Null);
    }

    #[test]
    fn test_lists_compare_element_wise() {
        let a = FieldValue::from(vec!["food", "work"]);
        let b = FieldValue::from(vec!["food", "work"]);
        let reordered = FieldValue::from(vec!["work", "food"]);
        let shorter = FieldValue::from(vec!["food"]);

        assert_eq!(a, b);
        assert_ne!(a, reordered);
        assert_ne!(a, shorter);
    }

    #[test]
    fn test_option_and_map_impls() {
        assert!(Some(3i64).structural_eq(&Some(3)));
        assert!(!Some(3i64).structural_eq(&None));
        assert!(None::<i64>.structural_eq(&None));

        let mut a = BTreeMap::new();
        a.insert("x", 1i64);
        let mut b = a.clone();
        assert!(a.structural_eq(&b));
        b.insert("y", 2);
        assert!(!a.structural_eq(&b));
    }

    #[test]
    fn test_coercions() {
        assert_eq!(
            FieldValue::from_input("12.50").into_money("amount").unwrap(),
            Money::from_cents(1250)
        );
        assert!(FieldValue::from_input("twelve").into_money("amount").is_err());
        assert_eq!(FieldValue::from_input("null").into_optional_text("note").unwrap(), None);
        assert_eq!(
            FieldValue::from_input("food, work").into_text_list("tags").unwrap(),
            vec!["food".to_string(), "work".to_string()]
        );
        assert!(FieldValue::Int(3).into_text("name").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(FieldValue::Money(Money::from_cents(300)).to_string(), "3.00");
        assert_eq!(FieldValue::from("x").to_string(), "\"x\"");
        assert_eq!(FieldValue::from(vec!["a", "b"]).to_string(), "[\"a\", \"b\"]");
        assert_eq!(FieldValue::Null.to_string(), "null");
    }
}
