//! # CLI Commands
//!
//! ```text
//! commands/
//! ├── mod.rs      ◄─── You are here (output helpers)
//! ├── ledger.rs   ◄─── Books, categories, entries, summaries
//! └── sync.rs     ◄─── Sync, conflicts, auto-sync, status
//! ```
//!
//! Every command prints either a short human-readable line per item or,
//! with `--json`, one pretty-printed JSON document.

pub mod ledger;
pub mod sync;

use serde::Serialize;
use tally_core::{Entity, Syncable};

/// Prints `value` as JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line description of a record.
pub fn describe(entity: &Entity) -> String {
    let body = match entity {
        Entity::Book(book) => format!("{} ({})", book.name, book.currency),
        Entity::Category(category) => format!("{} [{}]", category.name, category.kind),
        Entity::Entry(entry) => {
            let mut line = format!(
                "{} {} {} {}",
                entry.occurred_at.format("%Y-%m-%d"),
                entry.kind,
                entry.amount,
                entry.book_id
            );
            if let Some(note) = &entry.note {
                line.push_str(&format!(" \"{}\"", note));
            }
            line
        }
    };

    let mut flags = String::new();
    if entity.is_deleted() {
        flags.push_str(" (deleted)");
    } else if entity.has_unsynced_changes() {
        flags.push_str(" *");
    }
    format!("{}  v{}  {}{}", entity.id(), entity.version(), body, flags)
}

/// Prints records, one per line or as a JSON array.
pub fn print_records(json: bool, records: &[Entity]) -> anyhow::Result<()> {
    if json {
        return print_json(records);
    }
    if records.is_empty() {
        println!("(none)");
    }
    for record in records {
        println!("{}", describe(record));
    }
    Ok(())
}

/// Prints one record.
pub fn print_record(json: bool, record: &Entity) -> anyhow::Result<()> {
    if json {
        print_json(record)
    } else {
        println!("{}", describe(record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_core::{Book, Entry, EntryKind, Money};

    #[test]
    fn test_describe_entry() {
        let mut entry = Entry::new(
            "b-1",
            EntryKind::Expense,
            Money::from_major_minor(12, 50),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        );
        entry.note = Some("lunch".to_string());
        let line = describe(&entry.into());
        assert!(line.contains("2024-03-01 expense 12.50 b-1 \"lunch\""));
        assert!(line.ends_with('*'));
    }

    #[test]
    fn test_describe_tombstone() {
        let mut book: Entity = Book::new("Household", "EUR").into();
        book.mark_deleted();
        assert!(describe(&book).ends_with("(deleted)"));
    }
}
