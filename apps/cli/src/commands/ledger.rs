//! # Ledger Commands
//!
//! Local reads and writes. Every write goes through the `LocalStore`, so it
//! bumps the record version and, with auto-sync on, schedules a sync.

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Subcommand;

use tally_core::{Book, Category, Entity, EntityKind, Entry, EntryKind, FieldValue, Money, Syncable};

use super::{print_json, print_record, print_records};
use crate::App;

#[derive(Debug, Subcommand)]
pub enum BookCommand {
    /// Create a book
    Add {
        name: String,
        /// ISO-4217 currency code
        #[arg(default_value = "EUR")]
        currency: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List books
    List {
        /// Include deleted books
        #[arg(long)]
        all: bool,
    },
    /// Change one field of a book
    Edit { id: String, field: String, value: String },
    /// Delete a book
    Rm { id: String },
}

#[derive(Debug, Subcommand)]
pub enum CategoryCommand {
    /// Create a category
    Add {
        name: String,
        /// expense or income
        #[arg(default_value = "expense")]
        kind: String,
        /// #RRGGBB
        #[arg(long)]
        color: Option<String>,
    },
    /// List categories
    List {
        #[arg(long)]
        all: bool,
    },
    /// Change one field of a category
    Edit { id: String, field: String, value: String },
    /// Delete a category
    Rm { id: String },
}

#[derive(Debug, Subcommand)]
pub enum EntryCommand {
    /// Record an income or expense
    Add {
        book_id: String,
        /// expense or income
        kind: String,
        /// Positive amount, e.g. 12.50
        amount: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// YYYY-MM-DD or RFC 3339 (default: now)
        #[arg(long)]
        date: Option<String>,
    },
    /// List entries
    List {
        /// Only entries of this book
        #[arg(long)]
        book: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Change one field of an entry
    Edit { id: String, field: String, value: String },
    /// Delete an entry
    Rm { id: String },
}

pub async fn book(app: &App, cmd: BookCommand) -> anyhow::Result<()> {
    match cmd {
        BookCommand::Add {
            name,
            currency,
            description,
        } => {
            let mut book = Book::new(name, currency.to_uppercase());
            book.description = description;
            let record = app.store.create(book.into()).await?;
            print_record(app.json, &record)
        }
        BookCommand::List { all } => list(app, EntityKind::Book, all).await,
        BookCommand::Edit { id, field, value } => {
            edit(app, EntityKind::Book, &id, &field, &value).await
        }
        BookCommand::Rm { id } => remove(app, EntityKind::Book, &id).await,
    }
}

pub async fn category(app: &App, cmd: CategoryCommand) -> anyhow::Result<()> {
    match cmd {
        CategoryCommand::Add { name, kind, color } => {
            let mut category = Category::new(name, kind.parse::<EntryKind>()?);
            category.color = color;
            let record = app.store.create(category.into()).await?;
            print_record(app.json, &record)
        }
        CategoryCommand::List { all } => list(app, EntityKind::Category, all).await,
        CategoryCommand::Edit { id, field, value } => {
            edit(app, EntityKind::Category, &id, &field, &value).await
        }
        CategoryCommand::Rm { id } => remove(app, EntityKind::Category, &id).await,
    }
}

pub async fn entry(app: &App, cmd: EntryCommand) -> anyhow::Result<()> {
    match cmd {
        EntryCommand::Add {
            book_id,
            kind,
            amount,
            note,
            category,
            tags,
            date,
        } => {
            app.store
                .require(EntityKind::Book, &book_id)
                .await
                .with_context(|| format!("book {} does not exist", book_id))?;

            let occurred_at = match date {
                Some(date) => parse_date(&date)?,
                None => Utc::now(),
            };
            let mut entry = Entry::new(
                book_id,
                kind.parse::<EntryKind>()?,
                amount.parse::<Money>()?,
                occurred_at,
            );
            entry.note = note;
            entry.category_id = category;
            entry.tags = tags;

            let record = app.store.create(entry.into()).await?;
            print_record(app.json, &record)
        }
        EntryCommand::List { book, all } => {
            let mut records = app.store.get_all(EntityKind::Entry, all).await?;
            if let Some(book_id) = book {
                records.retain(|r| r.as_entry().map(|e| e.book_id == book_id).unwrap_or(false));
            }
            print_records(app.json, &records)
        }
        EntryCommand::Edit { id, field, value } => {
            edit(app, EntityKind::Entry, &id, &field, &value).await
        }
        EntryCommand::Rm { id } => remove(app, EntityKind::Entry, &id).await,
    }
}

pub async fn summary(app: &App, book_id: &str) -> anyhow::Result<()> {
    let summary = app.store.book_summary(book_id).await?;
    if app.json {
        return print_json(&summary);
    }
    println!("Entries: {}", summary.entry_count);
    println!("Income:  {}", summary.income);
    println!("Expense: {}", summary.expense);
    println!("Balance: {}", summary.balance);
    Ok(())
}

async fn list(app: &App, kind: EntityKind, all: bool) -> anyhow::Result<()> {
    let records = app.store.get_all(kind, all).await?;
    print_records(app.json, &records)
}

async fn edit(app: &App, kind: EntityKind, id: &str, field: &str, value: &str) -> anyhow::Result<()> {
    let mut record: Entity = app.store.require(kind, id).await?;
    if record.is_deleted() {
        bail!("{} {} is deleted", kind, id);
    }
    record.set_field(field, FieldValue::from_input(value))?;
    let record = app.store.update(record).await?;
    print_record(app.json, &record)
}

async fn remove(app: &App, kind: EntityKind, id: &str) -> anyhow::Result<()> {
    let record = app.store.soft_delete(kind, id).await?;
    print_record(app.json, &record)
}

fn parse_date(input: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Ok(time.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", input))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("invalid time of day")?;
    Ok(midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_plain_date() {
        assert_eq!(
            parse_date("2024-03-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_rfc3339_date() {
        assert_eq!(
            parse_date("2024-03-01T10:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_bad_date() {
        assert!(parse_date("01/03/2024").is_err());
    }
}
