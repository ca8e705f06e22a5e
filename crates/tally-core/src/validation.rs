//! # Validation Module
//!
//! Input rules applied before a record reaches the Local Store. The merge
//! engine never validates: whatever another replica wrote is accepted as is.
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_book_name, validate_currency};
//!
//! validate_book_name("Household").unwrap();
//! validate_currency("EUR").unwrap();
//! assert!(validate_currency("euro").is_err());
//! ```

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::{Book, Category, Entry};
use crate::MAX_ENTRY_TAGS;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_BOOK_NAME: usize = 100;
const MAX_CATEGORY_NAME: usize = 60;
const MAX_TAG: usize = 32;
const MAX_NOTE: usize = 500;

// =============================================================================
// String Validators
// =============================================================================

fn required_within(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    Ok(())
}

/// Book names: 1-100 characters.
pub fn validate_book_name(name: &str) -> ValidationResult<()> {
    required_within("name", name, MAX_BOOK_NAME)
}

/// Category names: 1-60 characters.
pub fn validate_category_name(name: &str) -> ValidationResult<()> {
    required_within("name", name, MAX_CATEGORY_NAME)
}

/// ISO-4217 style code: exactly three uppercase ASCII letters.
///
/// ```rust
/// use tally_core::validation::validate_currency;
///
/// assert!(validate_currency("USD").is_ok());
/// assert!(validate_currency("usd").is_err());
/// assert!(validate_currency("US").is_err());
/// ```
pub fn validate_currency(code: &str) -> ValidationResult<()> {
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: format!("expected a three-letter code such as EUR, got '{}'", code),
        });
    }
    Ok(())
}

/// `#RRGGBB`.
pub fn validate_color(color: &str) -> ValidationResult<()> {
    let ok = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !ok {
        return Err(ValidationError::InvalidFormat {
            field: "color".to_string(),
            reason: "expected #RRGGBB".to_string(),
        });
    }
    Ok(())
}

pub fn validate_tags(tags: &[String]) -> ValidationResult<()> {
    if tags.len() > MAX_ENTRY_TAGS {
        return Err(ValidationError::TooMany {
            field: "tags".to_string(),
            max: MAX_ENTRY_TAGS,
        });
    }
    for tag in tags {
        required_within("tag", tag, MAX_TAG)?;
    }
    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Entry amounts are strictly positive; `kind` carries the direction.
pub fn validate_amount(amount: Money) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "amount".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Record Validators
// =============================================================================

pub fn validate_book(book: &Book) -> ValidationResult<()> {
    validate_book_name(&book.name)?;
    validate_currency(&book.currency)
}

pub fn validate_category(category: &Category) -> ValidationResult<()> {
    validate_category_name(&category.name)?;
    if let Some(color) = &category.color {
        validate_color(color)?;
    }
    if let Some(budget) = &category.budget {
        if !budget.limit.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: "budget limit".to_string(),
            });
        }
    }
    Ok(())
}

pub fn validate_entry(entry: &Entry) -> ValidationResult<()> {
    if entry.book_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "book".to_string(),
        });
    }
    validate_amount(entry.amount)?;
    if let Some(note) = &entry.note {
        if note.chars().count() > MAX_NOTE {
            return Err(ValidationError::TooLong {
                field: "note".to_string(),
                max: MAX_NOTE,
            });
        }
    }
    validate_tags(&entry.tags)
}
