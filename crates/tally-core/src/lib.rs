//! # tally-core: Pure Domain Logic for Tally
//!
//! Records, money and the merge engine. Nothing in this crate touches a
//! disk, a socket or a clock other than `Utc::now()`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    apps/cli (tally)                             │   │
//! │  │    book add ──► entry add ──► sync ──► conflicts ──► resolve   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   tally-sync: SyncAgent, Orchestrator, RemoteStore, Notifier    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ equality  │  │   merge   │  │ conflict  │  │   │
//! │  │   │ Book      │  │Structural │  │ 3-way     │  │ Conflict  │  │   │
//! │  │   │ Entry     │  │   Eq      │  │ per id    │  │ Choice    │  │   │
//! │  │   │ Category  │  │FieldValue │  │           │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tally-db (Local Store)                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Books, entries, categories and their sync metadata
//! - [`syncable`] - The capability shared by every synchronized record
//! - [`equality`] - Structural equality and the `FieldValue` model
//! - [`merge`] - Three-way merge of one record pair
//! - [`conflict`] - Conflict records and resolution choices
//! - [`money`] - Integer money
//! - [`validation`] - Input rules for collaborator-facing forms
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::{merge, Book, Entity, Syncable};
//!
//! let mut ours = Book::new("Household", "EUR");
//! ours.meta.last_synced_version = Some(1);
//! let theirs = ours.clone();
//!
//! ours.name = "Home".into();
//! ours.touch();
//!
//! let outcome = merge(&Entity::Book(ours), &Entity::Book(theirs)).unwrap();
//! assert!(outcome.conflicts.is_empty());
//! assert_eq!(outcome.merged.version(), 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod equality;
pub mod error;
pub mod merge;
pub mod money;
pub mod syncable;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{Conflict, ConflictChoice, ConflictValue, DefaultResolution, DELETED_FIELD};
pub use equality::{FieldValue, StructuralEq};
pub use error::{CoreError, CoreResult, ValidationError};
pub use merge::{merge, merge_with, MergeOutcome, Resolutions};
pub use money::Money;
pub use syncable::Syncable;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum number of tags on a single entry.
pub const MAX_ENTRY_TAGS: usize = 16;
