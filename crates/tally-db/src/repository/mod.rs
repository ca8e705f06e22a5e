//! # Repository Module
//!
//! SQL access for the Local Store, one repository per concern.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LocalStore / SyncOrchestrator                                         │
//! │       │                                                                 │
//! │       │  db.records(EntityKind::Entry).list(true)                      │
//! │       ▼                                                                 │
//! │  RecordRepository        (books / entries / categories)                │
//! │  ├── list, find                                                        │
//! │  ├── insert, mutate      (version + 1 in the same transaction)         │
//! │  ├── replace_all         (whole collection, one transaction)           │
//! │  └── mark_synced, snapshots                                            │
//! │                                                                         │
//! │  SettingsRepository      (auto-sync flag, last sync time)              │
//! │  ConflictRepository      (persisted conflict log)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod conflicts;
pub mod records;
pub mod settings;
