//! # tutorlink-store
//!
//! The remote document store the messaging core talks to, expressed as the
//! [`DocumentStore`] trait, with two backends:
//!
//! - [`MemoryStore`]: in-process, with write-failure and broken-subscription
//!   injection.
//! - [`SqliteStore`]: durable local file on SQLite, with migrations.
//!
//! Both serve live queries through the shared [`live`] module.

pub mod database;
pub mod live;
pub mod memory;
pub mod migrations;
pub mod models;
mod records;
pub mod store;

mod error;

pub use database::SqliteStore;
pub use error::{Result, StoreError};
pub use live::{Emission, LiveQuery, Snapshot, WatchId, WatchToken};
pub use memory::MemoryStore;
pub use models::*;
pub use store::DocumentStore;
