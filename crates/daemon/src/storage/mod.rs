//! Durable storage backends for session records.

pub mod sqlite;

pub use sqlite::SqliteStore;
