//! Storage module for persistent data storage
//!
//! Provides SQLite-based persistence for jobs and dead letters.

mod database;

pub use database::{JobStore, StoredJob};
