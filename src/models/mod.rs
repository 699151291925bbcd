//! Data models for the pool facade.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionMode, DatabaseType, PoolSnapshot, TransactionState};
pub use query::{ColumnType, Field, QueryParam, QueryResult, Row, SqlQuery, SqlToken};
