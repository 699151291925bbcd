//! DB Pool Facade Library
//!
//! A uniform query and transaction API in front of a database connection pool
//! (SQLite, PostgreSQL, MySQL). Every verb runs either on a connection borrowed
//! for the single call or on a connection the caller already holds, and the
//! pool can be drained gracefully without racing new work.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{ClientConfiguration, Config};
pub use db::{BoundConnection, ConnectionSource, DatabasePool, Queryable, open_pool};
pub use error::{DbError, DbResult};
