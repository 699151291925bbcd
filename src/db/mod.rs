//! Database orchestration layer.
//!
//! This module provides:
//! - The raw pool boundary and a FIFO pool implementation
//! - The connection executor boundary and its sqlx implementation
//! - Row decoding, parameter binding and binary COPY encoding
//! - Connection sources and the query verbs built on them
//! - The pool handle, explicit connections, transactions and shutdown

pub mod bound;
pub mod connection;
pub mod copy;
pub mod executor;
pub mod lifecycle;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod raw_pool;
pub mod shutdown;
pub mod source;
pub mod transaction;
pub mod types;

pub use bound::BoundConnection;
pub use connection::{DbConnection, DriverConnection, SqlxConnector};
pub use executor::{ConnectionExecutor, RowHandler};
pub use lifecycle::PoolLifecycle;
pub use pool::{DatabasePool, PoolLease};
pub use raw_pool::{ConnectionRemoved, Connector, ManagedPool, PhysicalConnection, RawPool};
pub use shutdown::drain;
pub use source::{ConnectionSource, Queryable};

/// Pool handle over sqlx connections, as built by [`open_pool`].
pub type SqlxPool = DatabasePool<ManagedPool<SqlxConnector>>;

/// Build a pool handle for one database.
///
/// No connection is opened until the first call needs one. Fails with a
/// validation error when `config` cannot back a pool.
pub fn open_pool(
    db: &crate::config::DatabaseConfig,
    config: crate::config::ClientConfiguration,
) -> crate::error::DbResult<SqlxPool> {
    config.validate()?;
    let connector = SqlxConnector::new(db, &config)?;
    let raw = ManagedPool::new(connector, config.max_connections, config.acquire_timeout);
    Ok(DatabasePool::new(raw, config))
}
