//! Backend dispatch macros.
//!
//! `DriverConnection` has one variant per sqlx backend; these macros expand
//! the per-variant match so callers only write each arm's body once.

/// Match on a `DriverConnection`, binding the inner connection as `$conn`
/// and the backend's operation module as `$ops`.
///
/// ```ignore
/// dispatch_driver!(&mut self.inner, conn, ops => ops::query(conn, query).await)
/// ```
#[macro_export]
macro_rules! dispatch_driver {
    ($driver:expr, $conn:ident, $ops:ident => $body:expr) => {
        match $driver {
            $crate::db::connection::DriverConnection::MySql($conn) => {
                use $crate::db::connection::mysql_ops as $ops;
                $body
            }
            $crate::db::connection::DriverConnection::Postgres($conn) => {
                use $crate::db::connection::postgres_ops as $ops;
                $body
            }
            $crate::db::connection::DriverConnection::SQLite($conn) => {
                use $crate::db::connection::sqlite_ops as $ops;
                $body
            }
        }
    };
}

pub use crate::dispatch_driver;
