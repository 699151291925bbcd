//! Connection-related data models.
//!
//! This module defines the database backends, the modes a connection can be
//! borrowed in, transaction states and the pool health snapshot.

use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How a connection was obtained for a call.
///
/// Implicit modes borrow a connection for exactly one call; the explicit mode
/// hands the connection to a caller-supplied block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMode {
    Explicit,
    ImplicitQuery,
    ImplicitTransaction,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "EXPLICIT",
            Self::ImplicitQuery => "IMPLICIT_QUERY",
            Self::ImplicitTransaction => "IMPLICIT_TRANSACTION",
        }
    }

    pub fn is_implicit(&self) -> bool {
        !matches!(self, Self::Explicit)
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Started,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Check if the transaction is still open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Point-in-time view of pool health. Recomputed on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub active_connection_count: usize,
    pub idle_connection_count: usize,
    pub waiting_client_count: usize,
    pub ended: bool,
}
