//! Transaction options for the outer transaction.

use super::DatabaseType;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Isolation level requested for the outer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options passed to [`PhysicalConnection::begin`].
///
/// [`PhysicalConnection::begin`]: crate::db::PhysicalConnection::begin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
}

impl TxOptions {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation: Some(isolation),
        }
    }

    /// Statements that open a transaction with these options, in order.
    ///
    /// MySQL sets the isolation level for the next transaction before starting
    /// it; PostgreSQL takes it inline. SQLite has no per-transaction isolation
    /// and ignores the level.
    pub fn begin_statements(&self, db_type: DatabaseType) -> Vec<String> {
        match (db_type, self.isolation) {
            (DatabaseType::MySQL, Some(level)) => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                db_type.begin_statement().to_string(),
            ],
            (DatabaseType::PostgreSQL, Some(level)) => {
                vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
            }
            _ => vec![db_type.begin_statement().to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_begin_statements() {
        let opts = TxOptions::default();
        assert_eq!(opts.begin_statements(DatabaseType::MySQL), ["START TRANSACTION"]);
        assert_eq!(opts.begin_statements(DatabaseType::PostgreSQL), ["BEGIN"]);
        assert_eq!(opts.begin_statements(DatabaseType::SQLite), ["BEGIN"]);
    }

    #[test]
    fn test_isolation_begin_statements() {
        let opts = TxOptions::with_isolation(IsolationLevel::Serializable);
        assert_eq!(
            opts.begin_statements(DatabaseType::MySQL),
            [
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
                "START TRANSACTION"
            ]
        );
        assert_eq!(
            opts.begin_statements(DatabaseType::PostgreSQL),
            ["BEGIN ISOLATION LEVEL SERIALIZABLE"]
        );
        assert_eq!(opts.begin_statements(DatabaseType::SQLite), ["BEGIN"]);
    }
}
