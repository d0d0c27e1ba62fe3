//! sqlx-backed driver adapter.
//!
//! Provides [`PhysicalConnection`] for single MySQL, PostgreSQL and SQLite
//! connections, plus the [`Connector`] and [`Driver`] that open them. The
//! backend is chosen explicitly or detected from the URL scheme; DSN parsing is
//! left to sqlx's connect options.

use crate::db::capability::{Capability, PhysicalConnection};
use crate::db::connector::{Connector, Driver};
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{
    DatabaseType, DriverIdentity, ExecuteResult, JsonRow, QueryParam, TxOptions,
    masked_connection_string,
};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection as _;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// A single sqlx connection (never pooled).
#[derive(Debug)]
pub enum SqlxConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl SqlxConnection {
    /// Get the database type for this connection.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            SqlxConnection::MySql(_) => DatabaseType::MySQL,
            SqlxConnection::Postgres(_) => DatabaseType::PostgreSQL,
            SqlxConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }

    async fn execute_unprepared(&mut self, sql: &str) -> DbResult<ExecuteResult> {
        let result = match self {
            SqlxConnection::MySql(conn) => {
                let r = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
                ExecuteResult::new(r.rows_affected(), mysql_insert_id(r.last_insert_id()))
            }
            SqlxConnection::Postgres(conn) => {
                let r = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
                ExecuteResult::new(r.rows_affected(), None)
            }
            SqlxConnection::SQLite(conn) => {
                let r = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
                ExecuteResult::new(r.rows_affected(), sqlite_insert_id(r.last_insert_rowid()))
            }
        };
        Ok(result)
    }

    async fn execute_prepared(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecuteResult> {
        let result = match self {
            SqlxConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                let r = query.execute(&mut *conn).await?;
                ExecuteResult::new(r.rows_affected(), mysql_insert_id(r.last_insert_id()))
            }
            SqlxConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                let r = query.execute(&mut *conn).await?;
                ExecuteResult::new(r.rows_affected(), None)
            }
            SqlxConnection::SQLite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                let r = query.execute(&mut *conn).await?;
                ExecuteResult::new(r.rows_affected(), sqlite_insert_id(r.last_insert_rowid()))
            }
        };
        Ok(result)
    }
}

fn mysql_insert_id(id: u64) -> Option<i64> {
    i64::try_from(id).ok().filter(|id| *id != 0)
}

fn sqlite_insert_id(id: i64) -> Option<i64> {
    Some(id).filter(|id| *id != 0)
}

#[async_trait]
impl PhysicalConnection for SqlxConnection {
    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Ping,
            Capability::Execute,
            Capability::Query,
            Capability::BeginTransaction,
            Capability::Close,
        ]
    }

    fn supports_multi_statements(&self) -> bool {
        // The MySQL text protocol only accepts one statement unless the
        // server session enables CLIENT_MULTI_STATEMENTS.
        !matches!(self, SqlxConnection::MySql(_))
    }

    async fn ping(&mut self) -> DbResult<()> {
        match self {
            SqlxConnection::MySql(conn) => conn.ping().await?,
            SqlxConnection::Postgres(conn) => conn.ping().await?,
            SqlxConnection::SQLite(conn) => conn.ping().await?,
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        let result = if params.is_empty() {
            self.execute_unprepared(sql).await?
        } else {
            self.execute_prepared(sql, params).await?
        };
        debug!(
            sql = %sql,
            rows_affected = result.rows_affected,
            "Executed statement"
        );
        Ok(result)
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let rows: Vec<JsonRow> = match self {
            SqlxConnection::MySql(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_mysql_param(query, param);
                }
                let rows = query.fetch_all(&mut *conn).await?;
                rows.iter().map(|r| r.to_json_map()).collect()
            }
            SqlxConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                let rows = query.fetch_all(&mut *conn).await?;
                rows.iter().map(|r| r.to_json_map()).collect()
            }
            SqlxConnection::SQLite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                let rows = query.fetch_all(&mut *conn).await?;
                rows.iter().map(|r| r.to_json_map()).collect()
            }
        };

        debug!(sql = %sql, row_count = rows.len(), "Queried");
        Ok(rows)
    }

    async fn begin(&mut self, options: &TxOptions) -> DbResult<()> {
        for statement in options.begin_statements(self.db_type()) {
            self.execute_unprepared(&statement).await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute_unprepared("ROLLBACK").await.map(|_| ())
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        match *self {
            SqlxConnection::MySql(conn) => conn.close().await?,
            SqlxConnection::Postgres(conn) => conn.close().await?,
            SqlxConnection::SQLite(conn) => conn.close().await?,
        }
        Ok(())
    }
}

/// Pre-parsed connect options for one backend.
#[derive(Debug, Clone)]
enum ConnectOptions {
    MySql(MySqlConnectOptions),
    Postgres(PgConnectOptions),
    SQLite(SqliteConnectOptions),
}

/// Connector holding parsed options for a single database URL.
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    options: ConnectOptions,
    db_type: DatabaseType,
}

impl SqlxConnector {
    /// Parse a connection URL, detecting the backend from its scheme.
    pub fn new(url: &str) -> DbResult<Self> {
        let db_type = DatabaseType::from_connection_string(url).ok_or_else(|| {
            DbError::invalid_input(format!(
                "Unknown database type for URL: {}",
                masked_connection_string(url)
            ))
        })?;
        Self::with_type(db_type, url)
    }

    /// Parse a connection URL for a known backend.
    pub fn with_type(db_type: DatabaseType, url: &str) -> DbResult<Self> {
        let invalid = |e: sqlx::Error| {
            DbError::invalid_input(format!("Invalid {} connection string: {}", db_type, e))
        };

        let options = match db_type {
            DatabaseType::MySQL => ConnectOptions::MySql(
                MySqlConnectOptions::from_str(url)
                    .map_err(invalid)?
                    .charset("utf8mb4"),
            ),
            DatabaseType::PostgreSQL => {
                ConnectOptions::Postgres(PgConnectOptions::from_str(url).map_err(invalid)?)
            }
            DatabaseType::SQLite => {
                ConnectOptions::SQLite(SqliteConnectOptions::from_str(url).map_err(invalid)?)
            }
        };

        Ok(Self { options, db_type })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    fn driver_identity(&self) -> DriverIdentity {
        self.db_type.identity()
    }

    async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>> {
        let conn = match &self.options {
            ConnectOptions::MySql(opts) => {
                SqlxConnection::MySql(MySqlConnection::connect_with(opts).await?)
            }
            ConnectOptions::Postgres(opts) => {
                SqlxConnection::Postgres(PgConnection::connect_with(opts).await?)
            }
            ConnectOptions::SQLite(opts) => {
                SqlxConnection::SQLite(SqliteConnection::connect_with(opts).await?)
            }
        };
        info!(db_type = %self.db_type, "Opened physical connection");
        Ok(Box::new(conn))
    }
}

/// Driver for one sqlx backend.
#[derive(Debug, Clone, Copy)]
pub struct SqlxDriver {
    db_type: DatabaseType,
}

impl SqlxDriver {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }

    /// Driver matching the scheme of `url`.
    pub fn for_url(url: &str) -> DbResult<Self> {
        DatabaseType::from_connection_string(url)
            .map(Self::new)
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Unknown database type for URL: {}",
                    masked_connection_string(url)
                ))
            })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    fn identity(&self) -> DriverIdentity {
        self.db_type.identity()
    }

    async fn open(&self, dsn: &str) -> DbResult<Box<dyn PhysicalConnection>> {
        SqlxConnector::with_type(self.db_type, dsn)?.connect().await
    }

    fn open_connector(self: Arc<Self>, dsn: &str) -> DbResult<Box<dyn Connector>> {
        Ok(Box::new(SqlxConnector::with_type(self.db_type, dsn)?))
    }
}
