//! Capability set a physical connection must expose.
//!
//! Drivers declare which operations they support through
//! [`PhysicalConnection::capabilities`]. [`CapableConnection`] checks the
//! declaration once, when the connection is adopted, so a session never
//! discovers a missing operation halfway through its lifecycle.

use crate::error::{DbError, DbResult};
use crate::models::{DriverIdentity, ExecuteResult, JsonRow, QueryParam, TxOptions};
use async_trait::async_trait;
use tracing::{debug, warn};

/// One operation of the physical connection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Ping,
    Execute,
    Query,
    BeginTransaction,
    Close,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Execute => "execute",
            Self::Query => "query",
            Self::BeginTransaction => "begin_transaction",
            Self::Close => "close",
        }
    }
}

/// Every capability a session needs.
pub const REQUIRED_CAPABILITIES: [Capability; 5] = [
    Capability::Ping,
    Capability::Execute,
    Capability::Query,
    Capability::BeginTransaction,
    Capability::Close,
];

fn unsupported(capability: Capability) -> DbError {
    DbError::internal(format!(
        "capability '{}' is not supported by this connection",
        capability.name()
    ))
}

/// A live connection to the real database.
///
/// Only `capabilities`, `execute` and `query` are mandatory to implement; the
/// remaining operations default to an error and must be listed in
/// `capabilities` once a driver provides them.
#[async_trait]
pub trait PhysicalConnection: Send + std::fmt::Debug {
    /// Operations this connection supports.
    fn capabilities(&self) -> Vec<Capability>;

    /// Whether several `;`-separated statements may be sent in one `execute`.
    fn supports_multi_statements(&self) -> bool {
        false
    }

    async fn ping(&mut self) -> DbResult<()> {
        Err(unsupported(Capability::Ping))
    }

    /// Execute a statement that returns no rows.
    ///
    /// Statements without parameters must be sent unprepared, so transaction
    /// control statements (`SAVEPOINT`, `ROLLBACK TO ...`) work on every backend.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult>;

    /// Run a query and collect its rows.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>>;

    /// Open a real transaction. The outer transaction is never committed, so
    /// the protocol has no commit.
    async fn begin(&mut self, _options: &TxOptions) -> DbResult<()> {
        Err(unsupported(Capability::BeginTransaction))
    }

    async fn rollback(&mut self) -> DbResult<()> {
        Err(unsupported(Capability::BeginTransaction))
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        Err(unsupported(Capability::Close))
    }
}

/// A physical connection whose capability set has been verified.
#[derive(Debug)]
pub struct CapableConnection {
    inner: Box<dyn PhysicalConnection>,
    driver: DriverIdentity,
}

impl CapableConnection {
    /// Adopt a connection after checking it supports [`REQUIRED_CAPABILITIES`].
    ///
    /// A rejected connection is closed (or dropped, if it cannot close)
    /// before the error is returned.
    pub async fn new(
        conn: Box<dyn PhysicalConnection>,
        driver: DriverIdentity,
    ) -> DbResult<Self> {
        let declared = conn.capabilities();
        let missing: Vec<&'static str> = REQUIRED_CAPABILITIES
            .iter()
            .filter(|cap| !declared.contains(cap))
            .map(Capability::name)
            .collect();

        if missing.is_empty() {
            debug!(driver = %driver, "Connection capabilities verified");
            return Ok(Self {
                inner: conn,
                driver,
            });
        }

        warn!(driver = %driver, missing = ?missing, "Rejecting incompatible connection");
        if declared.contains(&Capability::Close) {
            if let Err(e) = conn.close().await {
                warn!(driver = %driver, error = %e, "Failed to close rejected connection");
            }
        }
        Err(DbError::incompatible_driver(driver.to_string(), missing))
    }

    pub fn driver(&self) -> &DriverIdentity {
        &self.driver
    }

    pub fn supports_multi_statements(&self) -> bool {
        self.inner.supports_multi_statements()
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        self.inner.ping().await
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        self.inner.execute(sql, params).await
    }

    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        self.inner.query(sql, params).await
    }

    pub async fn begin(&mut self, options: &TxOptions) -> DbResult<()> {
        self.inner.begin(options).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.inner.rollback().await
    }

    pub async fn close(self) -> DbResult<()> {
        self.inner.close().await
    }
}
