//! Session factory: bootstraps the physical connection and leases sessions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use txsession::db::{LeaseContext, SessionFactory, SqlxDriver};
//!
//! # async fn demo() -> txsession::DbResult<()> {
//! let url = "mysql://root@localhost/app_test";
//! let factory = SessionFactory::from_driver(Arc::new(SqlxDriver::for_url(url)?), url).await?;
//!
//! let db = factory.lease(&LeaseContext::background()).await?;
//! db.execute("INSERT INTO users (name) VALUES ('alice')").await?;
//! db.close().await?; // the insert is gone, AUTO_INCREMENT is back at 1
//! # Ok(())
//! # }
//! ```

use crate::db::capability::CapableConnection;
use crate::db::cleanup::CleanupAction;
use crate::db::connector::{Connector, Driver};
use crate::db::handle::{OneShotConnector, SessionDb};
use crate::db::session::{DEFAULT_SAVEPOINT_NAME, SessionConnection};
use crate::db::slot::{LeaseContext, SessionSlot};
use crate::error::{DbError, DbResult};
use crate::models::{DriverIdentity, IsolationLevel, TxOptions};
use std::sync::Arc;
use tracing::{debug, info};

/// Maximum identifier length accepted by every supported backend.
const MAX_SAVEPOINT_NAME_LEN: usize = 63;

/// Options applied when a factory is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryOptions {
    pub savepoint_name: String,
    pub outer_transaction: TxOptions,
    /// Overrides the action resolved from the driver identity.
    pub cleanup: Option<CleanupAction>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            savepoint_name: DEFAULT_SAVEPOINT_NAME.to_string(),
            outer_transaction: TxOptions::default(),
            cleanup: None,
        }
    }
}

impl FactoryOptions {
    pub fn with_savepoint_name(mut self, name: impl Into<String>) -> Self {
        self.savepoint_name = name.into();
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.outer_transaction = TxOptions::with_isolation(isolation);
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupAction) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// The savepoint name is spliced into SQL, so it must be a plain identifier.
    pub fn validate(&self) -> DbResult<()> {
        let name = &self.savepoint_name;
        if name.is_empty() {
            return Err(DbError::invalid_input("Savepoint name must not be empty"));
        }
        if name.len() > MAX_SAVEPOINT_NAME_LEN {
            return Err(DbError::invalid_input(format!(
                "Savepoint name exceeds {} characters",
                MAX_SAVEPOINT_NAME_LEN
            )));
        }
        let mut chars = name.chars();
        let starts_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::invalid_input(format!(
                "Invalid savepoint name '{}': use letters, digits and underscores",
                name
            )));
        }
        Ok(())
    }

    fn resolve_cleanup(&self, driver: &DriverIdentity) -> CleanupAction {
        self.cleanup
            .unwrap_or_else(|| CleanupAction::for_driver(driver))
    }
}

/// Hands out isolated sessions over a single physical connection.
#[derive(Debug)]
pub struct SessionFactory {
    slot: SessionSlot,
    driver: DriverIdentity,
    cleanup: CleanupAction,
}

impl SessionFactory {
    /// Open `dsn` through `driver` and build a factory on the connection.
    pub async fn from_driver(driver: Arc<dyn Driver>, dsn: &str) -> DbResult<Self> {
        Self::from_driver_with(driver, dsn, FactoryOptions::default()).await
    }

    pub async fn from_driver_with(
        driver: Arc<dyn Driver>,
        dsn: &str,
        options: FactoryOptions,
    ) -> DbResult<Self> {
        let identity = driver.identity();
        let connector = driver.open_connector(dsn).map_err(DbError::open)?;
        debug!(driver = %identity, "Connector created");
        Self::from_connector_with(connector.as_ref(), options).await
    }

    /// Build a factory from a connector, connecting exactly once.
    pub async fn from_connector(connector: &dyn Connector) -> DbResult<Self> {
        Self::from_connector_with(connector, FactoryOptions::default()).await
    }

    pub async fn from_connector_with(
        connector: &dyn Connector,
        options: FactoryOptions,
    ) -> DbResult<Self> {
        options.validate()?;

        let driver = connector.driver_identity();
        let physical = connector.connect().await.map_err(DbError::open)?;
        let conn = CapableConnection::new(physical, driver.clone()).await?;
        let cleanup = options.resolve_cleanup(&driver);

        let (slot, publisher) = SessionSlot::new();
        let session = SessionConnection::new(
            conn,
            cleanup,
            publisher,
            options.savepoint_name,
            options.outer_transaction,
        );
        session.setup().await?;

        info!(driver = %driver, action = %cleanup, "Session factory ready");
        Ok(Self {
            slot,
            driver,
            cleanup,
        })
    }

    pub fn driver(&self) -> &DriverIdentity {
        &self.driver
    }

    pub fn cleanup_action(&self) -> CleanupAction {
        self.cleanup
    }

    /// Wait for the session and wrap it in a fresh handle.
    ///
    /// Only one handle exists at a time; further calls wait until it is
    /// closed, or fail with [`DbError::Cancelled`] when `ctx` ends first.
    pub async fn lease(&self, ctx: &LeaseContext) -> DbResult<SessionDb> {
        let session = self.slot.acquire(ctx).await?;
        debug!(
            driver = %self.driver,
            session = session.generation(),
            "Session leased"
        );
        SessionDb::open(OneShotConnector::new(session)).await
    }

    /// Wait for the outstanding handle to close, then close the physical
    /// connection.
    pub async fn close(self) -> DbResult<()> {
        let session = self.slot.acquire(&LeaseContext::background()).await?;
        session.shutdown().await?;
        info!(driver = %self.driver, "Session factory closed");
        Ok(())
    }
}
