//! Driver and connector seams.
//!
//! A [`Connector`] produces physical connections and reports the identity tag
//! used to resolve cleanup. A [`Driver`] opens connections from a DSN and can
//! hand out a connector bound to that DSN.

use crate::db::capability::PhysicalConnection;
use crate::error::DbResult;
use crate::models::DriverIdentity;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Connector: Send + Sync {
    fn driver_identity(&self) -> DriverIdentity;

    async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>>;
}

#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn identity(&self) -> DriverIdentity;

    /// Open a physical connection for the given DSN.
    async fn open(&self, dsn: &str) -> DbResult<Box<dyn PhysicalConnection>>;

    /// Build a connector bound to `dsn`.
    ///
    /// Drivers that can validate or pre-parse the DSN should override this;
    /// the default defers everything to [`Driver::open`] at connect time.
    fn open_connector(self: Arc<Self>, dsn: &str) -> DbResult<Box<dyn Connector>> {
        Ok(Box::new(DsnConnector {
            dsn: dsn.to_string(),
            driver: self,
        }))
    }
}

/// Connector that opens its DSN through a driver on every connect.
pub struct DsnConnector<D: Driver + ?Sized> {
    dsn: String,
    driver: Arc<D>,
}

#[async_trait]
impl<D: Driver + ?Sized> Connector for DsnConnector<D> {
    fn driver_identity(&self) -> DriverIdentity {
        self.driver.identity()
    }

    async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>> {
        self.driver.open(&self.dsn).await
    }
}
