//! Caller-facing database handle for one leased session.
//!
//! [`SessionDb`] behaves like a pool pinned to a single connection: every
//! call waits for that connection, and [`SessionDb::begin`] holds it for the
//! life of the transaction. The connection comes from a [`OneShotConnector`],
//! which can hand it out exactly once.

use crate::db::session::SessionConnection;
use crate::error::{DbError, DbResult};
use crate::models::{DriverIdentity, ExecuteResult, JsonRow, QueryParam};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Connector that yields one session connection, once.
#[derive(Debug)]
pub struct OneShotConnector {
    driver: DriverIdentity,
    session: Mutex<Option<SessionConnection>>,
}

impl OneShotConnector {
    pub fn new(session: SessionConnection) -> Self {
        Self {
            driver: session.driver().clone(),
            session: Mutex::new(Some(session)),
        }
    }

    pub fn driver_identity(&self) -> DriverIdentity {
        self.driver.clone()
    }

    /// Hand out the session connection.
    ///
    /// Fails with [`DbError::ConnectorExhausted`] on every call after the first.
    pub async fn connect(&self) -> DbResult<SessionConnection> {
        self.session
            .lock()
            .await
            .take()
            .ok_or(DbError::ConnectorExhausted)
    }
}

/// Pool limits of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    /// `None` means connections never expire.
    pub max_lifetime: Option<Duration>,
}

impl PoolSettings {
    /// One open connection, kept idle between calls, never recycled.
    pub fn single_connection() -> Self {
        Self {
            max_open: 1,
            max_idle: 1,
            max_lifetime: None,
        }
    }
}

/// Database handle backed by exactly one session connection.
#[derive(Debug)]
pub struct SessionDb {
    conn: Mutex<Option<SessionConnection>>,
    driver: DriverIdentity,
    settings: PoolSettings,
}

impl SessionDb {
    /// Build a handle, taking the connector's connection immediately.
    pub async fn open(connector: OneShotConnector) -> DbResult<Self> {
        let session = connector.connect().await?;
        debug!(
            driver = %connector.driver_identity(),
            session = session.generation(),
            "Session handle opened"
        );
        Ok(Self {
            conn: Mutex::new(Some(session)),
            driver: connector.driver_identity(),
            settings: PoolSettings::single_connection(),
        })
    }

    pub fn driver(&self) -> &DriverIdentity {
        &self.driver
    }

    pub fn pool_settings(&self) -> PoolSettings {
        self.settings
    }

    /// Generation of the outer transaction backing this handle.
    pub async fn generation(&self) -> DbResult<u64> {
        let guard = self.acquire().await?;
        Ok(session_ref(&guard)?.generation())
    }

    pub async fn ping(&self) -> DbResult<()> {
        let mut guard = self.acquire().await?;
        session_mut(&mut guard)?.ping().await
    }

    pub async fn execute(&self, sql: &str) -> DbResult<ExecuteResult> {
        self.execute_with(sql, &[]).await
    }

    pub async fn execute_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        let mut guard = self.acquire().await?;
        session_mut(&mut guard)?.execute(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str) -> DbResult<Vec<JsonRow>> {
        self.fetch_all_with(sql, &[]).await
    }

    pub async fn fetch_all_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let mut guard = self.acquire().await?;
        session_mut(&mut guard)?.query(sql, params).await
    }

    /// First row of the result, if any.
    pub async fn fetch_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<JsonRow>> {
        let rows = self.fetch_all_with(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Single value of a one-column result.
    pub async fn fetch_scalar(&self, sql: &str, params: &[QueryParam]) -> DbResult<JsonValue> {
        let row = self.fetch_one(sql, params).await?.ok_or_else(|| {
            DbError::invalid_input(format!("Query returned no rows: {}", sql))
        })?;
        if row.len() != 1 {
            return Err(DbError::invalid_input(format!(
                "Expected one column, query returned {}",
                row.len()
            )));
        }
        Ok(row.into_iter().next().map(|(_, v)| v).unwrap_or(JsonValue::Null))
    }

    /// Start a session transaction.
    ///
    /// The transaction holds the handle's only connection until it is
    /// committed, rolled back or dropped.
    pub async fn begin(&self) -> DbResult<SessionTransaction<'_>> {
        let mut guard = self.acquire().await?;
        session_mut(&mut guard)?.begin_transaction().await?;
        Ok(SessionTransaction {
            guard,
            finished: false,
        })
    }

    /// Close the session: discard its work and return the connection to the
    /// factory for the next lease.
    pub async fn close(mut self) -> DbResult<()> {
        match self.conn.get_mut().take() {
            Some(session) => session.close().await,
            None => Err(DbError::SessionUnavailable),
        }
    }

    /// Lock the connection, rolling back a savepoint left by a dropped
    /// transaction.
    async fn acquire(&self) -> DbResult<MutexGuard<'_, Option<SessionConnection>>> {
        let mut guard = self.conn.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.in_transaction() {
                debug!(
                    session = session.generation(),
                    "Rolling back abandoned transaction"
                );
                session.rollback().await?;
            }
        }
        Ok(guard)
    }
}

impl Drop for SessionDb {
    fn drop(&mut self) {
        let Some(session) = self.conn.get_mut().take() else {
            return;
        };

        let driver = self.driver.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        error!(driver = %driver, error = %e, "Background session close failed");
                    }
                });
                warn!(
                    driver = %self.driver,
                    "Session closed via Drop - consider using explicit close()"
                );
            }
            Err(_) => {
                warn!(
                    driver = %driver,
                    "Session dropped outside a runtime, connection lost"
                );
            }
        }
    }
}

fn session_ref<'a>(
    guard: &'a MutexGuard<'_, Option<SessionConnection>>,
) -> DbResult<&'a SessionConnection> {
    guard.as_ref().ok_or(DbError::SessionUnavailable)
}

fn session_mut<'a>(
    guard: &'a mut MutexGuard<'_, Option<SessionConnection>>,
) -> DbResult<&'a mut SessionConnection> {
    guard.as_mut().ok_or(DbError::SessionUnavailable)
}

/// An open session transaction (a savepoint of the outer transaction).
///
/// Dropping it without `commit` or `rollback` rolls the savepoint back
/// before the handle's next use.
#[derive(Debug)]
pub struct SessionTransaction<'a> {
    guard: MutexGuard<'a, Option<SessionConnection>>,
    finished: bool,
}

impl SessionTransaction<'_> {
    pub async fn execute(&mut self, sql: &str) -> DbResult<ExecuteResult> {
        self.execute_with(sql, &[]).await
    }

    pub async fn execute_with(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecuteResult> {
        session_mut(&mut self.guard)?.execute(sql, params).await
    }

    pub async fn fetch_all(&mut self, sql: &str) -> DbResult<Vec<JsonRow>> {
        self.fetch_all_with(sql, &[]).await
    }

    pub async fn fetch_all_with(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        session_mut(&mut self.guard)?.query(sql, params).await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.finished = true;
        session_mut(&mut self.guard)?.commit().await
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finished = true;
        session_mut(&mut self.guard)?.rollback().await
    }
}

impl Drop for SessionTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Session transaction dropped without commit or rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::capability::CapableConnection;
    use crate::db::cleanup::CleanupAction;
    use crate::db::connector::Connector;
    use crate::db::driver::SqlxConnector;
    use crate::db::session::DEFAULT_SAVEPOINT_NAME;
    use crate::db::slot::{LeaseContext, SessionSlot};
    use crate::models::TxOptions;

    async fn leased_sqlite_session() -> (SessionSlot, SessionConnection) {
        let connector = SqlxConnector::new("sqlite::memory:").unwrap();
        let conn = CapableConnection::new(connector.connect().await.unwrap(), DriverIdentity::SQLITE)
            .await
            .unwrap();
        let (slot, publisher) = SessionSlot::new();
        let session = SessionConnection::new(
            conn,
            CleanupAction::None,
            publisher,
            DEFAULT_SAVEPOINT_NAME.to_string(),
            TxOptions::default(),
        );
        session.setup().await.unwrap();
        let session = slot.acquire(&LeaseContext::background()).await.unwrap();
        (slot, session)
    }

    #[tokio::test]
    async fn test_one_shot_connector_hands_out_once() {
        let (slot, session) = leased_sqlite_session().await;
        let connector = OneShotConnector::new(session);
        assert_eq!(connector.driver_identity(), DriverIdentity::SQLITE);

        let session = connector.connect().await.unwrap();
        assert_eq!(session.generation(), 1);

        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, DbError::ConnectorExhausted));
        assert!(err.is_protocol_violation());
        assert!(matches!(
            connector.connect().await.unwrap_err(),
            DbError::ConnectorExhausted
        ));

        // The handed-out connection still cycles back into the slot
        session.close().await.unwrap();
        let session = slot.acquire(&LeaseContext::background()).await.unwrap();
        assert_eq!(session.generation(), 2);
    }

    #[tokio::test]
    async fn test_open_rejects_used_connector() {
        let (_slot, session) = leased_sqlite_session().await;
        let connector = OneShotConnector::new(session);
        let _session = connector.connect().await.unwrap();

        let err = SessionDb::open(connector).await.unwrap_err();
        assert!(matches!(err, DbError::ConnectorExhausted));
    }

    #[tokio::test]
    async fn test_open_pins_single_connection() {
        let (_slot, session) = leased_sqlite_session().await;
        let db = SessionDb::open(OneShotConnector::new(session)).await.unwrap();
        assert_eq!(db.pool_settings(), PoolSettings::single_connection());
        assert_eq!(db.driver(), &DriverIdentity::SQLITE);
        db.close().await.unwrap();
    }
}
