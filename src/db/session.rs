//! The session connection: one physical connection inside an outer transaction.
//!
//! Every logical session runs inside a real transaction that is rolled back
//! when the session closes. Transactions requested by the caller become
//! savepoints of that outer transaction, so their commits are never durable.
//! Closing the session rolls the outer transaction back, runs the cleanup
//! action, begins a fresh outer transaction and republishes the connection
//! into the slot for the next lease.

use crate::db::capability::CapableConnection;
use crate::db::cleanup::CleanupAction;
use crate::db::slot::{PublishError, SlotPublisher};
use crate::error::{DbError, DbResult};
use crate::models::{DriverIdentity, ExecuteResult, JsonRow, QueryParam, TxOptions};
use tracing::{debug, error, info, warn};

/// Savepoint name used when none is configured.
pub const DEFAULT_SAVEPOINT_NAME: &str = "txsession_transaction";

/// Whether the outer transaction is open on the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterState {
    Active,
    Inactive,
}

#[derive(Debug)]
pub struct SessionConnection {
    conn: CapableConnection,
    outer: OuterState,
    inside_savepoint: bool,
    cleanup: CleanupAction,
    publisher: SlotPublisher,
    savepoint: String,
    outer_options: TxOptions,
    generation: u64,
}

impl SessionConnection {
    pub(crate) fn new(
        conn: CapableConnection,
        cleanup: CleanupAction,
        publisher: SlotPublisher,
        savepoint: String,
        outer_options: TxOptions,
    ) -> Self {
        Self {
            conn,
            outer: OuterState::Inactive,
            inside_savepoint: false,
            cleanup,
            publisher,
            savepoint,
            outer_options,
            generation: 0,
        }
    }

    pub fn driver(&self) -> &DriverIdentity {
        self.conn.driver()
    }

    pub fn cleanup_action(&self) -> CleanupAction {
        self.cleanup
    }

    pub fn savepoint_name(&self) -> &str {
        &self.savepoint
    }

    pub fn outer_state(&self) -> OuterState {
        self.outer
    }

    pub fn in_transaction(&self) -> bool {
        self.inside_savepoint
    }

    /// Number of outer transactions begun on this connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin the outer transaction and publish the session into the slot.
    ///
    /// If the slot's owner is gone, the physical connection is closed
    /// instead and the call still succeeds.
    pub(crate) async fn setup(mut self) -> DbResult<()> {
        if let Err(e) = self.conn.begin(&self.outer_options).await {
            error!(
                driver = %self.driver(),
                error = %e,
                "Failed to begin outer transaction"
            );
            self.discard().await;
            return Err(e);
        }
        self.outer = OuterState::Active;
        self.inside_savepoint = false;
        self.generation += 1;
        debug!(
            driver = %self.driver(),
            session = self.generation,
            "Outer transaction started"
        );

        let publisher = self.publisher.clone();
        match publisher.publish(self) {
            Ok(()) => Ok(()),
            Err(PublishError::Closed(session)) => {
                info!(
                    driver = %session.driver(),
                    "Session factory gone, closing physical connection"
                );
                session.shutdown().await
            }
            Err(PublishError::Occupied(session)) => {
                let message = format!(
                    "session slot for driver '{}' already holds a connection",
                    session.driver()
                );
                session.discard().await;
                Err(DbError::internal(message))
            }
        }
    }

    /// Open the session transaction as a savepoint.
    pub async fn begin_transaction(&mut self) -> DbResult<()> {
        if self.inside_savepoint {
            return Err(DbError::AlreadyInTransaction);
        }
        let sql = format!("SAVEPOINT {}", self.savepoint);
        self.conn.execute(&sql, &[]).await?;
        self.inside_savepoint = true;
        debug!(session = self.generation, savepoint = %self.savepoint, "Savepoint created");
        Ok(())
    }

    /// Release the savepoint. The work stays visible until the session closes.
    pub async fn commit(&mut self) -> DbResult<()> {
        if !self.inside_savepoint {
            return Err(DbError::NotInTransaction);
        }
        let sql = format!("RELEASE SAVEPOINT {}", self.savepoint);
        self.conn.execute(&sql, &[]).await?;
        self.inside_savepoint = false;
        debug!(session = self.generation, savepoint = %self.savepoint, "Savepoint released");
        Ok(())
    }

    /// Undo the work since the savepoint and release it.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if !self.inside_savepoint {
            return Err(DbError::NotInTransaction);
        }
        let rollback = format!("ROLLBACK TO SAVEPOINT {}", self.savepoint);
        self.conn.execute(&rollback, &[]).await?;
        let release = format!("RELEASE SAVEPOINT {}", self.savepoint);
        self.conn.execute(&release, &[]).await?;
        self.inside_savepoint = false;
        debug!(session = self.generation, savepoint = %self.savepoint, "Savepoint rolled back");
        Ok(())
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        self.conn.ping().await
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        self.conn.execute(sql, params).await
    }

    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        self.conn.query(sql, params).await
    }

    /// End the session: discard its work, reset generators and re-arm.
    ///
    /// A failed outer rollback or cleanup is fatal. The physical connection
    /// is dropped with the session and later leases report
    /// [`DbError::SessionUnavailable`].
    pub(crate) async fn close(mut self) -> DbResult<()> {
        let session = self.generation;

        if let Err(e) = self.conn.rollback().await {
            error!(session, error = %e, "Outer rollback failed, discarding session");
            self.discard().await;
            return Err(DbError::rollback(e));
        }
        self.outer = OuterState::Inactive;
        self.inside_savepoint = false;

        if let Err(e) = self.cleanup.run(&mut self.conn).await {
            let action = self.cleanup.name();
            error!(session, action, error = %e, "Cleanup failed, discarding session");
            self.discard().await;
            return Err(DbError::cleanup(action, e));
        }

        info!(session, action = %self.cleanup, "Session closed");
        self.setup().await
    }

    /// Roll back the outer transaction and close the physical connection.
    pub(crate) async fn shutdown(mut self) -> DbResult<()> {
        if self.outer == OuterState::Active {
            self.conn.rollback().await?;
            self.outer = OuterState::Inactive;
        }
        let driver = self.driver().clone();
        self.conn.close().await?;
        info!(driver = %driver, "Physical connection closed");
        Ok(())
    }

    /// Close a connection that can no longer be trusted, logging failures.
    async fn discard(self) {
        let driver = self.driver().clone();
        if let Err(e) = self.conn.close().await {
            warn!(driver = %driver, error = %e, "Failed to close discarded connection");
        }
    }
}
