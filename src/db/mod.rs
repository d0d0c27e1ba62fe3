//! Database layer.
//!
//! This module provides the transactional session machinery:
//! - Capability checks for physical connections
//! - Driver-specific cleanup between sessions
//! - The session connection and its savepoint protocol
//! - The single-capacity slot and lease cancellation
//! - The session factory and caller-facing handle
//! - The sqlx-backed driver adapter

pub mod capability;
pub mod cleanup;
pub mod connector;
pub mod driver;
pub mod factory;
pub mod handle;
pub mod params;
pub mod session;
pub mod slot;
pub mod types;

pub use capability::{Capability, CapableConnection, PhysicalConnection, REQUIRED_CAPABILITIES};
pub use cleanup::CleanupAction;
pub use connector::{Connector, Driver, DsnConnector};
pub use driver::{SqlxConnection, SqlxConnector, SqlxDriver};
pub use factory::{FactoryOptions, SessionFactory};
pub use handle::{OneShotConnector, PoolSettings, SessionDb, SessionTransaction};
pub use session::{DEFAULT_SAVEPOINT_NAME, OuterState, SessionConnection};
pub use slot::{LeaseContext, SessionSlot};
