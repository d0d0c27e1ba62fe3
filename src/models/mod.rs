//! Data models for transactional sessions.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use connection::{DatabaseType, DriverIdentity, masked_connection_string};
pub use query::{ExecuteResult, JsonRow, QueryParam};
pub use transaction::{IsolationLevel, TxOptions};
