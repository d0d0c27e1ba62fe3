//! txsession Library
//!
//! Turns one physical database connection into a sequence of isolated
//! sessions. Each session runs inside an outer transaction that is rolled
//! back when the session closes, so every lease starts from the same state
//! (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{LeaseContext, SessionDb, SessionFactory};
pub use error::{DbError, DbResult};
