//! Cleanup actions run between sessions.
//!
//! Rolling back the outer transaction restores table contents, but not every
//! backend rolls back its identifier generators. MySQL's `AUTO_INCREMENT`
//! counters and PostgreSQL sequences advance outside transactions, so without a
//! reset each session would see different generated ids. A [`CleanupAction`]
//! resets that state after the outer rollback, outside of any transaction.

use crate::db::capability::CapableConnection;
use crate::error::{DbError, DbResult};
use crate::models::DriverIdentity;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

/// MySQL 8 serves `information_schema.tables.AUTO_INCREMENT` from a stats
/// cache; a stale cached 1 would hide tables whose counter has since moved.
const MYSQL_DISABLE_STATS_CACHE: &str = "SET SESSION information_schema_stats_expiry = 0";

const MYSQL_AUTO_INCREMENT_TABLES: &str = "SELECT TABLE_NAME AS table_name \
     FROM information_schema.tables \
     WHERE TABLE_SCHEMA = DATABASE() AND AUTO_INCREMENT > 1";

const POSTGRES_SEQUENCES: &str = "SELECT sequence_schema::text AS seq_schema, sequence_name::text AS seq_name \
     FROM information_schema.sequences \
     WHERE sequence_schema = current_schema()";

/// Reset routine bound to a driver identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupAction {
    /// Nothing to reset.
    #[default]
    None,
    /// Reset every `AUTO_INCREMENT` counter above 1 in the current schema.
    ResetAutoIncrement,
    /// Restart every sequence in the current schema.
    ///
    /// `RESTART` returns a sequence to its `START` value, which is 1 for
    /// serial and identity columns unless declared otherwise.
    ResetSequences,
}

impl CleanupAction {
    /// Resolve the action for a driver identity.
    ///
    /// Unknown identities resolve to [`CleanupAction::None`]. SQLite keeps its
    /// row-id state in ordinary tables, which the outer rollback already
    /// restores.
    pub fn for_driver(identity: &DriverIdentity) -> Self {
        match identity.as_str() {
            "mysql" | "mariadb" => Self::ResetAutoIncrement,
            "postgres" | "postgresql" => Self::ResetSequences,
            _ => Self::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ResetAutoIncrement => "reset-auto-increment",
            Self::ResetSequences => "reset-sequences",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Run the action against the physical connection.
    ///
    /// Stops at the first failing statement and returns the driver error
    /// unchanged; the caller decides how to wrap it.
    pub async fn run(&self, conn: &mut CapableConnection) -> DbResult<()> {
        match self {
            Self::None => Ok(()),
            Self::ResetAutoIncrement => reset_auto_increment(conn).await,
            Self::ResetSequences => reset_sequences(conn).await,
        }
    }
}

impl std::fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CleanupAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "reset-auto-increment" => Ok(Self::ResetAutoIncrement),
            "reset-sequences" => Ok(Self::ResetSequences),
            other => Err(format!(
                "Unknown cleanup action '{}'. Expected none, reset-auto-increment or reset-sequences",
                other
            )),
        }
    }
}

/// Quote a MySQL identifier with backticks.
pub fn quote_mysql_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a PostgreSQL identifier with double quotes.
pub fn quote_postgres_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn text_value(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

/// MariaDB and MySQL 5.7 have no stats cache and reject the variable.
fn is_unknown_variable(err: &DbError) -> bool {
    match err {
        DbError::Database { message, .. } => message
            .to_ascii_lowercase()
            .contains("unknown system variable"),
        _ => false,
    }
}

async fn disable_stats_cache(conn: &mut CapableConnection) -> DbResult<()> {
    match conn.execute(MYSQL_DISABLE_STATS_CACHE, &[]).await {
        Ok(_) => Ok(()),
        Err(e) if is_unknown_variable(&e) => {
            debug!(error = %e, "Server has no information_schema stats cache");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn reset_auto_increment(conn: &mut CapableConnection) -> DbResult<()> {
    disable_stats_cache(conn).await?;
    let rows = conn.query(MYSQL_AUTO_INCREMENT_TABLES, &[]).await?;
    let tables: Vec<String> = rows
        .iter()
        .filter_map(|row| text_value(row.get("table_name")))
        .collect();

    for table in &tables {
        let statement = format!(
            "ALTER TABLE {} AUTO_INCREMENT = 1",
            quote_mysql_identifier(table)
        );
        conn.execute(&statement, &[]).await?;
        debug!(table = %table, "Reset AUTO_INCREMENT");
    }

    if !tables.is_empty() {
        info!(count = tables.len(), "Reset AUTO_INCREMENT counters");
    }
    Ok(())
}

async fn reset_sequences(conn: &mut CapableConnection) -> DbResult<()> {
    let rows = conn.query(POSTGRES_SEQUENCES, &[]).await?;
    let statements: Vec<String> = rows
        .iter()
        .filter_map(|row| {
            let schema = text_value(row.get("seq_schema"))?;
            let sequence = text_value(row.get("seq_name"))?;
            Some(format!(
                "ALTER SEQUENCE {}.{} RESTART",
                quote_postgres_identifier(&schema),
                quote_postgres_identifier(&sequence)
            ))
        })
        .collect();

    if statements.is_empty() {
        return Ok(());
    }

    if conn.supports_multi_statements() {
        conn.execute(&statements.join(";\n"), &[]).await?;
    } else {
        for statement in &statements {
            conn.execute(statement, &[]).await?;
        }
    }

    info!(count = statements.len(), "Restarted sequences");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_driver_mapping() {
        assert_eq!(
            CleanupAction::for_driver(&DriverIdentity::MYSQL),
            CleanupAction::ResetAutoIncrement
        );
        assert_eq!(
            CleanupAction::for_driver(&DriverIdentity::new("mariadb")),
            CleanupAction::ResetAutoIncrement
        );
        assert_eq!(
            CleanupAction::for_driver(&DriverIdentity::POSTGRES),
            CleanupAction::ResetSequences
        );
        assert_eq!(
            CleanupAction::for_driver(&DriverIdentity::SQLITE),
            CleanupAction::None
        );
    }

    #[test]
    fn test_unknown_driver_resolves_to_none() {
        let action = CleanupAction::for_driver(&DriverIdentity::new("cockroach-custom"));
        assert!(action.is_none());
    }

    #[test]
    fn test_parse_action_names() {
        assert_eq!(
            "reset-sequences".parse::<CleanupAction>(),
            Ok(CleanupAction::ResetSequences)
        );
        assert_eq!(
            "NONE".parse::<CleanupAction>(),
            Ok(CleanupAction::None)
        );
        assert!("truncate".parse::<CleanupAction>().is_err());
    }

    #[test]
    fn test_quote_identifiers() {
        assert_eq!(quote_mysql_identifier("users"), "`users`");
        assert_eq!(quote_mysql_identifier("we`ird"), "`we``ird`");
        assert_eq!(quote_postgres_identifier("users_id_seq"), "\"users_id_seq\"");
        assert_eq!(quote_postgres_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_unknown_variable_detection() {
        let mariadb = DbError::database(
            "Unknown system variable 'information_schema_stats_expiry'",
            Some("HY000".to_string()),
        );
        assert!(is_unknown_variable(&mariadb));
        assert!(!is_unknown_variable(&DbError::database("Lock wait timeout exceeded", None)));
        assert!(!is_unknown_variable(&DbError::connection("unknown system variable")));
    }

    #[test]
    fn test_text_value() {
        assert_eq!(
            text_value(Some(&JsonValue::String("t".into()))),
            Some("t".to_string())
        );
        assert_eq!(text_value(Some(&JsonValue::Null)), None);
        assert_eq!(text_value(None), None);
    }
}
