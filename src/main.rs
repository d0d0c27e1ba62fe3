//! txsession - Main entry point.
//!
//! Exercises a database through the session factory: every cycle leases a
//! session, runs the configured statements, prints their results as JSON
//! lines and closes the session again.

use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use txsession::config::Config;
use txsession::db::{LeaseContext, SessionDb, SessionFactory, SqlxDriver};
use txsession::models::masked_connection_string;

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Results go to stdout, so logs stay on stderr
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Whether a statement produces a result set.
fn returns_rows(sql: &str) -> bool {
    let first = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "VALUES" | "PRAGMA" | "DESCRIBE"
    ) || sql.to_ascii_uppercase().contains(" RETURNING ")
}

async fn run_statements(
    db: &SessionDb,
    cycle: u32,
    statements: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let session = db.generation().await?;
    for sql in statements {
        let output = if returns_rows(sql) {
            let rows = db.fetch_all(sql).await?;
            json!({ "cycle": cycle, "session": session, "sql": sql, "rows": rows })
        } else {
            let result = db.execute(sql).await?;
            json!({ "cycle": cycle, "session": session, "sql": sql, "result": result })
        };
        println!("{}", output);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        eprintln!();
        eprintln!("Usage: txsession --database <url> [--execute <sql>]... [--cycles <n>]");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  txsession -d sqlite:fixtures.db -e \"INSERT INTO users (name) VALUES ('a')\" -e \"SELECT COUNT(*) AS n FROM users\"");
        eprintln!("  txsession -d mysql://root@localhost/app_test -n 5 -e \"INSERT INTO users (name) VALUES ('a')\"");
        eprintln!("  txsession -d postgres://postgres@localhost/app_test?cleanup=none");
        std::process::exit(1);
    }

    let db_config = config.parse_database()?;
    let options = config.factory_options(&db_config)?;

    info!(
        database = %masked_connection_string(&db_config.connection_string),
        db_type = %db_config.db_type,
        cycles = config.cycles,
        "Starting txsession v{}",
        env!("CARGO_PKG_VERSION")
    );

    let driver = Arc::new(SqlxDriver::new(db_config.db_type));
    let factory =
        SessionFactory::from_driver_with(driver, &db_config.connection_string, options).await?;

    info!(
        driver = %factory.driver(),
        action = %factory.cleanup_action(),
        "Factory ready"
    );

    for cycle in 1..=config.cycles {
        let ctx = LeaseContext::with_timeout(config.lease_timeout_duration());
        let db = factory.lease(&ctx).await?;

        let result = run_statements(&db, cycle, &config.statements).await;
        let closed = db.close().await;

        if let Err(e) = result {
            error!(cycle, error = %e, "Statement failed");
            return Err(e);
        }
        closed?;
    }

    factory.close().await?;
    info!("Session cycles complete");
    Ok(())
}
