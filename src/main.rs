//! DB Pool Facade - command-line entry point.
//!
//! Opens a pool for one database, runs a single query verb through it, prints
//! the result and the pool snapshot as JSON, then drains the pool.

use clap::Parser;
use db_pool_facade::config::{Config, Verb};
use db_pool_facade::db::{Queryable, SqlxPool, open_pool};
use db_pool_facade::error::DbResult;
use db_pool_facade::models::SqlQuery;
use serde_json::{Value as JsonValue, json};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries the JSON result.
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

async fn run_verb(pool: &SqlxPool, verb: Verb, query: SqlQuery) -> DbResult<JsonValue> {
    let value = match verb {
        Verb::Any => json!(pool.any(query).await?),
        Verb::AnyFirst => json!(pool.any_first(query).await?),
        Verb::Exists => json!(pool.exists(query).await?),
        Verb::Many => json!(pool.many(query).await?),
        Verb::ManyFirst => json!(pool.many_first(query).await?),
        Verb::MaybeOne => json!(pool.maybe_one(query).await?),
        Verb::MaybeOneFirst => json!(pool.maybe_one_first(query).await?),
        Verb::One => json!(pool.one(query).await?),
        Verb::OneFirst => json!(pool.one_first(query).await?),
        Verb::Query => json!(pool.query(query).await?),
        Verb::Stream => {
            let count = pool
                .stream(query, |row| {
                    println!("{}", JsonValue::Object(row.to_json_map()));
                    Ok(())
                })
                .await?;
            json!({ "streamed": count })
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let db = config.parse_database()?;
    let client = config.client_configuration(&db);

    info!(
        database = %db.masked_connection_string(),
        db_type = %db.db_type,
        verb = %config.verb,
        max_connections = client.max_connections,
        "Starting DB Pool Facade v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = open_pool(&db, client)?;
    let result = run_verb(&pool, config.verb, SqlQuery::new(config.query.as_str())).await;

    let snapshot = pool.get_pool_state();
    pool.end().await;

    let value = match result {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, suggestion = ?e.suggestion(), "Query failed");
            return Err(e.into());
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "result": value, "pool": snapshot }))?
    );
    info!(ended = pool.get_pool_state().ended, "Shutdown complete");
    Ok(())
}
