//! Connect with whatever credential backend the environment configures, run a query
//! through the rotating pool, then shut down.
//!
//! Reads the same variables as `ConnectorConfig::from_env`, for example:
//!
//! ```text
//! PGHOST=instance.database.example.com PGUSER=me@example.com \
//! DATABRICKS_HOST=https://workspace.example.com DATABRICKS_TOKEN=dapi... \
//! DATABASE_INSTANCE_NAME=orders-db DATABASE_USE_ROTATING_CREDENTIALS=true \
//! RUST_LOG=rotating_pg=debug cargo run --example connect
//! ```

use std::time::Duration;

use rotating_pg::{DatabaseConnector, HealthStatus};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let connector = DatabaseConnector::from_env()?;
    println!("Mode: {}", connector.mode());

    if let Err(e) = connector.start().await {
        eprintln!("Startup failed ({:?}): {}", e.category(), e);
        return Err(e.into());
    }

    let version: String = connector
        .run_with_auth_retry(|pool| async move {
            let row: (String,) = sqlx::query_as("SELECT version()")
                .fetch_one(&*pool)
                .await?;
            Ok::<_, rotating_pg::Error>(row.0)
        })
        .await?;
    println!("Server: {}", version);

    let schema: (String,) = sqlx::query_as("SELECT current_schema()")
        .fetch_one(&*connector.current_pool().await?)
        .await?;
    println!("Schema: {}", schema.0);

    match connector.health() {
        HealthStatus::Ready { generation } => println!("Healthy, pool generation {}", generation),
        other => println!("Health: {:?}", other),
    }

    let stats = connector.stats();
    println!(
        "Refreshes: {}, rotations: {}, credential expires: {}",
        stats.refreshes,
        stats.rotations,
        stats
            .credential_expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    tokio::time::timeout(Duration::from_secs(30), connector.shutdown()).await?;
    Ok(())
}
