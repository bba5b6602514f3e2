//! ClickHouse health checks.

use tracing::{debug, error};

use crate::client::ClickHouseClient;
use crate::layers::{Layer, StoreError};
use crate::schema::{all_tables, create_database};

/// Round-trip a trivial query.
pub async fn check_connection(client: &ClickHouseClient) -> bool {
    let result = client.server().query("SELECT 1").fetch_one::<u8>().await;
    if let Err(e) = &result {
        error!(url = %client.config().url, error = %e, "ClickHouse ping failed");
    } else {
        debug!(url = %client.config().url, "ClickHouse reachable");
    }
    result.is_ok()
}

/// Create the database and layer tables if missing.
pub async fn init_schema(client: &ClickHouseClient) -> Result<(), StoreError> {
    let database = &client.config().database;

    client
        .server()
        .query(&create_database(database))
        .execute()
        .await
        .map_err(|e| StoreError::backend(Layer::Raw, format!("failed to create database: {e}")))?;

    for ddl in all_tables(database) {
        client
            .server()
            .query(&ddl)
            .execute()
            .await
            .map_err(|e| StoreError::backend(Layer::Raw, format!("failed to execute DDL: {e}")))?;
    }

    debug!(database = %database, "ClickHouse schema initialized");
    Ok(())
}
