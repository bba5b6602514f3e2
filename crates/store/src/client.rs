//! ClickHouse client wrapper.

use clickhouse::Client;
use tracing::info;

use crate::config::StoreConfig;

/// HTTP client for the layer database.
///
/// `inner` has the database selected; [`server`](Self::server) does not,
/// for the statement that creates it.
#[derive(Clone)]
pub struct ClickHouseClient {
    inner: Client,
    config: StoreConfig,
}

fn authenticated(config: &StoreConfig) -> Client {
    let client = Client::default().with_url(&config.url);
    let client = match &config.username {
        Some(user) => client.with_user(user),
        None => client,
    };
    match &config.password {
        Some(pass) => client.with_password(pass),
        None => client,
    }
}

impl ClickHouseClient {
    pub fn new(config: StoreConfig) -> Self {
        let inner = authenticated(&config).with_database(&config.database);
        info!(url = %config.url, database = %config.database, "ClickHouse client ready");
        Self { inner, config }
    }

    pub fn server(&self) -> Client {
        authenticated(&self.config)
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}
