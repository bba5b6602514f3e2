//! ClickHouse for the layer tests.
//!
//! The broker is always the in-memory transport; only the store is real.
//! `STOPSEARCH_TEST_CLICKHOUSE_URL` points the tests at an existing server
//! (with optional `_DB`, `_USER`, `_PASSWORD`) instead of starting one.

use std::time::Duration;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

use store::StoreConfig;

pub const TEST_DATABASE: &str = "stopsearch_test";
const IMAGE: (&str, &str) = ("clickhouse/clickhouse-server", "24.3");
const HTTP_PORT: u16 = 8123;

pub struct TestContainers {
    /// Held so the container lives as long as the test
    _clickhouse: Option<ContainerAsync<GenericImage>>,
    pub store: StoreConfig,
}

fn test_env(suffix: &str) -> Option<String> {
    std::env::var(format!("STOPSEARCH_TEST_CLICKHOUSE_{suffix}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

impl TestContainers {
    pub async fn start() -> Self {
        if let Some(url) = test_env("URL") {
            let store = StoreConfig {
                url,
                database: test_env("DB").unwrap_or_else(|| TEST_DATABASE.to_string()),
                username: test_env("USER"),
                password: test_env("PASSWORD"),
                init_schema: true,
            };
            return Self {
                _clickhouse: None,
                store,
            };
        }

        let container = GenericImage::new(IMAGE.0, IMAGE.1)
            .with_wait_for(WaitFor::seconds(5))
            .with_exposed_port(HTTP_PORT.tcp())
            .with_env_var("CLICKHOUSE_DEFAULT_ACCESS_MANAGEMENT", "1")
            .start()
            .await
            .expect("Failed to start ClickHouse container");

        let port = container
            .get_host_port_ipv4(HTTP_PORT)
            .await
            .expect("ClickHouse HTTP port not mapped");
        let url = format!("http://127.0.0.1:{port}");
        wait_until_ready(&url, Duration::from_secs(30)).await;

        Self {
            _clickhouse: Some(container),
            store: StoreConfig {
                url,
                database: TEST_DATABASE.to_string(),
                username: Some("default".to_string()),
                password: None,
                init_schema: true,
            },
        }
    }
}

/// Poll the `/ping` endpoint until it answers.
async fn wait_until_ready(url: &str, timeout: Duration) {
    let http = reqwest::Client::new();
    let ping = format!("{url}/ping");
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if let Ok(resp) = http.get(&ping).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("ClickHouse at {url} not ready after {timeout:?}");
}
