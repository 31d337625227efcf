// Shared helpers for integration tests
#![allow(dead_code)]

pub mod mock_worker;

use keyword_aggregator::client::{ClientConfig, StreamingClient};
use std::time::Duration;

/// Client pointed at `endpoint` with test-sized timeouts.
pub fn client_for(endpoint: &str) -> StreamingClient {
    StreamingClient::new(ClientConfig {
        endpoint: endpoint.to_string(),
        idle_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        ..ClientConfig::default()
    })
    .expect("client builds")
}

/// `data: <json>\n\n`
pub fn sse(json: &str) -> String {
    format!("data: {json}\n\n")
}
