//! Shared HTTP client defaults for the tile backend.

use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TILE_BASE: &str = "https://backend.wplace.live/files/s0/tiles";

fn user_agent() -> String {
    format!("hawk-engine/{}", env!("CARGO_PKG_VERSION"))
}

/// Client with harmonized defaults for upstream tile fetches.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}

/// Base URL of the tile backend; `HAWK_TILE_BASE` overrides for tests
/// and self-hosted mirrors.
pub fn tile_base_from_env() -> String {
    std::env::var("HAWK_TILE_BASE")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_TILE_BASE.to_string())
}
