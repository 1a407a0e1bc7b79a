/*!
 * @file health.rs
 * @brief HTTP health endpoint
 */

use crate::config::HealthConfig;
use serde::Serialize;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::Filter;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

pub fn health_status() -> HealthStatus {
    HealthStatus { status: "ok" }
}

/// Serve `GET /health` until the shutdown token fires.
pub fn spawn_health_server(
    config: &HealthConfig,
    host: &str,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.enabled {
        return None;
    }

    let route = warp::path("health")
        .and(warp::get())
        .map(|| warp::reply::json(&health_status()));

    let addr: SocketAddr = format!("{}:{}", host, config.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], config.port)));

    let (bound, server) = warp::serve(route).bind_with_graceful_shutdown(addr, async move {
        shutdown.cancelled().await;
    });
    info!("Health endpoint listening on http://{}/health", bound);

    Some(tokio::spawn(server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_shape() {
        let rendered = serde_json::to_string(&health_status()).unwrap();
        assert_eq!(rendered, r#"{"status":"ok"}"#);
    }
}
