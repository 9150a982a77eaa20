//! Health endpoint
//!
//! `GET /health` reports seconds since the relay tunnel's last handshake:
//! 200 while the peer handshook within the last three minutes, 503
//! otherwise, `-1` before any handshake at all.

use crate::error::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use wirebroker_tunnel::Device;

/// Handshakes older than this mark the broker unhealthy.
pub const STALE_HANDSHAKE_SECS: i64 = 180;

pub fn router(device: Arc<Device>) -> Router {
    Router::new().route("/health", get(health)).with_state(device)
}

/// Bind and serve until the process exits.
pub async fn serve(addr: SocketAddr, device: Arc<Device>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("health endpoint on http://{}/health", addr);
    axum::serve(listener, router(device))
        .await
        .map_err(crate::error::Error::Io)?;
    Ok(())
}

async fn health(State(device): State<Arc<Device>>) -> (StatusCode, String) {
    let ipc = device.ipc_get().await;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let (status, body) = evaluate(&ipc, now);
    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), body)
}

/// Pure decision: the IPC text and the current unix time in, status and body
/// out.
pub fn evaluate(ipc: &str, now_unix: i64) -> (u16, String) {
    let last_handshake = ipc
        .lines()
        .find_map(|line| line.strip_prefix("last_handshake_time_sec="))
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);

    if last_handshake == 0 {
        return (503, "-1".to_string());
    }

    let since = now_unix - last_handshake;
    let body = format!("Seconds since handshake: {}", since);
    if since > STALE_HANDSHAKE_SECS {
        (503, body)
    } else {
        (200, body)
    }
}
