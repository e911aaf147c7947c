// src/server/listener.rs
// Encapsulates the low-level TCP bind so callers can swap in a decorated
// listener (proxy-protocol unwrapping etc.) without touching the serve path.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use super::ServerError;

pub async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}
