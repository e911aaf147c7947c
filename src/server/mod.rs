// src/server/mod.rs

mod builder;
mod error;
mod handler;
mod listener;
mod shutdown;

pub use builder::{
    listen_and_serve, serve, with_connection_callback, with_connection_failed_callback,
    with_idle_timeout, with_max_timeout, ServerBuilder, ServerOption,
};
pub use error::ServerError;
pub use handler::{ConnCallback, ConnectionFailedCallback, Handler};
pub use listener::bind_tcp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::shutdown::WaitGroup;
use crate::conn::{BoxedIo, ServerConn};
use crate::context::ConnContext;
use crate::retry::{is_temporary, AcceptBackoff};

/// Version string published on every connection context.
const SERVER_VERSION: &str = concat!("lineserve-", env!("CARGO_PKG_VERSION"));

/// Connection-lifecycle core of the service: accepts connections, bounds
/// each with the configured timeout policy, gives each a cancellable context
/// and coordinates graceful shutdown across listeners and live connections.
///
/// Configuration is fixed at build time ([`ServerBuilder`]); the mutable
/// bookkeeping (listener set, connection set, shutdown gate) changes only
/// under the server's exclusive lock. A fully drained server (zero
/// listeners, zero connections) can be reused: the first listener registered
/// after draining gets a fresh shutdown gate.
pub struct Server {
    handler: Arc<dyn Handler>,
    conn_callback: Option<ConnCallback>,
    connection_failed_callback: Option<ConnectionFailedCallback>,
    idle_timeout: Option<Duration>,
    max_timeout: Option<Duration>,

    state: Mutex<ServerState>,
    listener_wg: WaitGroup,
    conn_wg: WaitGroup,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    listeners: HashMap<u64, SocketAddr>,
    conns: HashMap<u64, CancellationToken>,
    done: Option<CancellationToken>,
}

impl Server {
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current shutdown gate, lazily created.
    fn done_token(&self) -> CancellationToken {
        let mut state = self.lock_state();
        state
            .done
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Close the gate if it is still open. Racing closers are linearized by
    /// the state lock; the second one finds the gate closed and does nothing.
    fn close_done_locked(state: &mut ServerState) {
        let done = state.done.get_or_insert_with(CancellationToken::new);
        if !done.is_cancelled() {
            done.cancel();
        }
    }

    fn track_listener_add(&self, addr: SocketAddr) -> u64 {
        let mut state = self.lock_state();
        // A drained server being reused gets a fresh gate.
        if state.listeners.is_empty() && state.conns.is_empty() {
            state.done = None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, addr);
        self.listener_wg.add();
        id
    }

    fn track_listener_remove(&self, id: u64) {
        let mut state = self.lock_state();
        state.listeners.remove(&id);
        self.listener_wg.done();
    }

    fn track_conn_add(&self, token: CancellationToken) -> u64 {
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.conns.insert(id, token);
        self.conn_wg.add();
        id
    }

    fn track_conn_remove(&self, id: u64) {
        let mut state = self.lock_state();
        state.conns.remove(&id);
        self.conn_wg.done();
    }

    pub fn listener_count(&self) -> usize {
        self.lock_state().listeners.len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_state().conns.len()
    }

    /// Accept connections on `listener` until a fatal error or shutdown.
    ///
    /// Returns [`ServerError::ServerClosed`] after a graceful stop and the
    /// underlying io error on anything fatal. Temporary accept errors are
    /// retried in place with exponential backoff (5ms doubling, capped at
    /// 1s) and never surface to the caller. Each accepted connection is
    /// dispatched to its own task; the loop never blocks on a connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let id = self.track_listener_add(local_addr);
        // The gate cannot be replaced while this listener is registered, so
        // one clone is valid for the whole call.
        let done = self.done_token();
        info!(%local_addr, "listening");

        let mut backoff = AcceptBackoff::default();
        let result = loop {
            let accepted = tokio::select! {
                _ = done.cancelled() => break Err(ServerError::ServerClosed),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    debug!(%peer, "accepted connection");
                    tokio::spawn(Arc::clone(&self).handle_conn(stream));
                }
                Err(err) => {
                    // Shutdown takes priority over reporting the error.
                    if done.is_cancelled() {
                        break Err(ServerError::ServerClosed);
                    }
                    if is_temporary(&err) {
                        let delay = backoff.next_delay();
                        warn!(%err, ?delay, "temporary accept error, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    break Err(err.into());
                }
            }
        };
        self.track_listener_remove(id);
        result
    }

    /// Dispatch one accepted connection: build its context, run the
    /// connection callback, wrap the stream and hand off to the handler.
    async fn handle_conn(self: Arc<Self>, stream: TcpStream) {
        let ctx = ConnContext::new(&self);
        let (local_addr, peer_addr) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(peer)) => (local, peer),
            (Err(err), _) | (_, Err(err)) => {
                warn!(%err, "dropping connection without usable addresses");
                self.connection_failed(&ctx, &anyhow::Error::from(err));
                ctx.cancel_token().cancel();
                return;
            }
        };
        {
            let mut record = ctx.lock();
            record.session_id = Some(Uuid::new_v4().simple().to_string());
            record.server_version = Some(SERVER_VERSION.to_string());
            record.local_addr = Some(local_addr);
            record.remote_addr = Some(peer_addr);
        }

        let mut io: BoxedIo = Box::new(stream);
        if let Some(callback) = &self.conn_callback {
            match callback(&ctx, io) {
                Some(replacement) => io = replacement,
                None => {
                    // Rejection is policy, not failure: close and move on.
                    debug!(%peer_addr, "connection rejected by callback");
                    ctx.cancel_token().cancel();
                    return;
                }
            }
        }

        let conn = ServerConn::new(
            io,
            self.idle_timeout,
            self.max_timeout,
            ctx.cancel_token().clone(),
        );
        ctx.lock().conn = Some(conn.handle());

        let id = self.track_conn_add(ctx.cancel_token().clone());
        if let Err(err) = self.handler.handle(ctx.clone(), conn).await {
            warn!(%peer_addr, %err, "connection handler failed");
            self.connection_failed(&ctx, &err);
        }
        self.track_conn_remove(id);
        ctx.cancel_token().cancel();
    }

    fn connection_failed(&self, ctx: &ConnContext, err: &anyhow::Error) {
        if let Some(callback) = &self.connection_failed_callback {
            callback(ctx, err);
        }
    }

    /// Request a graceful stop: close the shutdown gate, then wait until
    /// every tracked listener and connection has deregistered.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            Self::close_done_locked(&mut state);
        }
        self.listener_wg.wait().await;
        self.conn_wg.wait().await;
    }

    /// Stop without draining: close the shutdown gate and cancel the context
    /// of every live connection. Handlers observe the cancellation
    /// cooperatively; io already blocked on a connection is terminated by
    /// deadline enforcement, not by this call.
    pub fn close(&self) {
        let mut state = self.lock_state();
        Self::close_done_locked(&mut state);
        for token in state.conns.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn gate_resets_only_when_fully_drained() {
        let server = ServerBuilder::new().build();
        let first = server.done_token();
        {
            let mut state = server.lock_state();
            Server::close_done_locked(&mut state);
        }
        assert!(first.is_cancelled());

        // First listener on a drained server gets a fresh, open gate.
        let l1 = server.track_listener_add(test_addr());
        let fresh = server.done_token();
        assert!(!fresh.is_cancelled());

        // A second listener while the first is registered must not reset.
        {
            let mut state = server.lock_state();
            Server::close_done_locked(&mut state);
        }
        let l2 = server.track_listener_add(test_addr());
        assert!(server.done_token().is_cancelled());

        server.track_listener_remove(l2);
        server.track_listener_remove(l1);
    }

    #[test]
    fn gate_is_not_reset_while_connections_are_outstanding() {
        let server = ServerBuilder::new().build();
        let conn_id = server.track_conn_add(CancellationToken::new());
        {
            let mut state = server.lock_state();
            Server::close_done_locked(&mut state);
        }

        let listener_id = server.track_listener_add(test_addr());
        assert!(server.done_token().is_cancelled());

        server.track_listener_remove(listener_id);
        server.track_conn_remove(conn_id);
    }

    #[test]
    fn closing_the_gate_twice_is_a_noop() {
        let server = ServerBuilder::new().build();
        let token = server.done_token();
        {
            let mut state = server.lock_state();
            Server::close_done_locked(&mut state);
            Server::close_done_locked(&mut state);
        }
        assert!(token.is_cancelled());
    }

    #[test]
    fn counts_follow_registration() {
        let server = ServerBuilder::new().build();
        assert_eq!(server.listener_count(), 0);
        assert_eq!(server.connection_count(), 0);

        let l = server.track_listener_add(test_addr());
        let c = server.track_conn_add(CancellationToken::new());
        assert_eq!(server.listener_count(), 1);
        assert_eq!(server.connection_count(), 1);

        server.track_conn_remove(c);
        server.track_listener_remove(l);
        assert_eq!(server.listener_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn close_cancels_tracked_connection_tokens() {
        let server = ServerBuilder::new().build();
        let token = CancellationToken::new();
        let id = server.track_conn_add(token.clone());

        server.close();
        assert!(token.is_cancelled());
        server.track_conn_remove(id);
    }
}
