// src/server/builder.rs

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use super::handler::{default_handler, ConnCallback, ConnectionFailedCallback, Handler};
use super::listener::bind_tcp;
use super::shutdown::WaitGroup;
use super::{Server, ServerError, ServerState};
use crate::conn::BoxedIo;
use crate::context::ConnContext;

/// A functional option, applied to the builder before the server exists.
///
/// Options only ever see the builder they are handed (an exclusive borrow),
/// so they cannot reach into live listener/connection bookkeeping.
pub type ServerOption = Box<dyn FnOnce(&mut ServerBuilder) -> Result<(), ServerError> + Send>;

/// Builder so callers can inject their session handler and timeout policy.
/// An unset handler resolves at `build` time to one that logs and closes.
#[derive(Default)]
pub struct ServerBuilder {
    handler: Option<Arc<dyn Handler>>,
    conn_callback: Option<ConnCallback>,
    connection_failed_callback: Option<ConnectionFailedCallback>,
    idle_timeout: Option<Duration>,
    max_timeout: Option<Duration>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Run one functional option against the builder.
    pub fn apply(&mut self, option: ServerOption) -> Result<(), ServerError> {
        option(self)
    }

    pub fn build(self) -> Arc<Server> {
        Arc::new(Server {
            handler: self.handler.unwrap_or_else(|| Arc::new(default_handler)),
            conn_callback: self.conn_callback,
            connection_failed_callback: self.connection_failed_callback,
            idle_timeout: self.idle_timeout,
            max_timeout: self.max_timeout,
            state: Mutex::new(ServerState::default()),
            listener_wg: WaitGroup::new(),
            conn_wg: WaitGroup::new(),
        })
    }
}

/// Inactivity deadline for every connection, re-armed on traffic. Zero
/// disables it.
pub fn with_idle_timeout(timeout: Duration) -> ServerOption {
    Box::new(move |builder| {
        builder.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        Ok(())
    })
}

/// Absolute per-connection deadline, fixed at accept time and never reset.
/// Zero disables it.
pub fn with_max_timeout(timeout: Duration) -> ServerOption {
    Box::new(move |builder| {
        builder.max_timeout = (!timeout.is_zero()).then_some(timeout);
        Ok(())
    })
}

/// Install a connection callback; see [`ConnCallback`].
pub fn with_connection_callback<F>(callback: F) -> ServerOption
where
    F: Fn(&ConnContext, BoxedIo) -> Option<BoxedIo> + Send + Sync + 'static,
{
    Box::new(move |builder| {
        builder.conn_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Install a failed-connection callback; see [`ConnectionFailedCallback`].
pub fn with_connection_failed_callback<F>(callback: F) -> ServerOption
where
    F: Fn(&ConnContext, &anyhow::Error) + Send + Sync + 'static,
{
    Box::new(move |builder| {
        builder.connection_failed_callback = Some(Arc::new(callback));
        Ok(())
    })
}

/// Accept connections on `listener` with `handler`, applying `options`
/// first. The first option error is returned before any accept is attempted.
pub async fn serve<H: Handler>(
    listener: TcpListener,
    handler: H,
    options: Vec<ServerOption>,
) -> Result<(), ServerError> {
    let mut builder = ServerBuilder::new().handler(handler);
    for option in options {
        builder.apply(option)?;
    }
    builder.build().serve(listener).await
}

/// Bind `addr`, then serve it with `handler` and `options`.
pub async fn listen_and_serve<H: Handler>(
    addr: SocketAddr,
    handler: H,
    options: Vec<ServerOption>,
) -> Result<(), ServerError> {
    let listener = bind_tcp(addr).await?;
    serve(listener, handler, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_disable_the_deadlines() {
        let mut builder = ServerBuilder::new();
        builder.apply(with_idle_timeout(Duration::ZERO)).unwrap();
        builder.apply(with_max_timeout(Duration::ZERO)).unwrap();
        assert!(builder.idle_timeout.is_none());
        assert!(builder.max_timeout.is_none());

        builder
            .apply(with_idle_timeout(Duration::from_secs(30)))
            .unwrap();
        assert_eq!(builder.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn a_failing_option_short_circuits_apply() {
        let mut builder = ServerBuilder::new();
        let failing: ServerOption =
            Box::new(|_| Err(ServerError::InvalidOption("bad knob".into())));
        let err = builder.apply(failing).unwrap_err();
        assert!(matches!(err, ServerError::InvalidOption(_)));
    }
}
