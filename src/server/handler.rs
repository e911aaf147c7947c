// src/server/handler.rs

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::conn::{BoxedIo, ServerConn};
use crate::context::ConnContext;

/// Per-session entry point, invoked once for every connection that made it
/// through the dispatcher. By the time it runs, the context carries the
/// session id, both addresses, the server back-reference and a handle to
/// the wrapped connection.
///
/// Any async closure or fn with the matching signature is a `Handler`.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: ConnContext, conn: ServerConn) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(ConnContext, ServerConn<BoxedIo>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: ConnContext, conn: ServerConn) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(ctx, conn))
    }
}

/// Fallback used when no handler was configured: log and drop the
/// connection. Resolved once at build time, never a process-wide global.
pub(crate) async fn default_handler(ctx: ConnContext, conn: ServerConn) -> anyhow::Result<()> {
    debug!(session = ?ctx.session_id().ok(), "no handler configured, closing connection");
    drop(conn);
    Ok(())
}

/// Hook run before the handler. Returning a connection continues dispatch
/// with it (possibly a decorated replacement); returning `None` vetoes the
/// connection, which is closed without invoking the handler.
pub type ConnCallback = Arc<dyn Fn(&ConnContext, BoxedIo) -> Option<BoxedIo> + Send + Sync>;

/// Hook run when a connection cannot be established or handled. The
/// underlying socket may already be closed when this fires.
pub type ConnectionFailedCallback = Arc<dyn Fn(&ConnContext, &anyhow::Error) + Send + Sync>;
