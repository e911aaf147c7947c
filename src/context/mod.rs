// src/context/mod.rs

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::conn::ConnHandle;
use crate::server::Server;

/// Error returned by context accessors when an attribute has not been
/// populated yet. The dispatcher seeds every required attribute before the
/// context reaches a handler, so hitting this from handler code means a
/// broken invariant, not a runtime condition to recover from.
#[derive(Debug, thiserror::Error)]
pub enum AttrError {
    #[error("context attribute `{0}` not populated")]
    NotPopulated(&'static str),
}

/// Connection-scoped attributes. Fixed shape: every attribute the server
/// core or a protocol layer publishes has a named, typed field here.
#[derive(Default)]
pub struct ConnRecord {
    pub user: Option<String>,
    pub session_id: Option<String>,
    pub client_version: Option<String>,
    pub server_version: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub server: Option<Arc<Server>>,
    pub conn: Option<ConnHandle>,
}

/// Per-connection context: a cancellation handle plus a lock-guarded
/// attribute record.
///
/// The two capabilities are deliberately separate objects. Cancellation is
/// observed through [`ConnContext::cancel_token`] and never requires the
/// lock; attribute access always goes through [`ConnContext::lock`] or one
/// of the cloning read accessors. The context does not serialize anything
/// beyond its own record — handler code that shares other per-connection
/// state across tasks holds the same guard while touching it.
#[derive(Clone)]
pub struct ConnContext {
    cancel: CancellationToken,
    record: Arc<Mutex<ConnRecord>>,
}

impl ConnContext {
    pub(crate) fn new(server: &Arc<Server>) -> Self {
        let ctx = Self {
            cancel: CancellationToken::new(),
            record: Arc::new(Mutex::new(ConnRecord::default())),
        };
        ctx.lock().server = Some(Arc::clone(server));
        ctx
    }

    /// Lock the attribute record for reading or mutation. The guard must not
    /// be held across an await point.
    pub fn lock(&self) -> MutexGuard<'_, ConnRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancellation handle for this connection. Cancelling is idempotent and
    /// safe from any task; it signals derived work to stop but does not
    /// interrupt a read/write blocked on the wrapped connection (the
    /// connection deadlines do that).
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the connection has been torn down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Username negotiated for this connection, once a protocol layer has
    /// published it.
    pub fn user(&self) -> Result<String, AttrError> {
        self.lock().user.clone().ok_or(AttrError::NotPopulated("user"))
    }

    /// Unique id assigned to this connection at accept time.
    pub fn session_id(&self) -> Result<String, AttrError> {
        self.lock()
            .session_id
            .clone()
            .ok_or(AttrError::NotPopulated("session_id"))
    }

    pub fn client_version(&self) -> Result<String, AttrError> {
        self.lock()
            .client_version
            .clone()
            .ok_or(AttrError::NotPopulated("client_version"))
    }

    pub fn server_version(&self) -> Result<String, AttrError> {
        self.lock()
            .server_version
            .clone()
            .ok_or(AttrError::NotPopulated("server_version"))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AttrError> {
        self.lock()
            .local_addr
            .ok_or(AttrError::NotPopulated("local_addr"))
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, AttrError> {
        self.lock()
            .remote_addr
            .ok_or(AttrError::NotPopulated("remote_addr"))
    }

    /// Back-reference to the server that accepted this connection.
    pub fn server(&self) -> Result<Arc<Server>, AttrError> {
        self.lock()
            .server
            .clone()
            .ok_or(AttrError::NotPopulated("server"))
    }

    /// Handle to the connection wrapper, once the dispatcher has built it.
    pub fn conn(&self) -> Result<ConnHandle, AttrError> {
        self.lock().conn.clone().ok_or(AttrError::NotPopulated("conn"))
    }
}
