//! Registry of open connections.
//!
//! Used only for counting and bulk shutdown. The listening socket is never
//! registered here, so the registry size is exactly the number of open
//! client connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

pub(crate) struct ConnectionEntry {
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) token: CancellationToken,
}

/// Concurrent set of live connections.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Register a connection, returning a guard that removes it on drop.
    pub(crate) fn register(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
        token: CancellationToken,
    ) -> RegistrationGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(id, ConnectionEntry { peer, token });
        metrics::inc_connections();
        RegistrationGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Number of open connections.
    pub(crate) fn len(&self) -> usize { self.entries.len() }

    /// Request every registered connection to close.
    pub(crate) fn close_all(&self) {
        for entry in &self.entries {
            debug!(peer = ?entry.peer, "closing connection");
            entry.token.cancel();
        }
    }
}

/// RAII registration: dropping the guard removes the connection from the
/// registry.
pub(crate) struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.id);
        metrics::dec_connections();
    }
}
