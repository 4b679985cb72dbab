//! Server configuration surface.

use std::thread;

/// Default cap on a single request frame's payload: 256 MiB.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 256 * 1024 * 1024;

/// Recognized configuration options for [`crate::server::RpcServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Prefer the platform's native transport. Only honored on Linux
    /// x86-64; elsewhere the flag is recorded but has no effect.
    pub native_transport: bool,
    /// Number of accept/I-O worker tasks.
    pub worker_threads: usize,
    /// Set `TCP_NODELAY` on accepted sockets.
    pub tcp_nodelay: bool,
    /// Set `SO_KEEPALIVE` on accepted sockets.
    pub tcp_keepalive: bool,
    /// Maximum payload length of a single request frame.
    pub max_request_size: usize,
    /// Whether the server requires authenticated clients.
    pub security_enabled: bool,
    /// Permit unauthenticated clients to proceed when security is enabled.
    pub allow_fallback_to_simple_auth: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            native_transport: true,
            worker_threads: default_worker_threads(),
            tcp_nodelay: true,
            tcp_keepalive: true,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            security_enabled: false,
            allow_fallback_to_simple_auth: false,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Set the number of worker tasks, clamped to at least one.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Set the maximum request frame payload length.
    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted sockets.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Enable or disable `SO_KEEPALIVE` on accepted sockets.
    #[must_use]
    pub fn tcp_keepalive(mut self, enabled: bool) -> Self {
        self.tcp_keepalive = enabled;
        self
    }

    /// Enable or disable the native-transport preference.
    #[must_use]
    pub fn native_transport(mut self, enabled: bool) -> Self {
        self.native_transport = enabled;
        self
    }

    /// Require authenticated clients.
    #[must_use]
    pub fn security_enabled(mut self, enabled: bool) -> Self {
        self.security_enabled = enabled;
        self
    }

    /// Permit unauthenticated clients when security is enabled.
    #[must_use]
    pub fn allow_fallback_to_simple_auth(mut self, allowed: bool) -> Self {
        self.allow_fallback_to_simple_auth = allowed;
        self
    }

    /// Whether the native-transport preference is actually in effect on this
    /// platform.
    #[must_use]
    pub fn native_transport_active(&self) -> bool {
        self.native_transport && cfg!(all(target_os = "linux", target_arch = "x86_64"))
    }
}

fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map_or(1, |n| n.get() / 4)
        .max(1)
}
