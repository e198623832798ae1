//! Socket protection
//!
//! Sockets toward real destinations must bypass the virtual interface, or the
//! relay would capture its own traffic. Platforms expose this as a per-socket
//! call (a VPN service's `protect(fd)`, a routing mark, an interface binding);
//! [`SocketProtector`] carries that call to every socket the relay opens.

use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Protect callback: receives the raw socket descriptor, returns success
pub type ProtectCallback = Arc<dyn Fn(i32) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct SocketProtector {
    callback: Option<ProtectCallback>,
}

impl fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketProtector")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl SocketProtector {
    /// Protector that allows every socket
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(i32) -> bool + Send + Sync + 'static,
    {
        Self { callback: Some(Arc::new(callback)) }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Run the callback for `fd`. Without a callback every socket is allowed.
    pub fn protect_fd(&self, fd: i32) -> io::Result<()> {
        let Some(callback) = &self.callback else {
            return Ok(());
        };
        if callback(fd) {
            debug!("Socket fd={} protected", fd);
            Ok(())
        } else {
            warn!("Socket fd={} protection FAILED", fd);
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("socket fd={} could not be protected", fd),
            ))
        }
    }

    #[cfg(unix)]
    pub fn protect(&self, socket: &impl std::os::unix::io::AsRawFd) -> io::Result<()> {
        self.protect_fd(socket.as_raw_fd())
    }

    #[cfg(not(unix))]
    pub fn protect<S>(&self, _socket: &S) -> io::Result<()> {
        Ok(())
    }
}
