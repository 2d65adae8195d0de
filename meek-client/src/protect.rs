//! Socket protection hook
//!
//! When the host runs a system-wide VPN, connections to the relay must be
//! excluded from the VPN interface or they would loop back into the tunnel
//! they are carrying. The host passes a [`SocketProtector`] that marks raw
//! sockets as exempt; it is invoked on every outbound socket after creation
//! and before connect.

#[cfg(unix)]
pub type RawSocketHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSocketHandle = std::os::windows::io::RawSocket;

/// Host-provided VPN exclusion hook.
pub trait SocketProtector: Send + Sync {
    /// Mark `socket` as exempt from the VPN route. Returns false if the
    /// socket could not be protected; the connection attempt is abandoned.
    fn protect(&self, socket: RawSocketHandle) -> bool;
}

/// Protector for hosts without a VPN to escape.
pub struct NoProtect;

impl SocketProtector for NoProtect {
    fn protect(&self, _socket: RawSocketHandle) -> bool {
        true
    }
}

impl<F> SocketProtector for F
where
    F: Fn(RawSocketHandle) -> bool + Send + Sync,
{
    fn protect(&self, socket: RawSocketHandle) -> bool {
        self(socket)
    }
}
