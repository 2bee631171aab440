//! Path-aware (SCION) transport.
//!
//! A path-aware address is written `<ISD>-<AS>,[<host>]:<port>`. Before a
//! socket can be opened the process-wide stack must be initialised against
//! the local AS daemon and the dispatcher, which then hands out ports and
//! relays datagrams over a Unix socket.
//!
//! The dispatcher framing used here (cookie, frame type, length, payload) is
//! a simplified local protocol, not the wire format of a production SCION
//! dispatcher. Talking to a real deployment needs a client for its actual
//! daemon and dispatcher APIs behind the same [`PathAwareSocket`] surface.

mod address;
mod error;
mod socket;
mod stack;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{IsdAs, ScionAddr, MAX_AS};
pub use error::{ScionError, ScionResult};
pub use socket::PathAwareSocket;
pub use stack::{
    bind, global, init, ScionStack, StackContext, StackPaths, DEFAULT_DAEMON_SOCKET_DIR,
    DEFAULT_DISPATCHER_SOCKET,
};
