//! Socket sessions (C7, §4.7): the stream/datagram/listener state machines that sit
//! between the registry/driver below and user code above, plus the supporting pieces
//! (read queue, write queue, zero-copy bookkeeping, handshake FSM) each session wires
//! together.

use crate::error::Error;

pub mod datagram;
pub mod handshake;
pub mod listener;
pub mod read_queue;
pub mod state;
pub mod stream;
pub mod write_queue;
pub mod zerocopy;

pub use datagram::DatagramSession;
pub use listener::ListenerSession;
pub use state::{HandshakeState, SessionState, ShutdownDirection};
pub use stream::{SessionEvent, SessionOptions, StreamSession};

/// What a driver thread calls on a registry entry's handler once it has looked the
/// entry up by token and entered it (§4.1 `lookup_and_enter`/`exit`). Implemented by
/// `StreamSession` and the listener/datagram session types; kept a plain `&self` trait
/// (not `self: Arc<Self>`) so `Registry<Arc<dyn Dispatch>>` stays object-safe — sessions
/// that need to extend their own lifetime across a strand hand-off keep a private `Weak`
/// back-reference instead (see `StreamSession::self_weak`).
pub trait Dispatch: Send + Sync {
    fn on_readable(&self);
    fn on_writable(&self);
    /// OS-level error-queue notifications: zero-copy completions, receive timestamps.
    fn on_notifications(&self) {}
    fn on_error(&self, err: Error);
}
