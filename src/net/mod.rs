//! Non-blocking OS socket wrappers. These are the "OS socket" external collaborator of
//! §6: thin, `Source`-registerable handles around `std::net`/`std::os::unix::net` that
//! `session::stream`/`session::datagram`/`session::listener` drive through connect,
//! read-queue and write-queue state machines.

pub mod tcp;
pub mod udp;
pub mod unix;
