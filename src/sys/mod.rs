//! Platform glue. The only concrete `Driver` (C2) backend implemented here is epoll;
//! the `crate::driver::Driver` trait is the seam a kqueue/IOCP/poll/select backend would
//! plug into without touching the registry, timer wheel, or session layers above it.

#[macro_use]
mod macros;

pub mod epoll;
pub mod eventfd;
pub mod fd;

pub use self::epoll::{Epoll, Events};
