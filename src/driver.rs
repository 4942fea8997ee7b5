//! The reactor/proactor seam (§4.2). `Driver` is the thin interface the rest of the
//! runtime programs against; `EpollDriver` is the only backend implemented here
//! (kqueue/IOCP/poll/select are left as a seam for a platform-specific crate to fill in
//! later, as noted in the expanded specification).

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::epoll::{Epoll, EpollOpt, Event, Events, Ready, Source, Token};
use crate::error::Error;

/// One readiness notification handed back from a `wait` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverEvent {
    pub token: Token,
    pub readiness: Ready,
}

impl DriverEvent {
    fn from_epoll_event(event: Event) -> DriverEvent {
        DriverEvent {
            token: event.token(),
            readiness: event.readiness(),
        }
    }
}

/// Resolves `SO_ERROR` on a socket that raised `EPOLLERR`. The driver itself only has a
/// `Token` to go on per event, not the registered source, so this is called by whoever
/// does have the fd at hand (a session's own `resolve_connect_error`/`fail` path) rather
/// than from inside `Driver::wait` itself.
pub(crate) fn resolve_socket_error<S: AsRawFd>(fd: &S) -> Option<Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 && err != 0 {
        Some(Error::from(io::Error::from_raw_os_error(err)))
    } else {
        None
    }
}

/// The operations a proactor/reactor backend must provide. A concrete backend owns no
/// policy: it only multiplexes file descriptors and reports readiness.
pub trait Driver {
    fn add<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized;

    fn modify<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized;

    fn remove<S>(&self, source: &S) -> io::Result<()>
    where
        S: Source + ?Sized;

    /// Blocks until at least one event is ready or `timeout` elapses (`None` blocks
    /// forever), appending the observed events to `events`. Returns the number of
    /// events appended.
    fn wait(&self, events: &mut Vec<DriverEvent>, timeout: Option<Duration>) -> io::Result<usize>;
}

/// The epoll-backed `Driver`.
pub struct EpollDriver {
    epoll: Epoll,
    scratch: std::cell::RefCell<Events>,
}

impl EpollDriver {
    pub fn new() -> io::Result<EpollDriver> {
        Ok(EpollDriver {
            epoll: Epoll::new()?,
            scratch: std::cell::RefCell::new(Events::with_capacity(1024)),
        })
    }

    pub fn epoll(&self) -> &Epoll {
        &self.epoll
    }
}

impl Driver for EpollDriver {
    fn add<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.epoll.add(source, token, interest, opts)
    }

    fn modify<S>(&self, source: &S, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.epoll.modify(source, token, interest, opts)
    }

    fn remove<S>(&self, source: &S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.epoll.delete(source)
    }

    fn wait(&self, events: &mut Vec<DriverEvent>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut scratch = self.scratch.borrow_mut();
        let n = self.epoll.wait(&mut scratch, timeout)?;

        let mut appended = 0;
        for i in 0..scratch.len() {
            if let Some(event) = scratch.get(i) {
                events.push(DriverEvent::from_epoll_event(event));
                appended += 1;
            }
        }

        Ok(appended)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::tcp::TcpListener;

    #[test]
    fn wait_times_out_with_no_ready_sources() {
        let driver = EpollDriver::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        driver
            .add(&listener, Token(0), Ready::readable(), EpollOpt::edge())
            .unwrap();

        let mut events = Vec::new();
        let n = driver.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }
}
