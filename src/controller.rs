//! The self-pipe/eventfd controller (§4.3): lets any thread interrupt a blocked driver
//! `wait` call, counting how many interruptions are outstanding rather than collapsing
//! them to a single boolean edge the way [`crate::Waker`] does.
//!
//! `interrupt` increments the eventfd counter by `n`; `acknowledge` drains it and
//! returns how many interruptions had accumulated since the last acknowledgement. This
//! lets a scheduler loop distinguish "someone asked me to wake up once" from "three
//! distinct deferred batches were queued while I was asleep" without a separate queue.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::sys::eventfd::EventFd;

pub struct Controller {
    eventfd: EventFd,
}

impl Controller {
    pub fn new() -> io::Result<Controller> {
        Ok(Controller {
            eventfd: EventFd::new()?,
        })
    }

    /// Signals `n` outstanding interruptions (`n` must be nonzero; saturates rather
    /// than overflowing on repeated calls approaching `u64::MAX`).
    pub fn interrupt(&self, n: u64) -> io::Result<()> {
        debug_assert!(n > 0, "interrupt() with n == 0 is a no-op the caller should avoid");
        match self.eventfd.write(n) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // The eventfd counter is saturated; an acknowledge() is already certain
                // to observe a nonzero count, so treat this as delivered.
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the eventfd counter, returning the number of accumulated interruptions
    /// (0 if none were pending).
    pub fn acknowledge(&self) -> io::Result<u64> {
        match self.eventfd.read() {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Controller {
    fn as_raw_fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}

impl Source for Controller {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.eventfd.add(epoll, token, interest, opts)
    }

    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.eventfd.modify(epoll, token, interest, opts)
    }

    fn delete(&self, epoll: &Epoll) -> io::Result<()> {
        self.eventfd.delete(epoll)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interrupts_accumulate_until_acknowledged() {
        let controller = Controller::new().unwrap();
        controller.interrupt(1).unwrap();
        controller.interrupt(2).unwrap();

        assert_eq!(controller.acknowledge().unwrap(), 3);
        assert_eq!(controller.acknowledge().unwrap(), 0);
    }
}
