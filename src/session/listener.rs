//! The listener socket session: `listen`/`accept` plus event callbacks (§6 "Listener
//! socket"). Structurally the simplest of the three session kinds — there is no
//! write/read queue, just an accept loop bounded the same "greedy vs. one-shot" way as
//! the stream session's read loop (§9 "off variant makes at most one OS call per
//! event").

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::epoll::{EpollOpt, Ready, Source, Token};
use crate::error::Error;
use crate::net::tcp::{TcpListener, TcpStream};
use crate::registry::Registry;
use crate::strand::Strand;

use super::Dispatch;

type SessionRegistry = Registry<Arc<dyn Dispatch>>;

pub type AcceptCallback = dyn Fn(io::Result<(TcpStream, std::net::SocketAddr)>) + Send + Sync;

pub struct ListenerSession {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    token: Token,
    strand: Strand,
    max_greedy_iterations: Option<usize>,
    callback: Mutex<Option<Arc<AcceptCallback>>>,
    closed: AtomicBool,
    self_weak: Mutex<Weak<ListenerSession>>,
}

impl ListenerSession {
    pub fn new(
        listener: TcpListener,
        registry: Arc<SessionRegistry>,
        max_greedy_iterations: Option<usize>,
    ) -> io::Result<Arc<ListenerSession>> {
        let token = registry.allocate_token();
        let session = Arc::new_cyclic(|weak| ListenerSession {
            listener,
            registry: registry.clone(),
            token,
            strand: Strand::new(),
            max_greedy_iterations,
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
            self_weak: Mutex::new(weak.clone()),
        });

        let handler: Arc<dyn Dispatch> = session.clone();
        registry.attach_with_token(token, &session.listener, Ready::readable(), EpollOpt::edge(), handler)?;
        Ok(session)
    }

    pub fn on_accept(&self, callback: impl Fn(io::Result<(TcpStream, std::net::SocketAddr)>) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.registry.detach(self.token, &self.listener);
    }

    fn accept_loop(&self) {
        let max_iterations = self.max_greedy_iterations.unwrap_or(usize::MAX);
        let mut iterations = 0;

        loop {
            if iterations >= max_iterations {
                break;
            }
            iterations += 1;

            match self.listener.accept() {
                Ok((stream, addr)) => self.emit(Ok((stream, addr))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.emit(Err(e));
                    break;
                }
            }
        }
    }

    fn emit(&self, result: io::Result<(TcpStream, std::net::SocketAddr)>) {
        if let Some(cb) = self.callback.lock().unwrap().clone() {
            self.strand.post(move || cb(result));
        }
    }
}

impl Dispatch for ListenerSession {
    fn on_readable(&self) {
        if let Some(session) = self.self_weak.lock().unwrap().upgrade() {
            self.strand.post(move || session.accept_loop());
        }
    }

    fn on_writable(&self) {}

    fn on_error(&self, err: Error) {
        self.emit(Err(err.into()));
    }
}
