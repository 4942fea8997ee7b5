//! The datagram socket session: `send_to`/`receive_from` plus event callbacks (§6
//! "Datagram socket"). Datagrams have no byte-stream ordering or back-pressure queue to
//! maintain — each readable wakeup yields zero or more whole packets, and each `send_to`
//! is either accepted by the OS immediately or rejected; there is no partial-write
//! bookkeeping the way the stream write queue needs.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::epoll::{EpollOpt, Ready, Source, Token};
use crate::error::Error;
use crate::net::udp::UdpSocket;
use crate::registry::Registry;
use crate::strand::Strand;

use super::Dispatch;

type SessionRegistry = Registry<Arc<dyn Dispatch>>;

pub type DatagramCallback = dyn Fn(io::Result<(Vec<u8>, SocketAddr)>) + Send + Sync;

pub struct DatagramSession {
    socket: UdpSocket,
    registry: Arc<SessionRegistry>,
    token: Token,
    strand: Strand,
    buffer_size: usize,
    max_greedy_iterations: Option<usize>,
    callback: Mutex<Option<Arc<DatagramCallback>>>,
    closed: AtomicBool,
    self_weak: Mutex<Weak<DatagramSession>>,
}

impl DatagramSession {
    pub fn new(
        socket: UdpSocket,
        registry: Arc<SessionRegistry>,
        buffer_size: usize,
        max_greedy_iterations: Option<usize>,
    ) -> io::Result<Arc<DatagramSession>> {
        let token = registry.allocate_token();
        let session = Arc::new_cyclic(|weak| DatagramSession {
            socket,
            registry: registry.clone(),
            token,
            strand: Strand::new(),
            buffer_size,
            max_greedy_iterations,
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
            self_weak: Mutex::new(weak.clone()),
        });

        let handler: Arc<dyn Dispatch> = session.clone();
        registry.attach_with_token(token, &session.socket, Ready::readable(), EpollOpt::edge(), handler)?;
        Ok(session)
    }

    pub fn on_datagram(&self, callback: impl Fn(io::Result<(Vec<u8>, SocketAddr)>) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        self.socket.send_to(data, addr).map_err(Error::from)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.registry.detach(self.token, &self.socket);
    }

    fn receive_loop(&self) {
        let max_iterations = self.max_greedy_iterations.unwrap_or(usize::MAX);
        let mut iterations = 0;
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            if iterations >= max_iterations {
                break;
            }
            iterations += 1;

            match self.socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.emit(Ok((buf[..n].to_vec(), addr))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.emit(Err(e));
                    break;
                }
            }
        }
    }

    fn emit(&self, result: io::Result<(Vec<u8>, SocketAddr)>) {
        if let Some(cb) = self.callback.lock().unwrap().clone() {
            self.strand.post(move || cb(result));
        }
    }
}

impl Dispatch for DatagramSession {
    fn on_readable(&self) {
        if let Some(session) = self.self_weak.lock().unwrap().upgrade() {
            self.strand.post(move || session.receive_loop());
        }
    }

    fn on_writable(&self) {}

    fn on_error(&self, err: Error) {
        self.emit(Err(err.into()));
    }
}
