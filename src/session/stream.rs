//! The stream socket session state machine (§4.7): connect, the read-queue and
//! write-queue event loops, zero-copy completion handling, encryption upgrade/downgrade,
//! and shutdown, all serialized onto the session's own [`Strand`].
//!
//! Generic over the concrete OS stream type (`net::tcp::TcpStream`, `net::unix::UnixStream`)
//! so the state machine itself is written once; only the raw-fd zero-copy plumbing in
//! `submit_zero_copy` is TCP/Linux-specific.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::epoll::{EpollOpt, Ready, Source, Token};
use crate::error::{Context, Error};
use crate::registry::Registry;
use crate::strand::Strand;
use crate::timer::{TimerId, TimerWheel};

use super::handshake::{Frame, FrameType, Handshake, HandshakeAction};
use super::read_queue::ReadQueue;
use super::state::{SessionState, ShutdownDirection};
use super::write_queue::{CompletionFn, SendOptions, WriteQueue};
use super::zerocopy::ZeroCopyQueue;
use super::Dispatch;

type SessionRegistry = Registry<Arc<dyn Dispatch>>;

/// Ambient tuning knobs a scheduler hands every session it creates (§10.3). Mirrors the
/// watermark/buffer-size/zero-copy-threshold/greedy fields named in spec §6's scheduler
/// configuration struct.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub read_low_watermark: usize,
    pub read_high_watermark: usize,
    pub write_low_watermark: usize,
    pub write_high_watermark: usize,
    pub read_buffer_size: usize,
    pub zero_copy_threshold: Option<usize>,
    pub greedy: bool,
    pub max_greedy_iterations: Option<usize>,
    pub keep_half_open: bool,
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            read_low_watermark: 1,
            read_high_watermark: 256 * 1024,
            write_low_watermark: 0,
            write_high_watermark: 256 * 1024,
            read_buffer_size: 16 * 1024,
            zero_copy_threshold: None,
            greedy: true,
            max_greedy_iterations: None,
            keep_half_open: false,
            connect_timeout: None,
        }
    }
}

/// Announcements a session's strand delivers to the user callback, in the order they
/// occur for a given session (§5 "Per-socket" ordering guarantee).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(Error),
    ReadLowWatermark,
    ReadHighWatermark,
    ShutdownReceive,
    WriteLowWatermark,
    WriteHighWatermark,
    ShutdownSend,
    HandshakeEstablished,
    HandshakeFailed(Error),
    Downgraded,
    Error(Error),
    Closed,
}

type EventCallback = dyn Fn(SessionEvent) + Send + Sync;

struct Mutable {
    state: SessionState,
    interest: Ready,
    read_queue: ReadQueue,
    write_queue: WriteQueue,
    zerocopy: ZeroCopyQueue,
    connect_timer: Option<TimerId>,
    /// Present from `upgrade`/`accept_upgrade` until `downgrade` completes (§4.7.5).
    /// While `Some`, the read/write paths frame bytes through it instead of moving them
    /// directly between the OS socket and the plaintext queues.
    handshake: Option<Handshake>,
    /// Ciphertext bytes read off the wire but not yet assembled into a whole frame.
    cipher_inbuf: Vec<u8>,
}

/// A stream socket session: one OS stream socket plus the queues and state machine the
/// driver and user code interact with. Always held behind an `Arc`; `self_weak` closes
/// the cycle described in spec §9 ("Ownership of cyclic references") so strand closures
/// can observe the session having been dropped instead of keeping it alive forever.
pub struct StreamSession<S> {
    io: S,
    registry: Arc<SessionRegistry>,
    token: Token,
    opts: SessionOptions,
    strand: Strand,
    timers: Arc<TimerWheel>,
    mutable: Mutex<Mutable>,
    callback: Mutex<Option<Arc<EventCallback>>>,
    closed: AtomicBool,
    self_weak: Mutex<Weak<StreamSession<S>>>,
}

impl<S> StreamSession<S>
where
    S: AsRawFd + Source + Send + Sync + 'static,
    for<'a> &'a S: Read + Write,
{
    /// `initial_state` is `Connected` for a socket that is already usable (e.g. one
    /// handed back from `accept`) and `Idle` for one the caller will drive through
    /// `begin_connect`. Either way the session registers readable interest up front:
    /// an idle socket mid-connect won't have anything to read yet, and `begin_connect`
    /// swaps the mask to writable immediately after.
    pub fn new(
        io: S,
        registry: Arc<SessionRegistry>,
        timers: Arc<TimerWheel>,
        opts: SessionOptions,
        initial_state: SessionState,
    ) -> io::Result<Arc<StreamSession<S>>> {
        let token = registry.allocate_token();
        let initial_interest = Ready::readable();

        let session = Arc::new_cyclic(|weak| StreamSession {
            io,
            registry: registry.clone(),
            token,
            opts: opts.clone(),
            strand: Strand::new(),
            timers,
            mutable: Mutex::new(Mutable {
                state: initial_state,
                interest: initial_interest,
                read_queue: ReadQueue::new(opts.read_low_watermark, opts.read_high_watermark),
                write_queue: WriteQueue::new(opts.write_low_watermark, opts.write_high_watermark),
                zerocopy: ZeroCopyQueue::new(),
                connect_timer: None,
                handshake: None,
                cipher_inbuf: Vec::new(),
            }),
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
            self_weak: Mutex::new(weak.clone()),
        });

        let handler: Arc<dyn Dispatch> = session.clone();
        registry.attach_with_token(token, &session.io, initial_interest, EpollOpt::edge(), handler)?;
        Ok(session)
    }

    pub fn on_event(&self, callback: impl Fn(SessionEvent) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> SessionState {
        self.mutable.lock().unwrap().state
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(cb) = self.callback.lock().unwrap().clone() {
            self.strand.post(move || cb(event));
        }
    }

    fn this(&self) -> Option<Arc<StreamSession<S>>> {
        self.self_weak.lock().unwrap().upgrade()
    }

    fn update_interest(&self, new: Ready) -> io::Result<()> {
        let mut mutable = self.mutable.lock().unwrap();
        if mutable.interest == new {
            return Ok(());
        }
        mutable.interest = new;
        self.registry.show_interest(self.token, &self.io, new, EpollOpt::edge())
    }

    /// Initiates a connect; the caller's socket must already have issued a non-blocking
    /// `connect()` (per §4.7.1, the session only drives the writable-wait/SO_ERROR
    /// resolution, not the initial syscall, which is the OS-socket collaborator's job).
    pub fn begin_connect(&self) -> io::Result<()> {
        {
            let mut mutable = self.mutable.lock().unwrap();
            mutable.state = SessionState::Connecting;
        }
        self.update_interest(Ready::writable())?;

        if let Some(timeout) = self.opts.connect_timeout {
            if let Some(session) = self.this() {
                let weak = Arc::downgrade(&session);
                let id = self.timers.schedule_after(timeout, move |_| {
                    if let Some(session) = weak.upgrade() {
                        session.strand.post(move || session.on_connect_timeout());
                    }
                });
                self.mutable.lock().unwrap().connect_timer = Some(id);
            }
        }
        Ok(())
    }

    fn on_connect_timeout(&self) {
        let still_connecting = matches!(self.state(), SessionState::Connecting);
        if still_connecting {
            self.fail(Error::Timeout);
        }
    }

    fn cancel_connect_timer(&self) {
        if let Some(id) = self.mutable.lock().unwrap().connect_timer.take() {
            self.timers.cancel(id);
        }
    }

    fn resolve_connect_error(&self) -> Option<Error> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.io.as_raw_fd(),
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

    fn fail(&self, err: Error) {
        self.cancel_connect_timer();
        let was_connecting = matches!(self.state(), SessionState::Connecting);
        self.mutable.lock().unwrap().state = SessionState::Closed;
        self.closed.store(true, Ordering::Release);
        if was_connecting {
            self.emit(SessionEvent::ConnectFailed(err));
        } else {
            self.emit(SessionEvent::Error(err));
        }
        self.emit(SessionEvent::Closed);
    }

    // ---- Dispatch entry points (called from the driver thread via `Dispatch`) ----

    fn handle_writable(&self) {
        if matches!(self.state(), SessionState::Connecting) {
            self.cancel_connect_timer();
            match self.resolve_connect_error() {
                Some(err) => self.fail(err),
                None => {
                    self.mutable.lock().unwrap().state = SessionState::Connected;
                    let _ = self.update_interest(Ready::empty());
                    self.emit(SessionEvent::Connected);
                }
            }
            return;
        }

        self.drive_write_queue();
    }

    fn drive_write_queue(&self) {
        let max_iterations = self.opts.max_greedy_iterations.unwrap_or(usize::MAX);
        let mut iterations = 0;

        loop {
            if iterations >= max_iterations {
                break;
            }
            iterations += 1;

            let zero_copy_threshold = self.opts.zero_copy_threshold;
            let wants_zero_copy = {
                let mut mutable = self.mutable.lock().unwrap();
                match mutable.write_queue.front_mut() {
                    Some(entry) if entry.offset == 0 && entry.zero_copy_requested => {
                        matches!(zero_copy_threshold, Some(t) if entry.data.len() >= t)
                    }
                    Some(_) => false,
                    None => break,
                }
            };

            if wants_zero_copy {
                // Submitted asynchronously; the completion callback (registered inside
                // `submit_zero_copy_front`) runs `complete_front_entry` once the kernel
                // reports the send done, so this path never calls it directly.
                match self.submit_zero_copy_front() {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) if err.is_recoverable() => break,
                    Err(err) => {
                        self.fail(err);
                        return;
                    }
                }
            }

            let mut mutable = self.mutable.lock().unwrap();
            let entry = match mutable.write_queue.front_mut() {
                Some(entry) => entry,
                None => break,
            };

            let write_result = (&self.io).write(entry.remaining());
            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    entry.advance(n);
                    let completed = entry.is_complete();
                    drop(mutable);
                    if completed {
                        self.complete_front_entry();
                    }
                    if !self.opts.greedy {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    drop(mutable);
                    self.fail(Error::from(e));
                    return;
                }
            }
        }

        let empty = self.mutable.lock().unwrap().write_queue.is_empty();
        if empty {
            let _ = self.update_interest(self.current_read_interest());
        }
    }

    fn current_read_interest(&self) -> Ready {
        let backpressured = self.mutable.lock().unwrap().read_queue.is_backpressured();
        if backpressured { Ready::empty() } else { Ready::readable() }
    }

    fn complete_front_entry(&self) {
        let popped = self.mutable.lock().unwrap().write_queue.pop_front_completed();
        if let Some((entry, low_watermark)) = popped {
            let bytes = entry.data.len();
            entry.complete(Ok(Context::new(bytes)));
            if low_watermark {
                self.emit(SessionEvent::WriteLowWatermark);
            }
        }
    }

    /// Submits the queue's front entry as a zero-copy send over a raw Linux socket.
    /// Returns `Ok(true)` if submitted (the completion will fire later, asynchronously,
    /// via `poll_zero_copy_completions`), `Ok(false)` if this session's `io` is not a
    /// raw-fd-capable TCP socket the kernel will accept `MSG_ZEROCOPY` on.
    #[cfg(target_os = "linux")]
    fn submit_zero_copy_front(&self) -> Result<bool, Error> {
        let mut mutable = self.mutable.lock().unwrap();
        let data_ptr;
        let data_len;
        {
            let entry = match mutable.write_queue.front_mut() {
                Some(e) => e,
                None => return Ok(false),
            };
            data_ptr = entry.remaining().as_ptr();
            data_len = entry.remaining().len();
        }

        let ret = unsafe {
            libc::send(
                self.io.as_raw_fd(),
                data_ptr as *const libc::c_void,
                data_len,
                libc::MSG_ZEROCOPY,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(Error::WouldBlock);
            }
            return Err(Error::from(err));
        }

        let n = ret as usize;
        let entry = mutable.write_queue.front_mut().unwrap();
        entry.advance(n);
        let completed = entry.is_complete();

        if completed {
            let weak = self.self_weak.lock().unwrap().clone();
            mutable.zerocopy.submit(1, move || {
                if let Some(session) = weak.upgrade() {
                    session.strand.post(move || session.complete_front_entry());
                }
            });
        }

        Ok(true)
    }

    #[cfg(not(target_os = "linux"))]
    fn submit_zero_copy_front(&self) -> Result<bool, Error> {
        Ok(false)
    }

    /// Called when the driver reports `notifications` readiness (the OS error queue):
    /// drains `MSG_ERRQUEUE` for zero-copy completion records.
    #[cfg(target_os = "linux")]
    pub fn poll_zero_copy_completions(&self) {
        loop {
            match recv_zero_copy_completion(self.io.as_raw_fd()) {
                Some((lo, hi)) => {
                    self.mutable.lock().unwrap().zerocopy.complete(lo, hi);
                }
                None => break,
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn poll_zero_copy_completions(&self) {}

    fn handle_readable(&self) {
        let max_iterations = self.opts.max_greedy_iterations.unwrap_or(usize::MAX);
        let mut iterations = 0;
        let mut buf = vec![0u8; self.opts.read_buffer_size];

        loop {
            if iterations >= max_iterations {
                break;
            }
            iterations += 1;

            match (&self.io).read(&mut buf) {
                Ok(0) => {
                    self.on_shutdown_receive();
                    return;
                }
                Ok(n) => {
                    let is_upgraded = self.mutable.lock().unwrap().handshake.is_some();
                    let backpressured = if is_upgraded {
                        match self.on_cipher_bytes(&buf[..n]) {
                            Ok(backpressured) => backpressured,
                            Err(err) => {
                                self.fail(err);
                                return;
                            }
                        }
                    } else {
                        self.push_plaintext(&buf[..n])
                    };
                    if backpressured {
                        return;
                    }
                    if !self.opts.greedy {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(Error::from(e));
                    return;
                }
            }
        }
    }

    /// Appends plaintext bytes to the read queue and emits the corresponding watermark
    /// events. Returns `true` if back-pressure was just applied (caller should stop its
    /// read loop; readable interest has already been hidden).
    fn push_plaintext(&self, data: &[u8]) -> bool {
        let signal = {
            let mut mutable = self.mutable.lock().unwrap();
            mutable.read_queue.push(data)
        };
        if signal.low_watermark {
            self.emit(SessionEvent::ReadLowWatermark);
        }
        if signal.apply_backpressure {
            self.emit(SessionEvent::ReadHighWatermark);
            let _ = self.update_interest(Ready::empty());
            return true;
        }
        false
    }

    /// Feeds newly-read ciphertext bytes through the handshake/framing layer (§4.7.5):
    /// assembles whole frames out of `cipher_inbuf`, drives the handshake FSM for
    /// control frames, and forwards `Data` frame payloads to the plaintext read queue.
    /// Returns whether back-pressure was applied to a `Data` frame's payload.
    fn on_cipher_bytes(&self, data: &[u8]) -> Result<bool, Error> {
        self.mutable.lock().unwrap().cipher_inbuf.extend_from_slice(data);

        loop {
            let frame = {
                let mut mutable = self.mutable.lock().unwrap();
                match Frame::decode(&mutable.cipher_inbuf).map_err(Error::from)? {
                    Some((frame, consumed)) => {
                        mutable.cipher_inbuf.drain(..consumed);
                        frame
                    }
                    None => return Ok(false),
                }
            };

            if frame.kind == FrameType::Data {
                if self.push_plaintext(&frame.payload) {
                    return Ok(true);
                }
                continue;
            }

            let (action, reply_sequence) = {
                let mut mutable = self.mutable.lock().unwrap();
                let handshake = mutable.handshake.as_mut().ok_or(Error::Invalid)?;
                let action = handshake.on_frame(&frame).map_err(Error::from)?;
                let reply_sequence = matches!(action, HandshakeAction::Send(_)).then(|| handshake.alloc_sequence());
                (action, reply_sequence)
            };

            match action {
                HandshakeAction::Send(kind) => {
                    let reply = Frame { kind, sequence: reply_sequence.unwrap(), payload: Vec::new() };
                    self.send_control_frame(reply)?;
                    // Echoing a `Goodbye` completes this side's half of the downgrade
                    // too: the peer's `Downgraded` only fires once *it* sees this echo,
                    // so the echoing side has to declare itself downgraded right here
                    // rather than waiting for a reply of its own (there isn't one).
                    if kind == FrameType::Goodbye {
                        let remaining = {
                            let mut mutable = self.mutable.lock().unwrap();
                            mutable.handshake = None;
                            mutable.state = SessionState::Connected;
                            std::mem::take(&mut mutable.cipher_inbuf)
                        };
                        self.emit(SessionEvent::Downgraded);
                        if !remaining.is_empty() && self.push_plaintext(&remaining) {
                            return Ok(true);
                        }
                    }
                }
                HandshakeAction::Established => {
                    self.mutable.lock().unwrap().state = SessionState::Encrypted;
                    self.emit(SessionEvent::HandshakeEstablished);
                }
                HandshakeAction::Downgraded => {
                    // Anything still buffered past the `Goodbye` is plaintext, not a
                    // further frame — flush it straight to the read queue rather than
                    // feeding it back through `Frame::decode` next iteration.
                    let remaining = {
                        let mut mutable = self.mutable.lock().unwrap();
                        mutable.handshake = None;
                        mutable.state = SessionState::Connected;
                        std::mem::take(&mut mutable.cipher_inbuf)
                    };
                    self.emit(SessionEvent::Downgraded);
                    return Ok(!remaining.is_empty() && self.push_plaintext(&remaining));
                }
                HandshakeAction::Wait => {}
            }
        }
    }

    fn on_shutdown_receive(&self) {
        let mut mutable = self.mutable.lock().unwrap();
        if mutable.state == SessionState::ShuttingDownReceive || mutable.state == SessionState::ShutDown {
            return;
        }
        mutable.state = match mutable.state {
            SessionState::ShuttingDownSend => SessionState::ShutDown,
            _ => SessionState::ShuttingDownReceive,
        };
        let reached_shutdown = mutable.state == SessionState::ShutDown;
        drop(mutable);

        self.emit(SessionEvent::ShutdownReceive);

        if self.opts.keep_half_open == false {
            self.shutdown(ShutdownDirection::Send);
        }
        if reached_shutdown {
            self.finish_close();
        }
    }

    /// Drains up to `max` bytes the read queue has accumulated, re-showing readable
    /// interest if draining relieves back-pressure.
    pub fn receive(&self, max: usize) -> Vec<u8> {
        let (data, resume) = self.mutable.lock().unwrap().read_queue.drain(max);
        if resume {
            let _ = self.update_interest(Ready::readable());
        }
        data
    }

    /// Client-initiated encryption upgrade (§4.7.5): sends `Hello` and transitions
    /// `Connected -> Upgrading`. The session reaches `Encrypted` once the `Accept`
    /// reply arrives, announced via `SessionEvent::HandshakeEstablished`.
    pub fn upgrade(&self) -> Result<(), Error> {
        let mut mutable = self.mutable.lock().unwrap();
        if mutable.state != SessionState::Connected {
            return Err(Error::Invalid);
        }
        let mut handshake = Handshake::client();
        let hello = handshake.start().expect("client handshake always produces a hello");
        mutable.handshake = Some(handshake);
        mutable.state = SessionState::Upgrading;
        drop(mutable);
        self.send_control_frame(hello)
    }

    /// Server-side counterpart of `upgrade`: arms a handshake that waits passively for
    /// the peer's `Hello` instead of sending one (§4.7.5 "server: default →
    /// hello-received → ...").
    pub fn accept_upgrade(&self) -> Result<(), Error> {
        let mut mutable = self.mutable.lock().unwrap();
        if mutable.state != SessionState::Connected {
            return Err(Error::Invalid);
        }
        mutable.handshake = Some(Handshake::server());
        mutable.state = SessionState::Upgrading;
        Ok(())
    }

    /// Issues the protocol-level goodbye (§4.7.5 "Downgrade"); the session returns to
    /// plaintext once the peer's goodbye is observed (`SessionEvent::Downgraded`).
    pub fn downgrade(&self) -> Result<(), Error> {
        let mut mutable = self.mutable.lock().unwrap();
        if mutable.state != SessionState::Encrypted {
            return Err(Error::Invalid);
        }
        let goodbye = mutable
            .handshake
            .as_mut()
            .ok_or(Error::Invalid)?
            .begin_downgrade()
            .map_err(Error::from)?;
        mutable.state = SessionState::Downgrading;
        drop(mutable);
        self.send_control_frame(goodbye)
    }

    fn send_control_frame(&self, frame: Frame) -> Result<(), Error> {
        let signal = self.mutable.lock().unwrap().write_queue.push(frame.encode(), SendOptions::default(), None);
        if signal.show_writable {
            let _ = self.update_interest(Ready::readable() | Ready::writable());
        }
        self.drive_write_queue();
        Ok(())
    }

    pub fn send(&self, data: Vec<u8>, options: SendOptions, completion: Option<CompletionFn>) -> Result<(), Error> {
        if !self.state().can_send() {
            if let Some(cb) = completion {
                cb(Err(Error::NotConnected));
            }
            return Err(Error::NotConnected);
        }

        let data = {
            let mut mutable = self.mutable.lock().unwrap();
            let state = mutable.state;
            match mutable.handshake.as_mut() {
                Some(h) if state == SessionState::Encrypted => h.next_data_frame(data).map_err(Error::from)?.encode(),
                // Mid-handshake (Upgrading/Downgrading): application data has nowhere
                // to go until `Encrypted`.
                Some(_) => {
                    drop(mutable);
                    if let Some(cb) = completion {
                        cb(Err(Error::NotConnected));
                    }
                    return Err(Error::NotConnected);
                }
                None => data,
            }
        };

        let signal = self.mutable.lock().unwrap().write_queue.push(data, options, completion);
        if signal.crossed_high_watermark {
            self.emit(SessionEvent::WriteHighWatermark);
        }
        if signal.show_writable {
            let _ = self.update_interest(Ready::readable() | Ready::writable());
            self.drive_write_queue();
        }
        Ok(())
    }

    pub fn shutdown(&self, direction: ShutdownDirection) {
        let mut mutable = self.mutable.lock().unwrap();
        let next = match (mutable.state, direction) {
            (SessionState::ShutDown, _) | (SessionState::Closed, _) => {
                return;
            }
            (SessionState::ShuttingDownReceive, ShutdownDirection::Send)
            | (SessionState::ShuttingDownSend, ShutdownDirection::Receive) => SessionState::ShutDown,
            (_, ShutdownDirection::Both) => SessionState::ShutDown,
            (_, ShutdownDirection::Send) => SessionState::ShuttingDownSend,
            (_, ShutdownDirection::Receive) => SessionState::ShuttingDownReceive,
        };

        if next == mutable.state {
            return;
        }
        mutable.state = next;
        mutable.write_queue.cancel_all();
        drop(mutable);

        match direction {
            ShutdownDirection::Send | ShutdownDirection::Both => {
                let _ = self.shutdown_os(std::net::Shutdown::Write);
                self.emit(SessionEvent::ShutdownSend);
            }
            ShutdownDirection::Receive => {
                self.emit(SessionEvent::ShutdownReceive);
            }
        }

        if next == SessionState::ShutDown {
            self.finish_close();
        }
    }

    fn shutdown_os(&self, how: std::net::Shutdown) -> io::Result<()> {
        let flag = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.io.as_raw_fd(), flag)).map(|_| ())
    }

    fn finish_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_connect_timer();
        self.mutable.lock().unwrap().state = SessionState::Closed;
        let _ = self.registry.detach(self.token, &self.io);
        self.emit(SessionEvent::Closed);
    }

    pub fn close(&self) {
        self.shutdown(ShutdownDirection::Both);
        self.finish_close();
    }
}

impl<S> Dispatch for StreamSession<S>
where
    S: AsRawFd + Source + Send + Sync + 'static,
    for<'a> &'a S: Read + Write,
{
    fn on_readable(&self) {
        if let Some(session) = self.this() {
            self.strand.post(move || session.handle_readable());
        }
    }

    fn on_writable(&self) {
        if let Some(session) = self.this() {
            self.strand.post(move || session.handle_writable());
        }
    }

    fn on_notifications(&self) {
        if let Some(session) = self.this() {
            self.strand.post(move || session.poll_zero_copy_completions());
        }
    }

    fn on_error(&self, err: Error) {
        if let Some(session) = self.this() {
            self.strand.post(move || session.fail(err));
        }
    }
}

/// Parses one zero-copy completion record out of `MSG_ERRQUEUE`, if one is pending.
/// Returns the kernel-reported inclusive `(lo, hi)` 32-bit counter range.
#[cfg(target_os = "linux")]
fn recv_zero_copy_completion(fd: std::os::unix::io::RawFd) -> Option<(u32, u32)> {
    // Mirrors the layout of `struct sock_extended_err` from `linux/errqueue.h`; defined
    // locally rather than trusting a particular `libc` crate version to export it.
    #[repr(C)]
    struct SockExtendedErr {
        ee_errno: u32,
        ee_origin: u8,
        ee_type: u8,
        ee_code: u8,
        ee_pad: u8,
        ee_info: u32,
        ee_data: u32,
    }

    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

    let mut control = [0u8; 128];
    let mut iov = libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 0;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
    if ret < 0 {
        return None;
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_IP || hdr.cmsg_level == libc::SOL_IPV6 {
                let data = libc::CMSG_DATA(cmsg) as *const SockExtendedErr;
                let err = &*data;
                if err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                    return Some((err.ee_info, err.ee_data));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::epoll::Epoll;
    use crate::net::tcp::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::Duration;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(Registry::new(Epoll::new().unwrap()))
    }

    #[test]
    fn connect_exchange_shutdown_scenario() {
        // §8 scenario 1, minus the peer side (the full round trip, both EOFs included,
        // is exercised end-to-end in tests/connect_exchange_shutdown.rs); here just
        // connect -> established -> send -> shutdown on one session.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_stream = TcpStream::connect(addr).unwrap();
        let registry = registry();
        let timers = Arc::new(TimerWheel::new());

        let session = StreamSession::new(
            client_stream,
            registry.clone(),
            timers,
            SessionOptions::default(),
            SessionState::Idle,
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        session.on_event(move |ev| {
            let _ = tx.send(format!("{:?}", ev));
        });

        session.begin_connect().unwrap();

        // Drive the reactor by hand (no scheduler in this unit test): wait for
        // writable, then dispatch.
        let mut events = crate::epoll::Events::with_capacity(8);
        registry.epoll().wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        session.on_writable();

        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg, "Connected");

        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn handshake_upgrade_then_downgrade_scenario() {
        // §8 scenario 5 (client/server reach `established`), plus downgrade: the client
        // then issues `downgrade`, and both sides observe `Downgraded` and return to
        // plaintext `Connected`.
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        let client_raw = TcpStream::connect(addr).unwrap();
        let (server_raw_std, _) = std_listener.accept().unwrap();
        let server_raw = TcpStream::new(server_raw_std).unwrap();

        let registry = registry();
        let timers = Arc::new(TimerWheel::new());

        let client = StreamSession::new(
            client_raw,
            registry.clone(),
            timers.clone(),
            SessionOptions::default(),
            SessionState::Connected,
        )
        .unwrap();
        let server = StreamSession::new(
            server_raw,
            registry.clone(),
            timers,
            SessionOptions::default(),
            SessionState::Connected,
        )
        .unwrap();

        let (client_tx, client_rx) = mpsc::channel();
        client.on_event(move |ev| {
            let _ = client_tx.send(format!("{:?}", ev));
        });
        let (server_tx, server_rx) = mpsc::channel();
        server.on_event(move |ev| {
            let _ = server_tx.send(format!("{:?}", ev));
        });

        server.accept_upgrade().unwrap();
        client.upgrade().unwrap();

        let pump = |registry: &Arc<SessionRegistry>| {
            let mut events = crate::epoll::Events::with_capacity(8);
            let _ = registry.epoll().wait(&mut events, Some(Duration::from_millis(50)));
            client.on_readable();
            client.on_writable();
            server.on_readable();
            server.on_writable();
        };

        let mut client_established = false;
        let mut server_established = false;
        for _ in 0..50 {
            if client_established && server_established {
                break;
            }
            pump(&registry);
            while let Ok(msg) = client_rx.try_recv() {
                client_established |= msg == "HandshakeEstablished";
            }
            while let Ok(msg) = server_rx.try_recv() {
                server_established |= msg == "HandshakeEstablished";
            }
        }
        assert!(client_established, "client never reached Encrypted");
        assert!(server_established, "server never reached Encrypted");
        assert_eq!(client.state(), SessionState::Encrypted);
        assert_eq!(server.state(), SessionState::Encrypted);

        client.downgrade().unwrap();

        let mut client_downgraded = false;
        let mut server_downgraded = false;
        for _ in 0..50 {
            if client_downgraded && server_downgraded {
                break;
            }
            pump(&registry);
            while let Ok(msg) = client_rx.try_recv() {
                client_downgraded |= msg == "Downgraded";
            }
            while let Ok(msg) = server_rx.try_recv() {
                server_downgraded |= msg == "Downgraded";
            }
        }
        assert!(client_downgraded, "client never downgraded");
        assert!(server_downgraded, "server never downgraded");
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(server.state(), SessionState::Connected);
    }
}
