//! The interest registry (§4.1): a table mapping a registered I/O source to the
//! readiness bits it currently wants, with detach made safe against a concurrent
//! in-flight dispatch.
//!
//! Each entry carries a process counter rather than a plain bool. A thread dispatching
//! a readiness event bumps the counter before invoking the handler and drops it after;
//! `detach` spins until the counter reaches zero so a handler is never freed while a
//! dispatch is still running against it, without requiring the dispatch path to take a
//! lock for the common case.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};

/// A registered interest plus whatever state the owner needs to run its callbacks.
pub struct RegistryEntry<H> {
    handler: Mutex<Option<H>>,
    interest: AtomicUsize,
    active: AtomicBool,
    processing: AtomicUsize,
}

impl<H> RegistryEntry<H> {
    fn new(handler: H, interest: Ready) -> RegistryEntry<H> {
        RegistryEntry {
            handler: Mutex::new(Some(handler)),
            interest: AtomicUsize::new(interest.as_usize()),
            active: AtomicBool::new(true),
            processing: AtomicUsize::new(0),
        }
    }

    pub fn interest(&self) -> Ready {
        Ready::from(self.interest.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the entry as being dispatched against; pairs with `exit`. Returns `false`
    /// (and does not enter) if the entry was detached in the meantime.
    pub fn enter(&self) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.processing.fetch_add(1, Ordering::AcqRel);
        if !self.active.load(Ordering::Acquire) {
            self.exit();
            return false;
        }
        true
    }

    pub fn exit(&self) {
        self.processing.fetch_sub(1, Ordering::AcqRel);
    }

    /// Runs `f` with the handler borrowed, provided the entry is still attached.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> Option<R> {
        let mut guard = self.handler.lock().unwrap();
        guard.as_mut().map(f)
    }
}

/// The registry of interests backing a single driver/epoll instance.
///
/// Keyed by `Token`, stored in an `IndexMap` so iteration order tracks insertion order
/// (useful for deterministic `close_all` ordering in tests) while lookup stays O(1).
pub struct Registry<H> {
    epoll: Epoll,
    entries: Mutex<IndexMap<Token, Arc<RegistryEntry<H>>>>,
    next_token: AtomicUsize,
}

impl<H> Registry<H> {
    pub fn new(epoll: Epoll) -> Registry<H> {
        Registry {
            epoll,
            entries: Mutex::new(IndexMap::new()),
            next_token: AtomicUsize::new(0),
        }
    }

    pub fn epoll(&self) -> &Epoll {
        &self.epoll
    }

    pub fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Attaches a source under a freshly allocated token, returning the token and the
    /// shared entry handle.
    pub fn attach<S>(
        &self,
        source: &S,
        interest: Ready,
        opts: EpollOpt,
        handler: H,
    ) -> io::Result<(Token, Arc<RegistryEntry<H>>)>
    where
        S: Source + ?Sized,
    {
        let token = self.allocate_token();
        let entry = self.attach_with_token(token, source, interest, opts, handler)?;
        Ok((token, entry))
    }

    /// Attaches a source under a token the caller already allocated (via
    /// `allocate_token`), typically because the handler itself needs to know its own
    /// token before it can be constructed (e.g. a self-referential socket session built
    /// with `Arc::new_cyclic`).
    pub fn attach_with_token<S>(
        &self,
        token: Token,
        source: &S,
        interest: Ready,
        opts: EpollOpt,
        handler: H,
    ) -> io::Result<Arc<RegistryEntry<H>>>
    where
        S: Source + ?Sized,
    {
        let entry = Arc::new(RegistryEntry::new(handler, interest));

        self.epoll.add(source, token, interest, opts)?;
        self.entries.lock().unwrap().insert(token, entry.clone());

        Ok(entry)
    }

    pub fn lookup(&self, token: Token) -> Option<Arc<RegistryEntry<H>>> {
        self.entries.lock().unwrap().get(&token).cloned()
    }

    /// Updates the interest mask for an attached source, reflecting it to the driver.
    pub fn show_interest<S>(
        &self,
        token: Token,
        source: &S,
        interest: Ready,
        opts: EpollOpt,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if let Some(entry) = self.lookup(token) {
            entry.interest.store(interest.as_usize(), Ordering::Release);
            self.epoll.modify(source, token, interest, opts)?;
        }
        Ok(())
    }

    /// Detaches a token, blocking (via a short spin) until no in-flight dispatch is
    /// still running against it, then drops the handler.
    pub fn detach<S>(&self, token: Token, source: &S) -> io::Result<Option<H>>
    where
        S: Source + ?Sized,
    {
        let entry = self.entries.lock().unwrap().shift_remove(&token);

        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(None),
        };

        entry.active.store(false, Ordering::Release);

        while entry.processing.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }

        self.epoll.delete(source)?;

        let handler = entry.handler.lock().unwrap().take();
        Ok(handler)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry without touching the driver; used when the owning driver is
    /// itself being torn down and its fd closed wholesale.
    pub fn clear_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain(..) {
            entry.active.store(false, Ordering::Release);
            while entry.processing.load(Ordering::Acquire) > 0 {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::epoll::Epoll;
    use crate::net::tcp::TcpListener;

    #[test]
    fn attach_lookup_detach_roundtrip() {
        let epoll = Epoll::new().unwrap();
        let registry: Registry<u32> = Registry::new(epoll);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (token, entry) = registry
            .attach(&listener, Ready::readable(), EpollOpt::edge(), 7)
            .unwrap();

        assert!(entry.is_active());
        assert_eq!(registry.lookup(token).unwrap().with_handler(|h| *h), Some(7));

        let taken = registry.detach(token, &listener).unwrap();
        assert_eq!(taken, Some(7));
        assert!(registry.lookup(token).is_none());
    }

    #[test]
    fn enter_exit_blocks_out_detached_entries() {
        let epoll = Epoll::new().unwrap();
        let registry: Registry<u32> = Registry::new(epoll);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (token, entry) = registry
            .attach(&listener, Ready::readable(), EpollOpt::edge(), 1)
            .unwrap();

        assert!(entry.enter());
        entry.exit();

        registry.detach(token, &listener).unwrap();
        assert!(!entry.enter());
    }
}
