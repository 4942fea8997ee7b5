//! Minimal awaitable sugar over a callback slot (§9 "Coroutine support").
//!
//! This is not a `std::future::Future` executor — there is no polling, no waker, and no
//! task queue. An [`Awaitable<T>`] is a one-shot cell: a callback-driven operation (a
//! connect, a resolve, a send completion) gets a [`Completer<T>`] to fill in when it
//! finishes, and the caller's thread blocks on the paired `Awaitable` until a value
//! shows up. It exists so call sites that already think in terms of "do this, then
//! continue with the result" don't have to hand-roll a condvar each time.
//!
//! [`ResolverExt`] is the one place this crate plugs the sugar into a real callback
//! slot: a blocking `get_ip_address`/`get_port` built directly on top of
//! [`crate::resolver::Resolver`]'s own asynchronous methods.

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::resolver::{Resolver, ResolverOptions};

struct Inner<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// The waiting half of a one-shot callback result.
pub struct Awaitable<T> {
    inner: Arc<Inner<T>>,
}

/// The completing half; fills in the paired [`Awaitable`]'s value exactly once.
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a fresh awaitable pair. The callback that eventually produces a result holds
/// the `Completer`; whoever wants to block for that result holds the `Awaitable`.
pub fn pair<T>() -> (Awaitable<T>, Completer<T>) {
    let inner = Arc::new(Inner {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Awaitable {
            inner: inner.clone(),
        },
        Completer { inner },
    )
}

impl<T> Awaitable<T> {
    /// Blocks the calling thread until the completer runs, then returns its value.
    pub fn wait(self) -> T {
        let mut guard = self.inner.value.lock().unwrap();
        while guard.is_none() {
            guard = self.inner.ready.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }

    /// Blocks for at most `timeout`, returning `None` if the completer hasn't run yet.
    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        let mut guard = self.inner.value.lock().unwrap();
        loop {
            if guard.is_some() {
                return guard.take();
            }
            let (next_guard, timeout_result) = self.inner.ready.wait_timeout(guard, timeout).unwrap();
            guard = next_guard;
            if timeout_result.timed_out() {
                return guard.take();
            }
        }
    }

    /// Whether the completer has already run, without blocking.
    pub fn is_ready(&self) -> bool {
        self.inner.value.lock().unwrap().is_some()
    }
}

impl<T> Completer<T> {
    /// Fills in the paired awaitable's value and wakes any thread blocked on it.
    pub fn complete(self, value: T) {
        *self.inner.value.lock().unwrap() = Some(value);
        self.inner.ready.notify_all();
    }
}

/// Blocking sugar over [`Resolver`], for call sites that would rather wait for the
/// answer on the spot than hand the collaborator a callback of their own. Each method
/// hands the resolver a `Completer` and blocks the caller's `Awaitable` on it, so the
/// lookup still runs exactly the way it would through the callback interface.
pub trait ResolverExt: Resolver {
    fn get_ip_address_blocking(&self, domain: &str, options: ResolverOptions) -> io::Result<Vec<IpAddr>> {
        let (awaitable, completer) = pair();
        let completer = Mutex::new(Some(completer));
        self.get_ip_address(domain, options, Arc::new(move |result| {
            complete_once(&completer, result);
        }));
        awaitable.wait()
    }

    fn get_port_blocking(&self, service: &str, options: ResolverOptions) -> io::Result<u16> {
        let (awaitable, completer) = pair();
        let completer = Mutex::new(Some(completer));
        self.get_port(service, options, Arc::new(move |result| {
            complete_once(&completer, result);
        }));
        awaitable.wait()
    }
}

impl<R: Resolver + ?Sized> ResolverExt for R {}

// `Completer<T>::complete` consumes `self`, but the callback slots above are `Fn`, not
// `FnOnce`, so the completer has to be moved in behind a cell that can be taken exactly
// once. Every resolver in this crate only ever invokes its callback a single time.
fn complete_once<T>(completer: &Mutex<Option<Completer<T>>>, value: T) {
    if let Some(completer) = completer.lock().unwrap().take() {
        completer.complete(value);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_completed() {
        let (awaitable, completer) = pair::<i32>();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(42);
        });
        assert_eq!(awaitable.wait(), 42);
    }

    #[test]
    fn is_ready_reflects_completion_state() {
        let (awaitable, completer) = pair::<&'static str>();
        assert!(!awaitable.is_ready());
        completer.complete("done");
        assert!(awaitable.is_ready());
        assert_eq!(awaitable.wait(), "done");
    }

    #[test]
    fn wait_timeout_returns_none_when_not_completed_in_time() {
        let (awaitable, _completer) = pair::<i32>();
        assert_eq!(awaitable.wait_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn wait_timeout_returns_value_once_completed() {
        let (awaitable, completer) = pair::<i32>();
        completer.complete(7);
        assert_eq!(awaitable.wait_timeout(Duration::from_millis(50)), Some(7));
    }

    #[test]
    fn resolver_ext_blocks_until_the_callback_completes_it() {
        use crate::resolver::SystemResolver;

        let resolver = SystemResolver::default();
        let port = resolver
            .get_port_blocking("https", ResolverOptions::default())
            .unwrap();
        assert_eq!(port, 443);

        let addrs = resolver
            .get_ip_address_blocking("localhost", ResolverOptions::default())
            .unwrap();
        assert!(!addrs.is_empty());
    }
}
