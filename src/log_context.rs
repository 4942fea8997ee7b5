//! Per-thread logging context (§9 "Global state").
//!
//! Every driver thread accumulates a handful of identifying fields as it descends into
//! a dispatch frame — which session owns the callback, which monitor and thread index is
//! running it, which source or channel it belongs to, the local and remote endpoints.
//! Rather than thread every one of those through each log call, a thread-local context
//! holds the current values and scoped guards push/pop them as dispatch frames are
//! entered and left. [`log`] does the actual formatting and filtering; this module only
//! supplies the extra fields it prefixes onto each record.

use std::cell::RefCell;
use std::fmt;

use crate::endpoint::Endpoint;

/// The fields attributable to the current thread's logging context.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub owner: Option<String>,
    pub monitor_index: Option<usize>,
    pub thread_index: Option<usize>,
    pub source_id: Option<u64>,
    pub channel_id: Option<u64>,
    pub descriptor: Option<i32>,
    pub source_endpoint: Option<Endpoint>,
    pub remote_endpoint: Option<Endpoint>,
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        macro_rules! field {
            ($label:expr, $value:expr) => {
                if let Some(value) = &$value {
                    if wrote {
                        write!(f, " ")?;
                    }
                    write!(f, "{}={}", $label, value)?;
                    wrote = true;
                }
            };
        }
        field!("owner", self.owner);
        field!("monitor", self.monitor_index);
        field!("thread", self.thread_index);
        field!("source", self.source_id);
        field!("channel", self.channel_id);
        field!("fd", self.descriptor);
        field!("local", self.source_endpoint);
        field!("remote", self.remote_endpoint);
        Ok(())
    }
}

thread_local! {
    static CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

/// Returns the current thread's context, formatted for prefixing a log line. Empty if
/// no guard is active on this thread.
pub fn current() -> LogContext {
    CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Clears every field of the current thread's context. Called on worker thread teardown
/// so a thread pool that recycles OS threads across unrelated sessions never leaks one
/// session's identity into another's log lines.
pub fn clear() {
    CONTEXT.with(|ctx| *ctx.borrow_mut() = LogContext::default());
}

macro_rules! scoped_guard {
    ($guard:ident, $field:ident, $value_ty:ty) => {
        /// Restores the previous value of this field when dropped.
        pub struct $guard {
            previous: Option<$value_ty>,
        }

        impl $guard {
            pub fn new(value: $value_ty) -> $guard {
                let previous = CONTEXT.with(|ctx| {
                    let mut ctx = ctx.borrow_mut();
                    std::mem::replace(&mut ctx.$field, Some(value))
                });
                $guard { previous }
            }
        }

        impl Drop for $guard {
            fn drop(&mut self) {
                let previous = self.previous.take();
                CONTEXT.with(|ctx| ctx.borrow_mut().$field = previous);
            }
        }
    };
}

scoped_guard!(OwnerGuard, owner, String);
scoped_guard!(MonitorGuard, monitor_index, usize);
scoped_guard!(ThreadGuard, thread_index, usize);
scoped_guard!(SourceGuard, source_id, u64);
scoped_guard!(ChannelGuard, channel_id, u64);
scoped_guard!(DescriptorGuard, descriptor, i32);
scoped_guard!(SourceEndpointGuard, source_endpoint, Endpoint);
scoped_guard!(RemoteEndpointGuard, remote_endpoint, Endpoint);

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn guard_sets_and_restores_field_on_drop() {
        clear();
        assert!(current().owner.is_none());
        {
            let _guard = OwnerGuard::new("acceptor".to_string());
            assert_eq!(current().owner.as_deref(), Some("acceptor"));
        }
        assert!(current().owner.is_none());
    }

    #[test]
    fn nested_guards_restore_in_reverse_order() {
        clear();
        let _outer = SourceGuard::new(1);
        {
            let _inner = SourceGuard::new(2);
            assert_eq!(current().source_id, Some(2));
        }
        assert_eq!(current().source_id, Some(1));
    }

    #[test]
    fn display_formats_only_populated_fields() {
        clear();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let _guard = RemoteEndpointGuard::new(addr.into());
        let rendered = current().to_string();
        assert_eq!(rendered, "remote=127.0.0.1:9000");
    }

    #[test]
    fn clear_resets_every_field() {
        let _owner = OwnerGuard::new("x".to_string());
        let _thread = ThreadGuard::new(3);
        clear();
        assert!(current().owner.is_none());
        assert!(current().thread_index.is_none());
    }
}
