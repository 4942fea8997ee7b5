//! The deferred-function queue (§4.5): an MPSC queue of boxed closures that a strand or
//! scheduler drains between I/O waits, bounded per drain pass so a flood of submissions
//! cannot starve the reactor.

use std::io;

use crate::queue::{PopError, Queue};

pub type DeferredFn = Box<dyn FnOnce() + Send>;

pub struct DeferredQueue {
    inner: Queue<DeferredFn>,
}

/// Why a `drain` pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue ran dry before the cycle budget was exhausted.
    Empty,
    /// The cycle budget was exhausted with work still queued.
    BudgetExhausted,
}

impl DeferredQueue {
    pub fn unbounded() -> io::Result<DeferredQueue> {
        Ok(DeferredQueue {
            inner: Queue::unbounded()?,
        })
    }

    /// Submits `f` to run on whatever thread next calls `drain`.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) -> Result<(), DeferredFn> {
        self.inner.push(Box::new(f)).map_err(|e| e.into_inner())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Runs up to `max_cycles` queued functions, returning why it stopped. A function
    /// that panics unwinds past this call; callers that need isolation should catch
    /// panics inside the submitted closure itself.
    pub fn drain(&self, max_cycles: usize) -> DrainOutcome {
        for _ in 0..max_cycles {
            match self.inner.pop() {
                Ok(f) => f(),
                Err(PopError::Empty) => return DrainOutcome::Empty,
                Err(PopError::Closed) => return DrainOutcome::Empty,
            }
        }

        if self.inner.is_empty() {
            DrainOutcome::Empty
        } else {
            DrainOutcome::BudgetExhausted
        }
    }
}

impl Clone for DeferredQueue {
    fn clone(&self) -> DeferredQueue {
        DeferredQueue {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_runs_queued_functions_in_order() {
        let queue = DeferredQueue::unbounded().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue.defer(move || order.lock().unwrap().push(i)).unwrap();
        }

        let outcome = queue.drain(10);
        assert_eq!(outcome, DrainOutcome::Empty);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn drain_respects_cycle_budget() {
        let queue = DeferredQueue::unbounded().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            queue.defer(move || { count.fetch_add(1, Ordering::SeqCst); }).unwrap();
        }

        let outcome = queue.drain(2);
        assert_eq!(outcome, DrainOutcome::BudgetExhausted);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len(), 3);

        let outcome = queue.drain(10);
        assert_eq!(outcome, DrainOutcome::Empty);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
