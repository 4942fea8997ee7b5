//! The write queue (§4.7.3 / §3 "Write queue"): an ordered list of pending send entries,
//! each carrying its own completion callback, with watermark accounting over bytes
//! enqueued but not yet acknowledged as sent-to-wire.

use std::collections::VecDeque;

use crate::error::{Context, Error};

/// How a single `send` call wants its entry handled.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Request a zero-copy send if the entry meets the configured size threshold.
    pub zero_copy: bool,
}

pub type CompletionFn = Box<dyn FnOnce(Result<Context, Error>) + Send>;

pub struct WriteEntry {
    pub data: Vec<u8>,
    pub offset: usize,
    pub zero_copy_requested: bool,
    completion: Option<CompletionFn>,
}

impl WriteEntry {
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    /// Completes this entry, invoking its callback (if any) exactly once.
    pub fn complete(mut self, result: Result<Context, Error>) {
        if let Some(cb) = self.completion.take() {
            cb(result);
        }
    }
}

impl Drop for WriteEntry {
    fn drop(&mut self) {
        // An entry dropped without `complete` having been called (queue torn down, or
        // session closed with sends outstanding) still owes its callback a cancelled
        // outcome, per §8's "exactly one of success/error/cancelled" invariant.
        if let Some(cb) = self.completion.take() {
            cb(Err(Error::Cancelled));
        }
    }
}

/// Why a `push` requires the caller to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteQueueSignal {
    /// The queue was empty before this push; the caller should show writable interest.
    pub show_writable: bool,
    /// Enqueuing this entry would cross the high watermark; per §3 the caller is
    /// responsible for either rejecting the write or surfacing a high-watermark event,
    /// depending on configuration. This queue always accepts the write and reports the
    /// crossing; rejection policy lives in the session layer.
    pub crossed_high_watermark: bool,
}

pub struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    enqueued_bytes: usize,
    low_watermark: usize,
    high_watermark: usize,
}

impl WriteQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> WriteQueue {
        assert!(low_watermark <= high_watermark, "low watermark must not exceed high watermark");
        WriteQueue {
            entries: VecDeque::new(),
            enqueued_bytes: 0,
            low_watermark,
            high_watermark,
        }
    }

    pub fn enqueued_bytes(&self) -> usize {
        self.enqueued_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, data: Vec<u8>, options: SendOptions, completion: Option<CompletionFn>) -> WriteQueueSignal {
        let show_writable = self.entries.is_empty();
        let len = data.len();

        self.entries.push_back(WriteEntry {
            data,
            offset: 0,
            zero_copy_requested: options.zero_copy,
            completion,
        });

        let was_below = self.enqueued_bytes <= self.high_watermark;
        self.enqueued_bytes += len;
        let crossed_high_watermark = was_below && self.enqueued_bytes > self.high_watermark;

        WriteQueueSignal { show_writable, crossed_high_watermark }
    }

    pub fn front_mut(&mut self) -> Option<&mut WriteEntry> {
        self.entries.front_mut()
    }

    /// Removes the front entry (it must already be `is_complete()`), returning whether
    /// the queue size has fallen to or below the low watermark as a result.
    pub fn pop_front_completed(&mut self) -> Option<(WriteEntry, bool)> {
        let entry = self.entries.front()?;
        if !entry.is_complete() {
            return None;
        }
        let entry = self.entries.pop_front().unwrap();
        self.enqueued_bytes = self.enqueued_bytes.saturating_sub(entry.data.len());
        let low_watermark = self.enqueued_bytes <= self.low_watermark;
        Some((entry, low_watermark))
    }

    /// Drains every entry, completing each with `Err(Error::Cancelled)`; used by
    /// `shutdown(send)`/`close` to resolve whatever was left outstanding.
    pub fn cancel_all(&mut self) {
        for entry in self.entries.drain(..) {
            entry.complete(Err(Error::Cancelled));
        }
        self.enqueued_bytes = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn first_push_requests_writable_interest() {
        let mut q = WriteQueue::new(0, 1024);
        let signal = q.push(vec![1, 2, 3], SendOptions::default(), None);
        assert!(signal.show_writable);

        let signal = q.push(vec![4], SendOptions::default(), None);
        assert!(!signal.show_writable);
    }

    #[test]
    fn completed_entry_fires_callback_exactly_once() {
        let mut q = WriteQueue::new(0, 1024);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        q.push(
            vec![1, 2, 3],
            SendOptions::default(),
            Some(Box::new(move |res| {
                assert!(res.is_ok());
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );

        q.front_mut().unwrap().advance(3);
        let (entry, _low) = q.pop_front_completed().unwrap();
        entry.complete(Ok(Context::new(3)));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_incomplete_entry_cancels_it() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        {
            let mut q = WriteQueue::new(0, 1024);
            q.push(
                vec![1, 2, 3],
                SendOptions::default(),
                Some(Box::new(move |res| {
                    assert_eq!(res, Err(Error::Cancelled));
                    f.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn low_watermark_reported_when_queue_drains_back_down() {
        let mut q = WriteQueue::new(2, 10);
        q.push(vec![0u8; 8], SendOptions::default(), None);
        q.front_mut().unwrap().advance(8);
        let (_entry, low) = q.pop_front_completed().unwrap();
        assert!(low);
    }
}
