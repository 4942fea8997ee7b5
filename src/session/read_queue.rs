//! The read queue (§4.7.2 / §3 "Read queue"): accumulates bytes copied from the OS
//! receive buffer and applies back-pressure once the accumulated size crosses a
//! high-watermark.
//!
//! The blob is modeled as a single growable `Vec<u8>` rather than a real chain of
//! pooled buffers (the buffer-pool contract is named in spec §6 as an external
//! collaborator, out of scope for this core) so the watermark arithmetic can be
//! exercised without a pool implementation.

use std::collections::VecDeque;

/// What the caller should do in response to bytes landing in the read queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadQueueSignal {
    /// Size crossed at or above the low watermark; the user should be told bytes are
    /// available to drain.
    pub low_watermark: bool,
    /// Size crossed above the high watermark; the caller must hide readable interest.
    pub apply_backpressure: bool,
}

pub struct ReadQueue {
    buf: VecDeque<u8>,
    low_watermark: usize,
    high_watermark: usize,
    backpressured: bool,
}

impl ReadQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> ReadQueue {
        assert!(low_watermark <= high_watermark, "low watermark must not exceed high watermark");
        ReadQueue {
            buf: VecDeque::new(),
            low_watermark,
            high_watermark,
            backpressured: false,
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured
    }

    /// Appends newly received bytes, returning which watermark events the caller should
    /// announce. `apply_backpressure` is only `true` on the transition into
    /// back-pressure (it does not re-fire every push while still above the watermark).
    pub fn push(&mut self, data: &[u8]) -> ReadQueueSignal {
        self.buf.extend(data.iter().copied());

        let low_watermark = self.buf.len() >= self.low_watermark && !data.is_empty();
        let mut apply_backpressure = false;

        if self.buf.len() > self.high_watermark && !self.backpressured {
            self.backpressured = true;
            apply_backpressure = true;
        }

        ReadQueueSignal { low_watermark, apply_backpressure }
    }

    /// Drains up to `max` bytes in FIFO order. Returns whether the queue has fallen
    /// back to at or below the high watermark, i.e. whether readable interest should be
    /// re-shown.
    pub fn drain(&mut self, max: usize) -> (Vec<u8>, bool) {
        let n = max.min(self.buf.len());
        let out: Vec<u8> = self.buf.drain(..n).collect();

        let resume = self.backpressured && self.buf.len() <= self.high_watermark;
        if resume {
            self.backpressured = false;
        }

        (out, resume)
    }

    pub fn drain_all(&mut self) -> (Vec<u8>, bool) {
        self.drain(self.buf.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn back_pressure_scenario_from_spec() {
        // §8 scenario 3: high-watermark=1024, push 2048 without draining.
        let mut q = ReadQueue::new(256, 1024);

        let signal = q.push(&vec![0u8; 2048]);
        assert!(signal.apply_backpressure);
        assert!(q.is_backpressured());

        // Drain 512: queue = 1536 > 1024, still backpressured.
        let (_drained, resume) = q.drain(512);
        assert!(!resume);
        assert!(q.is_backpressured());

        // Drain down to 512 remaining: queue = 512 <= 1024, resume.
        let (_drained, resume) = q.drain(1024);
        assert!(resume);
        assert!(!q.is_backpressured());
        assert_eq!(q.size(), 512);
    }

    #[test]
    fn low_watermark_does_not_fire_on_empty_push() {
        let mut q = ReadQueue::new(4, 100);
        let signal = q.push(&[]);
        assert!(!signal.low_watermark);
    }

    #[test]
    fn repeated_pushes_above_high_watermark_do_not_refire_backpressure() {
        let mut q = ReadQueue::new(1, 4);
        assert!(q.push(&[1, 2, 3, 4, 5]).apply_backpressure);
        assert!(!q.push(&[6]).apply_backpressure);
    }
}
