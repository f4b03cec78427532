//! Per-stream deferral queue backing async-mode emission.
//!
//! Async mode postpones data and end emission to "the next turn". The turn
//! boundary is this queue: jobs enqueue in FIFO order and run when the
//! queue drains, including jobs enqueued by jobs already draining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct DeferQueue {
    queue: Mutex<VecDeque<Deferred>>,
    draining: AtomicBool,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.lock().push_back(Box::new(job));
    }

    /// Run queued jobs in FIFO order until the queue is empty. Nested
    /// drains are no-ops; the outermost drain picks their work up.
    pub fn drain(&self) {
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        self.draining.store(false, Ordering::Release);
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = DeferQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            q.enqueue(move || seen.lock().push(i));
        }
        q.drain();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        // A second drain finds nothing left to run.
        q.drain();
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_jobs_enqueued_while_draining_run_in_same_drain() {
        let q = Arc::new(DeferQueue::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let q2 = q.clone();
            let seen = seen.clone();
            q.enqueue(move || {
                seen.lock().push("first");
                let seen2 = seen.clone();
                q2.enqueue(move || seen2.lock().push("second"));
            });
        }
        q.drain();
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }
}
