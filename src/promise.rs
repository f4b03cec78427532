//! Settle-once completion values.
//!
//! A [`Promise`] settles exactly once, runs callbacks registered before it
//! settled, fires immediately for callbacks registered after, and can also
//! be awaited as a [`Future`]. Streams hand these out for `promise()`,
//! `collect()`, `concat()` and async iteration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::chunk::Chunk;

/// Promise state.
#[derive(Debug, Clone)]
pub enum PromiseState<T, E> {
    /// Not yet settled.
    Pending,
    /// Resolved with a value.
    Fulfilled(T),
    /// Rejected with an error.
    Rejected(E),
}

struct PromiseInner<T, E> {
    state: PromiseState<T, E>,
    on_fulfilled: Vec<Box<dyn FnOnce(T) + Send>>,
    on_rejected: Vec<Box<dyn FnOnce(E) + Send>>,
    wakers: Vec<Waker>,
}

/// A shareable, awaitable settle-once value.
pub struct Promise<T, E> {
    inner: Arc<Mutex<PromiseInner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Promise<T, E> {
    /// Create a new pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner {
                state: PromiseState::Pending,
                on_fulfilled: Vec::new(),
                on_rejected: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// Create a promise already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let p = Self::new();
        p.resolve(value);
        p
    }

    /// Create a promise already rejected with `error`.
    pub fn rejected(error: E) -> Self {
        let p = Self::new();
        p.reject(error);
        p
    }

    /// Resolve the promise. Later settle attempts are ignored.
    pub fn resolve(&self, value: T) {
        let (callbacks, wakers) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Fulfilled(value.clone());
            inner.on_rejected.clear();
            (
                std::mem::take(&mut inner.on_fulfilled),
                std::mem::take(&mut inner.wakers),
            )
        };
        for callback in callbacks {
            callback(value.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Reject the promise. Later settle attempts are ignored.
    pub fn reject(&self, error: E) {
        let (callbacks, wakers) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, PromiseState::Pending) {
                return;
            }
            inner.state = PromiseState::Rejected(error.clone());
            inner.on_fulfilled.clear();
            (
                std::mem::take(&mut inner.on_rejected),
                std::mem::take(&mut inner.wakers),
            )
        };
        for callback in callbacks {
            callback(error.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Register a fulfillment callback; runs immediately if already
    /// fulfilled.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let immediate = {
            let mut inner = self.inner.lock();
            match &inner.state {
                PromiseState::Fulfilled(value) => Some(value.clone()),
                PromiseState::Pending => {
                    inner.on_fulfilled.push(Box::new(callback));
                    return;
                }
                PromiseState::Rejected(_) => return,
            }
        };
        if let Some(value) = immediate {
            callback(value);
        }
    }

    /// Register a rejection callback; runs immediately if already rejected.
    pub fn catch<F>(&self, callback: F)
    where
        F: FnOnce(E) + Send + 'static,
    {
        let immediate = {
            let mut inner = self.inner.lock();
            match &inner.state {
                PromiseState::Rejected(error) => Some(error.clone()),
                PromiseState::Pending => {
                    inner.on_rejected.push(Box::new(callback));
                    return;
                }
                PromiseState::Fulfilled(_) => return,
            }
        };
        if let Some(error) = immediate {
            callback(error);
        }
    }

    /// Current state.
    pub fn state(&self) -> PromiseState<T, E> {
        self.inner.lock().state.clone()
    }

    /// Whether the promise has resolved or rejected.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.lock().state, PromiseState::Pending)
    }
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Default for Promise<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static, E: Clone + Send + 'static> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock();
        match &inner.state {
            PromiseState::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            PromiseState::Rejected(error) => Poll::Ready(Err(error.clone())),
            PromiseState::Pending => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Everything a stream emitted, gathered by `collect()`.
///
/// `data_length` is the total payload size in byte and text modes and zero
/// in object mode.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub items: Vec<Chunk>,
    pub data_length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_resolve_fires_registered_callback() {
        let p = Promise::<i32, String>::new();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        p.then(move |v| {
            assert_eq!(v, 42);
            flag.store(true, Ordering::Relaxed);
        });
        p.resolve(42);
        assert!(called.load(Ordering::Relaxed));
        assert!(p.is_settled());
    }

    #[test]
    fn test_late_then_fires_immediately() {
        let p = Promise::<i32, String>::resolved(7);
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        p.then(move |v| {
            assert_eq!(v, 7);
            flag.store(true, Ordering::Relaxed);
        });
        assert!(called.load(Ordering::Relaxed));
    }

    #[test]
    fn test_settle_is_single_shot() {
        let p = Promise::<i32, String>::new();
        p.resolve(1);
        p.resolve(2);
        p.reject("late".to_string());
        assert!(matches!(p.state(), PromiseState::Fulfilled(1)));
    }

    #[test]
    fn test_reject_path() {
        let p = Promise::<(), String>::new();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        p.catch(move |e| {
            assert_eq!(e, "boom");
            flag.store(true, Ordering::Relaxed);
        });
        p.reject("boom".to_string());
        assert!(called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_await_resolved() {
        let p = Promise::<i32, String>::new();
        let p2 = p.clone();
        tokio::spawn(async move {
            p2.resolve(99);
        });
        assert_eq!(p.await, Ok(99));
    }

    #[tokio::test]
    async fn test_await_rejected() {
        let p = Promise::<i32, String>::rejected("no".to_string());
        assert_eq!(p.await, Err("no".to_string()));
    }
}
