//! Cancellation signals for tearing streams down from the outside.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;

pub(crate) type AbortCallback = Box<dyn FnOnce(Arc<StreamError>) + Send>;

struct SignalInner {
    reason: Option<Arc<StreamError>>,
    callbacks: Vec<AbortCallback>,
}

/// A cancellation token handed to streams at construction.
///
/// Cloning shares the same underlying signal. The first abort wins; its
/// reason is latched and every subscriber fires exactly once.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Mutex<SignalInner>>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SignalInner {
                reason: None,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Whether the signal has been aborted.
    pub fn aborted(&self) -> bool {
        self.inner.lock().reason.is_some()
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<Arc<StreamError>> {
        self.inner.lock().reason.clone()
    }

    /// Subscribe to the abort. Fires immediately when already aborted.
    pub(crate) fn on_abort(&self, callback: AbortCallback) {
        let immediate = {
            let mut inner = self.inner.lock();
            match &inner.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    inner.callbacks.push(callback);
                    return;
                }
            }
        };
        if let Some(reason) = immediate {
            callback(reason);
        }
    }

    fn fire(&self, reason: StreamError) {
        let (reason, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.reason.is_some() {
                return;
            }
            let reason = Arc::new(reason);
            inner.reason = Some(reason.clone());
            (reason, std::mem::take(&mut inner.callbacks))
        };
        for callback in callbacks {
            callback(reason.clone());
        }
    }
}

/// Owner side of an [`AbortSignal`].
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    /// The signal to hand out.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort with the default reason.
    pub fn abort(&self) {
        self.signal.fire(StreamError::Aborted);
    }

    /// Abort with a specific reason.
    pub fn abort_with(&self, reason: StreamError) {
        self.signal.fire(reason);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
