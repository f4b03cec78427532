//! Named-channel listener registry.
//!
//! The registry only stores and hands out listeners; every behavioral
//! override (replay of past events, resume-on-data, listener clearing) lives
//! in the stream itself. Dispatch snapshots the handler list first so
//! handlers can register and remove listeners while an emission is in
//! flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::error::StreamError;

/// Unique listener ID for tracking callbacks.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst)
}

/// The event channels a stream emits on.
///
/// `AnyError` and `Destroyed` are internal lifecycle channels: `AnyError`
/// fires for every error even when the public `Error` event is suppressed,
/// and `Destroyed` marks teardown without a cause. They survive a blanket
/// `remove_all_listeners(None)`, which is what keeps a running iterator
/// terminating correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Data,
    Error,
    Abort,
    Drain,
    Resume,
    End,
    Prefinish,
    Finish,
    Close,
    AnyError,
    Destroyed,
}

impl EventKind {
    pub(crate) fn is_internal(self) -> bool {
        matches!(self, EventKind::AnyError | EventKind::Destroyed)
    }
}

/// An event together with its payload.
#[derive(Debug, Clone)]
pub enum Event {
    Readable,
    Data(Chunk),
    Error(Arc<StreamError>),
    Abort(Arc<StreamError>),
    Drain,
    Resume,
    End,
    Prefinish,
    Finish,
    Close,
    AnyError(Arc<StreamError>),
    Destroyed,
}

impl Event {
    /// The channel this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Readable => EventKind::Readable,
            Event::Data(_) => EventKind::Data,
            Event::Error(_) => EventKind::Error,
            Event::Abort(_) => EventKind::Abort,
            Event::Drain => EventKind::Drain,
            Event::Resume => EventKind::Resume,
            Event::End => EventKind::End,
            Event::Prefinish => EventKind::Prefinish,
            Event::Finish => EventKind::Finish,
            Event::Close => EventKind::Close,
            Event::AnyError(_) => EventKind::AnyError,
            Event::Destroyed => EventKind::Destroyed,
        }
    }
}

/// A registered callback, shared so dispatch can run it after the registry
/// lock is released.
pub(crate) type Handler = Arc<Mutex<Box<dyn FnMut(&Event) + Send>>>;

struct Registration {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Listener table keyed by event kind.
#[derive(Default)]
pub(crate) struct Registry {
    channels: HashMap<EventKind, Vec<Registration>>,
}

impl Registry {
    /// Add a listener and return its ID.
    pub fn add(&mut self, kind: EventKind, once: bool, handler: Handler) -> u64 {
        let id = next_listener_id();
        self.channels
            .entry(kind)
            .or_default()
            .push(Registration { id, once, handler });
        id
    }

    /// Remove a listener by ID. Returns true if it was found.
    pub fn remove(&mut self, kind: EventKind, id: u64) -> bool {
        if let Some(regs) = self.channels.get_mut(&kind)
            && let Some(pos) = regs.iter().position(|r| r.id == id)
        {
            regs.remove(pos);
            return true;
        }
        false
    }

    /// Remove every listener on a channel, or on all public channels when
    /// `kind` is `None`. Internal channels survive the blanket form.
    pub fn remove_all(&mut self, kind: Option<EventKind>) {
        match kind {
            Some(kind) => {
                self.channels.remove(&kind);
            }
            None => {
                self.channels.retain(|kind, _| kind.is_internal());
            }
        }
    }

    /// Number of listeners on a channel.
    pub fn count(&self, kind: EventKind) -> usize {
        self.channels.get(&kind).map(|r| r.len()).unwrap_or(0)
    }

    /// Copy the handler list for dispatch, unregistering one-shot entries.
    /// Listeners added after the snapshot do not see this emission.
    pub fn snapshot(&mut self, kind: EventKind) -> Vec<Handler> {
        let Some(regs) = self.channels.get_mut(&kind) else {
            return Vec::new();
        };
        let handlers: Vec<Handler> = regs.iter().map(|r| r.handler.clone()).collect();
        regs.retain(|r| !r.once);
        handlers
    }
}
