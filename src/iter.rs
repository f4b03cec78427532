//! Consuming a stream as a synchronous or asynchronous iterator.
//!
//! Both iterators pull through `read`, so they ride the same buffer and
//! endish machinery as every other consumer. The async form waits for the
//! next emission by racing one-shot subscriptions into a promise, pausing
//! the stream again after each delivered chunk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::events::{Event, EventKind};
use crate::promise::Promise;
use crate::stream::Stream;

impl Stream {
    /// Iterate synchronously over buffered chunks. The iterator stops (and
    /// pauses the stream) at the first empty read, on end, on error, and
    /// on destroy.
    pub fn iter(&self) -> Iter {
        self.clear_discarded();
        let stopped = Arc::new(AtomicBool::new(false));
        let mut subs = Vec::with_capacity(3);
        for kind in [EventKind::End, EventKind::AnyError, EventKind::Destroyed] {
            let stopped = stopped.clone();
            let id = self.once(kind, move |_| {
                stopped.store(true, Ordering::SeqCst);
            });
            subs.push((kind, id));
        }
        Iter {
            stream: self.clone(),
            stopped,
            subs,
            done: false,
        }
    }

    /// Iterate asynchronously, waiting for data when the buffer runs dry.
    pub fn async_iter(&self) -> AsyncIter {
        self.clear_discarded();
        AsyncIter {
            stream: self.clone(),
            done: false,
        }
    }
}

/// Synchronous iterator over a stream. See [`Stream::iter`].
pub struct Iter {
    stream: Stream,
    stopped: Arc<AtomicBool>,
    subs: Vec<(EventKind, u64)>,
    done: bool,
}

impl Iter {
    fn stop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.stream.pause();
        for (kind, id) in self.subs.drain(..) {
            self.stream.off(kind, id);
        }
    }
}

impl Iterator for Iter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        if self.stopped.load(Ordering::SeqCst) {
            self.stop();
            return None;
        }
        match self.stream.read(None) {
            Some(chunk) => Some(chunk),
            None => {
                self.stop();
                None
            }
        }
    }
}

impl Drop for Iter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Asynchronous iterator over a stream. See [`Stream::async_iter`].
pub struct AsyncIter {
    stream: Stream,
    done: bool,
}

impl AsyncIter {
    /// The next chunk, `Ok(None)` at end of stream, or the failure that
    /// tore the stream down.
    pub async fn next(&mut self) -> Result<Option<Chunk>, Arc<StreamError>> {
        if self.done {
            return Ok(None);
        }
        if let Some(chunk) = self.stream.read(None) {
            return Ok(Some(chunk));
        }
        if self.stream.eof_seen() {
            self.done = true;
            self.stream.pause();
            return Ok(None);
        }

        let promise: Promise<Option<Chunk>, Arc<StreamError>> = Promise::new();
        let subs: Arc<Mutex<Vec<(EventKind, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let cleanup: Arc<dyn Fn() + Send + Sync> = {
            let stream = self.stream.clone();
            let subs = subs.clone();
            Arc::new(move || {
                for (kind, id) in subs.lock().drain(..) {
                    stream.off(kind, id);
                }
            })
        };

        // The data subscription goes last: registering it resumes the
        // stream, which can deliver synchronously.
        {
            let p = promise.clone();
            let cleanup = cleanup.clone();
            let id = self.stream.once(EventKind::Destroyed, move |_| {
                cleanup();
                p.reject(Arc::new(StreamError::Destroyed));
            });
            subs.lock().push((EventKind::Destroyed, id));
        }
        {
            let p = promise.clone();
            let cleanup = cleanup.clone();
            let id = self.stream.once(EventKind::Error, move |ev| {
                if let Event::Error(error) = ev {
                    cleanup();
                    p.reject(error.clone());
                }
            });
            subs.lock().push((EventKind::Error, id));
        }
        {
            let p = promise.clone();
            let cleanup = cleanup.clone();
            let id = self.stream.once(EventKind::End, move |_| {
                cleanup();
                p.resolve(None);
            });
            subs.lock().push((EventKind::End, id));
        }
        {
            let p = promise.clone();
            let cleanup = cleanup.clone();
            let stream = self.stream.clone();
            let id = self.stream.once(EventKind::Data, move |ev| {
                if let Event::Data(chunk) = ev {
                    cleanup();
                    stream.pause();
                    p.resolve(Some(chunk.clone()));
                }
            });
            subs.lock().push((EventKind::Data, id));
        }

        match promise.await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    /// Stop iterating and pause the stream.
    pub fn stop(&mut self) {
        if !self.done {
            self.done = true;
            self.stream.pause();
        }
    }
}

impl Drop for AsyncIter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_iter_coalesces_buffered_bytes() {
        let stream = Stream::new();
        stream.write(&b"ab"[..]).unwrap();
        stream.write(&b"cd"[..]).unwrap();
        stream.end().unwrap();

        let chunks: Vec<Chunk> = stream.iter().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_bytes().unwrap().as_ref(), b"abcd");
        assert!(stream.emitted_end());
    }

    #[test]
    fn test_sync_iter_object_mode_yields_each_item() {
        let stream = Stream::builder().object_mode().build().unwrap();
        for i in 1..=3 {
            stream.write(json!(i)).unwrap();
        }
        stream.end().unwrap();

        let items: Vec<_> = stream
            .iter()
            .map(|c| c.as_object().unwrap().clone())
            .collect();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_sync_iter_stops_at_empty_read_before_eof() {
        let stream = Stream::new();
        stream.write(&b"only"[..]).unwrap();

        let mut iter = stream.iter();
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        // The iterator paused the stream when it stopped.
        assert!(stream.paused());

        // The producer can keep writing; a new iterator picks it up.
        stream.write(&b"more"[..]).unwrap();
        let chunks: Vec<Chunk> = stream.iter().collect();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_remove_all_listeners_spares_running_iterator() {
        let stream = Stream::builder().object_mode().build().unwrap();
        stream.write(json!("a")).unwrap();
        stream.write(json!("b")).unwrap();
        stream.end().unwrap();

        let mut iter = stream.iter();
        assert_eq!(iter.next().unwrap().as_object().unwrap(), &json!("a"));

        // A blanket removal clears public channels but the iterator keeps
        // draining and terminating through the internal ones.
        stream.remove_all_listeners(None);
        assert_eq!(iter.next().unwrap().as_object().unwrap(), &json!("b"));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_sync_iter_stops_on_destroy() {
        let stream = Stream::builder().object_mode().build().unwrap();
        stream.write(json!(1)).unwrap();
        stream.write(json!(2)).unwrap();

        let mut iter = stream.iter();
        assert!(iter.next().is_some());
        stream.destroy();
        assert!(iter.next().is_none());
    }
}
