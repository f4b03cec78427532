//! The stream core: write side, buffered/flowing consumption, the endish
//! lifecycle, pipes, and teardown.
//!
//! A [`Stream`] is a cheaply cloneable handle over shared state. Producers
//! call [`Stream::write`] and [`Stream::end`]; consumers attach `data`
//! listeners, pipe into a [`PipeTarget`], iterate, or collect. Data written
//! while nobody is consuming accumulates in an internal buffer and drains
//! in FIFO order the moment a consumer appears.
//!
//! The state machine is single-threaded cooperative: handles are `Send` and
//! `Sync`, but callers are expected to drive a stream from one owner at a
//! time (wrap it in an actor or channel-serialized task otherwise). No lock
//! is ever held while a user callback runs, so handlers may freely call
//! back into the stream (`pause`, `resume`, `write`, `end`, `destroy`).

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::ChunkQueue;
use crate::chunk::{Chunk, Mode};
use crate::decoder::{IncrementalDecoder, TextEncoding};
use crate::defer::DeferQueue;
use crate::error::StreamError;
use crate::events::{Event, EventKind, Handler, Registry};
use crate::pipe::{PipeOptions, PipeRecord, PipeTarget};
use crate::promise::{Collected, Promise};
use crate::signal::AbortSignal;

/// Callback invoked when a written chunk has been accepted, synchronously
/// or on the next turn depending on the stream's mode.
pub type WriteCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    mode: Mode,
    asynchronous: bool,
    decoder: Option<IncrementalDecoder>,
    buffer: ChunkQueue,
    flowing: bool,
    paused: bool,
    discarded: bool,
    eof: bool,
    emitting_end: bool,
    emitted_end: bool,
    emitted_error: Option<Arc<StreamError>>,
    closed: bool,
    destroyed: bool,
    aborted: bool,
    writable: bool,
    readable: bool,
    data_listeners: usize,
    pipes: Vec<PipeRecord>,
    registry: Registry,
    has_signal: bool,
    close_hook: Option<Box<dyn FnOnce() + Send>>,
}

/// Configures and builds a [`Stream`].
#[derive(Default)]
pub struct StreamBuilder {
    encoding: Option<TextEncoding>,
    object_mode: bool,
    asynchronous: bool,
    signal: Option<AbortSignal>,
    close_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamBuilder {
    /// Text mode, decoding written bytes in `encoding`. Mutually exclusive
    /// with [`StreamBuilder::object_mode`].
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Object mode: chunks pass through untouched and sizes count items.
    pub fn object_mode(mut self) -> Self {
        self.object_mode = true;
        self
    }

    /// Defer data and end emission to the next turn of the deferral queue
    /// (drained by [`Stream::tick`]) instead of emitting inside `write`.
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Abort the stream when `signal` fires. A signal that has already
    /// fired aborts the stream immediately.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Hook invoked by `destroy` to release external resources, unless a
    /// `close` was already requested.
    pub fn close_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.close_hook = Some(Box::new(hook));
        self
    }

    /// Build the stream.
    pub fn build(self) -> Result<Stream, StreamError> {
        if self.encoding.is_some() && self.object_mode {
            return Err(StreamError::EncodingConflict);
        }
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> Stream {
        let mode = if self.object_mode {
            Mode::Object
        } else {
            match self.encoding {
                Some(encoding) => Mode::Text(encoding),
                None => Mode::Bytes,
            }
        };
        let stream = Stream {
            inner: Arc::new(Mutex::new(Inner {
                mode,
                asynchronous: self.asynchronous,
                decoder: mode.encoding().map(IncrementalDecoder::new),
                buffer: ChunkQueue::new(mode.is_object()),
                flowing: false,
                paused: false,
                discarded: false,
                eof: false,
                emitting_end: false,
                emitted_end: false,
                emitted_error: None,
                closed: false,
                destroyed: false,
                aborted: false,
                writable: true,
                readable: true,
                data_listeners: 0,
                pipes: Vec::new(),
                registry: Registry::default(),
                has_signal: self.signal.is_some(),
                close_hook: self.close_hook,
            })),
            defer: Arc::new(DeferQueue::new()),
        };
        if let Some(signal) = self.signal {
            let stream2 = stream.clone();
            signal.on_abort(Box::new(move |reason| stream2.trigger_abort(reason)));
        }
        stream
    }
}

/// An in-process producer-to-consumer stream of byte, text, or object
/// chunks. See the module docs for the overall model.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<Mutex<Inner>>,
    defer: Arc<DeferQueue>,
}

impl Stream {
    /// A synchronous byte-mode stream.
    pub fn new() -> Self {
        StreamBuilder::default().build_unchecked()
    }

    /// Start configuring a stream.
    pub fn builder() -> StreamBuilder {
        StreamBuilder::default()
    }

    // ---- flags ----

    /// Whether the producer may still call `write`.
    pub fn writable(&self) -> bool {
        self.inner.lock().writable
    }

    /// Whether data events may still fire.
    pub fn readable(&self) -> bool {
        self.inner.lock().readable
    }

    pub fn destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    pub fn aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Whether the `end` event has fired.
    pub fn emitted_end(&self) -> bool {
        self.inner.lock().emitted_end
    }

    pub fn flowing(&self) -> bool {
        self.inner.lock().flowing
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Aggregate size of the buffered chunks.
    pub fn buffer_length(&self) -> usize {
        self.inner.lock().buffer.size()
    }

    pub fn object_mode(&self) -> bool {
        self.inner.lock().mode.is_object()
    }

    /// The text encoding, when in text mode.
    pub fn encoding(&self) -> Option<TextEncoding> {
        self.inner.lock().mode.encoding()
    }

    pub fn asynchronous(&self) -> bool {
        self.inner.lock().asynchronous
    }

    pub(crate) fn eof_seen(&self) -> bool {
        self.inner.lock().eof
    }

    pub(crate) fn clear_discarded(&self) {
        self.inner.lock().discarded = false;
    }

    // ---- write side ----

    /// Write a chunk, returning the current flowing state. A `false` return
    /// asks the producer to back off until `drain`.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        self.write_with(chunk, None, None)
    }

    /// Write with an explicit claimed encoding for text chunks (defaults to
    /// UTF-8) and an optional completion callback.
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        encoding: Option<TextEncoding>,
        cb: Option<WriteCallback>,
    ) -> Result<bool, StreamError> {
        let mut chunk = chunk.into();
        {
            let inner = self.inner.lock();
            if inner.aborted {
                return Ok(false);
            }
            if inner.eof {
                return Err(StreamError::WriteAfterEnd);
            }
            if inner.destroyed {
                drop(inner);
                self.emit(Event::Error(Arc::new(StreamError::WriteAfterDestroy)));
                return Ok(true);
            }
        }
        let encoding = encoding.unwrap_or(TextEncoding::Utf8);

        let object_mode = self.inner.lock().mode.is_object();
        if object_mode {
            self.flush_if_flowing_nonempty();
            let flowing = self.inner.lock().flowing;
            if flowing {
                self.emit(Event::Data(chunk));
            } else {
                self.inner.lock().buffer.push(chunk);
            }
            return Ok(self.after_write(cb));
        }

        if matches!(chunk, Chunk::Object(_)) {
            return Err(StreamError::NonContiguousWrite);
        }

        // Zero-length chunks never enter the pipeline.
        if chunk.is_empty() {
            return Ok(self.after_write(cb));
        }

        {
            let mut inner = self.inner.lock();
            chunk = match chunk {
                Chunk::Text(s) => {
                    let matches_encoding = inner.mode.encoding() == Some(encoding);
                    let pending = inner.decoder.as_ref().is_some_and(|d| d.pending());
                    if matches_encoding && !pending {
                        // Fast path: same encoding, no partial bytes held.
                        Chunk::Text(s)
                    } else {
                        let bytes = encoding.encode(&s);
                        match inner.decoder.as_mut() {
                            Some(decoder) => Chunk::Text(decoder.write(&bytes)),
                            None => Chunk::Bytes(bytes),
                        }
                    }
                }
                Chunk::Bytes(b) => match inner.decoder.as_mut() {
                    Some(decoder) => Chunk::Text(decoder.write(&b)),
                    None => Chunk::Bytes(b),
                },
                other => other,
            };
        }

        self.flush_if_flowing_nonempty();
        let flowing = self.inner.lock().flowing;
        if flowing {
            self.emit(Event::Data(chunk));
        } else {
            self.inner.lock().buffer.push(chunk);
        }
        Ok(self.after_write(cb))
    }

    /// Shared write tail: `readable`, the callback, and the return value.
    fn after_write(&self, cb: Option<WriteCallback>) -> bool {
        let (nonempty, asynchronous) = {
            let inner = self.inner.lock();
            (!inner.buffer.is_empty(), inner.asynchronous)
        };
        if nonempty {
            self.emit(Event::Readable);
        }
        if let Some(cb) = cb {
            if asynchronous {
                self.defer.enqueue(cb);
            } else {
                cb();
            }
        }
        self.inner.lock().flowing
    }

    /// Signal end of input. Further writes fail.
    pub fn end(&self) -> Result<(), StreamError> {
        self.end_full(None, None, None)
    }

    /// Write a final chunk, then end.
    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        self.end_full(Some(chunk.into()), None, None)
    }

    /// End with an optional final chunk, claimed encoding, and a callback
    /// registered as a one-shot `end` listener.
    pub fn end_full(
        &self,
        chunk: Option<Chunk>,
        encoding: Option<TextEncoding>,
        cb: Option<WriteCallback>,
    ) -> Result<(), StreamError> {
        if let Some(chunk) = chunk {
            self.write_with(chunk, encoding, None)?;
        }
        if let Some(cb) = cb {
            let mut cb = Some(cb);
            self.once(EventKind::End, move |_| {
                if let Some(cb) = cb.take() {
                    cb();
                }
            });
        }
        let check = {
            let mut inner = self.inner.lock();
            inner.eof = true;
            inner.writable = false;
            inner.flowing || !inner.paused
        };
        if check {
            self.maybe_emit_end();
        }
        Ok(())
    }

    // ---- read side ----

    /// Pull a chunk from the buffer: the whole head item, or a prefix of
    /// `n` when given. Returns `None` when nothing can be served.
    pub fn read(&self, n: Option<usize>) -> Option<Chunk> {
        let taken = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return None;
            }
            inner.discarded = false;
            let size = inner.buffer.size();
            if size == 0 || n == Some(0) || n.is_some_and(|n| n > size) {
                None
            } else {
                let n = if inner.mode.is_object() { None } else { n };
                if inner.buffer.item_count() > 1 && !inner.mode.is_object() {
                    inner.buffer.coalesce();
                }
                inner.buffer.take(n)
            }
        };
        let Some(chunk) = taken else {
            self.maybe_emit_end();
            return None;
        };
        self.emit(Event::Data(chunk.clone()));
        let drained = {
            let inner = self.inner.lock();
            inner.buffer.is_empty() && !inner.eof
        };
        if drained {
            self.emit(Event::Drain);
        }
        self.maybe_emit_end();
        Some(chunk)
    }

    // ---- consumption mode ----

    /// Stop auto-emission; data accumulates until a consumer pulls or
    /// resumes.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        inner.flowing = false;
        inner.paused = true;
        inner.discarded = false;
    }

    /// Start (or restart) flowing. Resuming with no consumers attached
    /// discards emitted data until one appears.
    pub fn resume(&self) {
        self.resume_flow();
    }

    pub(crate) fn resume_flow(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            if inner.data_listeners == 0 && inner.pipes.is_empty() {
                inner.discarded = true;
            }
            inner.paused = false;
            inner.flowing = true;
        }
        self.emit(Event::Resume);
        enum After {
            Flush,
            End,
            Drain,
        }
        let after = {
            let inner = self.inner.lock();
            if !inner.buffer.is_empty() {
                After::Flush
            } else if inner.eof {
                After::End
            } else {
                After::Drain
            }
        };
        match after {
            After::Flush => self.flush(false),
            After::End => self.maybe_emit_end(),
            After::Drain => {
                self.emit(Event::Drain);
            }
        }
    }

    fn flush_if_flowing_nonempty(&self) {
        let go = {
            let inner = self.inner.lock();
            inner.flowing && !inner.buffer.is_empty()
        };
        if go {
            self.flush(true);
        }
    }

    /// Emit buffered chunks in order while the stream keeps flowing.
    fn flush(&self, no_drain: bool) {
        loop {
            let chunk = self.inner.lock().buffer.shift();
            let Some(chunk) = chunk else { break };
            self.emit(Event::Data(chunk));
            if !self.inner.lock().flowing {
                break;
            }
        }
        let emit_drain = {
            let inner = self.inner.lock();
            !no_drain && inner.buffer.is_empty() && !inner.eof
        };
        if emit_drain {
            self.emit(Event::Drain);
        }
    }

    // ---- emission ----

    fn dispatch(&self, kind: EventKind, ev: &Event) -> bool {
        let handlers = self.inner.lock().registry.snapshot(kind);
        let had_listeners = !handlers.is_empty();
        for handler in handlers {
            let mut f = handler.lock();
            (*f)(ev);
        }
        had_listeners
    }

    /// Emit an event through the stream's override rules. Returns whether
    /// any listener received it.
    pub fn emit(&self, ev: Event) -> bool {
        let kind = ev.kind();
        {
            let inner = self.inner.lock();
            if inner.destroyed
                && !matches!(
                    kind,
                    EventKind::Error | EventKind::Close | EventKind::Destroyed
                )
            {
                return false;
            }
        }
        match ev {
            Event::Data(chunk) => {
                let (object_mode, asynchronous) = {
                    let inner = self.inner.lock();
                    (inner.mode.is_object(), inner.asynchronous)
                };
                if !object_mode && chunk.is_empty() {
                    return false;
                }
                if asynchronous {
                    let stream = self.clone();
                    self.defer.enqueue(move || {
                        stream.emit_data(chunk);
                    });
                    true
                } else {
                    self.emit_data(chunk)
                }
            }
            Event::End => self.emit_end(),
            Event::Close => {
                let ready = {
                    let mut inner = self.inner.lock();
                    inner.closed = true;
                    inner.emitted_end || inner.destroyed
                };
                if !ready {
                    return false;
                }
                let ret = self.dispatch(EventKind::Close, &Event::Close);
                self.inner.lock().registry.remove_all(Some(EventKind::Close));
                ret
            }
            Event::Error(error) => self.emit_error(error),
            Event::Resume => {
                let ret = self.dispatch(EventKind::Resume, &Event::Resume);
                self.maybe_emit_end();
                ret
            }
            Event::Finish => {
                let ret = self.dispatch(EventKind::Finish, &Event::Finish);
                self.inner.lock().registry.remove_all(Some(EventKind::Finish));
                ret
            }
            Event::Prefinish => {
                let ret = self.dispatch(EventKind::Prefinish, &Event::Prefinish);
                self.inner
                    .lock()
                    .registry
                    .remove_all(Some(EventKind::Prefinish));
                ret
            }
            other => {
                let kind = other.kind();
                let ret = self.dispatch(kind, &other);
                self.maybe_emit_end();
                ret
            }
        }
    }

    /// Forward a chunk to every pipe (pausing on backpressure), then to
    /// data listeners unless the stream is discarding.
    fn emit_data(&self, chunk: Chunk) -> bool {
        let dests: Vec<Arc<dyn PipeTarget>> = {
            let inner = self.inner.lock();
            inner.pipes.iter().map(|p| p.dest.clone()).collect()
        };
        for dest in &dests {
            if !dest.write_chunk(chunk.clone()) {
                self.pause();
            }
        }
        let discarded = self.inner.lock().discarded;
        let ret = if discarded {
            false
        } else {
            let ev = Event::Data(chunk);
            self.dispatch(EventKind::Data, &ev)
        };
        self.maybe_emit_end();
        ret
    }

    fn emit_error(&self, error: Arc<StreamError>) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.emitted_error = Some(error.clone());
        }
        self.dispatch(EventKind::AnyError, &Event::AnyError(error.clone()));
        let suppress = {
            let inner = self.inner.lock();
            inner.has_signal && inner.registry.count(EventKind::Error) == 0
        };
        let ret = if suppress {
            trace!(%error, "error absorbed: signal present and nobody listening");
            false
        } else {
            self.dispatch(EventKind::Error, &Event::Error(error))
        };
        self.maybe_emit_end();
        ret
    }

    fn emit_end(&self) -> bool {
        let asynchronous = {
            let mut inner = self.inner.lock();
            if inner.emitted_end {
                return false;
            }
            inner.emitted_end = true;
            inner.readable = false;
            inner.asynchronous
        };
        if asynchronous {
            let stream = self.clone();
            self.defer.enqueue(move || {
                stream.emit_end_tail();
            });
            true
        } else {
            self.emit_end_tail()
        }
    }

    /// The tail of end emission: decoder flush, pipe closing, the `end`
    /// dispatch, and listener clearing.
    fn emit_end_tail(&self) -> bool {
        let tail = {
            let mut inner = self.inner.lock();
            inner.decoder.as_mut().map(|d| d.end())
        };
        if let Some(tail) = tail
            && !tail.is_empty()
        {
            let chunk = Chunk::Text(tail);
            let (dests, discarded) = {
                let inner = self.inner.lock();
                let dests: Vec<Arc<dyn PipeTarget>> =
                    inner.pipes.iter().map(|p| p.dest.clone()).collect();
                (dests, inner.discarded)
            };
            for dest in &dests {
                dest.write_chunk(chunk.clone());
            }
            if !discarded {
                let ev = Event::Data(chunk);
                self.dispatch(EventKind::Data, &ev);
            }
        }
        let records: Vec<PipeRecord> = {
            let mut inner = self.inner.lock();
            inner.pipes.drain(..).collect()
        };
        for record in records {
            record.detach();
            if let Some(proxy_id) = record.proxy_id {
                self.inner.lock().registry.remove(EventKind::Error, proxy_id);
            }
            if record.end_on_end {
                record.dest.end_input();
            }
        }
        let ret = self.dispatch(EventKind::End, &Event::End);
        self.inner.lock().registry.remove_all(Some(EventKind::End));
        ret
    }

    /// The endish check: fire the closing sequence once the buffer is dry
    /// after EOF. `emitting_end` keeps re-entrant calls out.
    fn maybe_emit_end(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.emitting_end
                || inner.emitted_end
                || inner.destroyed
                || !inner.buffer.is_empty()
                || !inner.eof
            {
                return;
            }
            inner.emitting_end = true;
        }
        self.emit(Event::End);
        self.emit(Event::Prefinish);
        self.emit(Event::Finish);
        let closed = self.inner.lock().closed;
        if closed {
            self.emit(Event::Close);
        }
        self.inner.lock().emitting_end = false;
    }

    // ---- listeners ----

    /// Subscribe to an event channel. Returns a listener ID for
    /// [`Stream::off`].
    pub fn on<F>(&self, kind: EventKind, handler: F) -> u64
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.add_listener(kind, false, Box::new(handler))
    }

    /// Subscribe for a single emission.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> u64
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.add_listener(kind, true, Box::new(handler))
    }

    fn add_listener(
        &self,
        kind: EventKind,
        once: bool,
        handler: Box<dyn FnMut(&Event) + Send>,
    ) -> u64 {
        let handler: Handler = Arc::new(Mutex::new(handler));
        let id = self
            .inner
            .lock()
            .registry
            .add(kind, once, handler.clone());
        match kind {
            EventKind::Data => {
                let need_resume = {
                    let mut inner = self.inner.lock();
                    inner.discarded = false;
                    inner.data_listeners = inner.registry.count(EventKind::Data);
                    inner.pipes.is_empty() && !inner.flowing
                };
                if need_resume {
                    self.resume_flow();
                }
            }
            EventKind::Readable => {
                let nonempty = self.inner.lock().buffer.size() != 0;
                if nonempty {
                    self.dispatch(EventKind::Readable, &Event::Readable);
                }
            }
            EventKind::End | EventKind::Finish | EventKind::Prefinish => {
                let emitted = self.inner.lock().emitted_end;
                if emitted {
                    let ev = match kind {
                        EventKind::End => Event::End,
                        EventKind::Finish => Event::Finish,
                        _ => Event::Prefinish,
                    };
                    self.dispatch(kind, &ev);
                    self.inner.lock().registry.remove_all(Some(kind));
                }
            }
            EventKind::Error => {
                let (latched, asynchronous) = {
                    let inner = self.inner.lock();
                    (inner.emitted_error.clone(), inner.asynchronous)
                };
                if let Some(error) = latched {
                    if asynchronous {
                        let handler = handler.clone();
                        self.defer.enqueue(move || {
                            let ev = Event::Error(error);
                            let mut f = handler.lock();
                            (*f)(&ev);
                        });
                    } else {
                        let ev = Event::Error(error);
                        let mut f = handler.lock();
                        (*f)(&ev);
                    }
                }
            }
            _ => {}
        }
        id
    }

    /// Remove a listener by ID.
    pub fn off(&self, kind: EventKind, id: u64) -> bool {
        let removed = self.inner.lock().registry.remove(kind, id);
        if kind == EventKind::Data {
            let mut inner = self.inner.lock();
            inner.data_listeners = inner.registry.count(EventKind::Data);
            if inner.data_listeners == 0 && !inner.discarded && inner.pipes.is_empty() {
                inner.flowing = false;
            }
        }
        removed
    }

    /// Remove every listener on one channel, or on all public channels.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        self.inner.lock().registry.remove_all(kind);
        if kind.is_none() || kind == Some(EventKind::Data) {
            let mut inner = self.inner.lock();
            inner.data_listeners = 0;
            if !inner.discarded && inner.pipes.is_empty() {
                inner.flowing = false;
            }
        }
    }

    /// Number of listeners on a channel.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.lock().registry.count(kind)
    }

    // ---- pipes ----

    /// Attach a downstream destination and start flowing into it. Returns
    /// the destination for chaining.
    pub fn pipe<T>(&self, dest: Arc<T>, opts: PipeOptions) -> Arc<T>
    where
        T: PipeTarget + 'static,
    {
        if self.inner.lock().destroyed {
            return dest;
        }
        self.inner.lock().discarded = false;
        let dyn_dest: Arc<dyn PipeTarget> = dest.clone();
        let mut end_on_end = opts.end;
        // Shared process streams are never closed by a source ending.
        if matches!(dyn_dest.fd(), Some(1) | Some(2)) {
            end_on_end = false;
        }
        let ended = self.inner.lock().emitted_end;
        if ended {
            if end_on_end {
                dyn_dest.end_input();
            }
            return dest;
        }
        trace!(proxy_errors = opts.proxy_errors, "pipe attached");
        let source = self.clone();
        let drain_id = dyn_dest.on_drain(Box::new(move || source.resume_flow()));
        let proxy_id = if opts.proxy_errors {
            let forward = dyn_dest.clone();
            Some(self.on(EventKind::Error, move |ev| {
                if let Event::Error(error) = ev {
                    forward.proxy_error(error.clone());
                }
            }))
        } else {
            None
        };
        {
            let mut inner = self.inner.lock();
            inner.pipes.push(PipeRecord {
                dest: dyn_dest,
                end_on_end,
                drain_id,
                proxy_id,
            });
        }
        let asynchronous = self.inner.lock().asynchronous;
        if asynchronous {
            let stream = self.clone();
            self.defer.enqueue(move || stream.resume_flow());
        } else {
            self.resume_flow();
        }
        dest
    }

    /// Detach a previously piped destination. Removing the sole pipe with
    /// no data listeners left implicitly pauses the stream.
    pub fn unpipe<T>(&self, dest: &Arc<T>)
    where
        T: PipeTarget + 'static,
    {
        let target = Arc::as_ptr(dest) as *const ();
        let record = {
            let mut inner = self.inner.lock();
            let position = inner.pipes.iter().position(|p| p.matches(target));
            match position {
                None => None,
                Some(index) => {
                    if inner.pipes.len() == 1 {
                        if inner.flowing && inner.data_listeners == 0 {
                            inner.flowing = false;
                        }
                        inner.pipes.pop()
                    } else {
                        Some(inner.pipes.remove(index))
                    }
                }
            }
        };
        if let Some(record) = record {
            trace!("pipe detached");
            record.detach();
            if let Some(proxy_id) = record.proxy_id {
                self.inner.lock().registry.remove(EventKind::Error, proxy_id);
            }
        }
    }

    // ---- teardown ----

    /// Tear the stream down: the buffer is dropped, the close hook runs,
    /// and the destroy marker (or `error`) is emitted.
    pub fn destroy(&self) {
        self.destroy_inner(None);
    }

    /// Tear down with a cause, emitted as an `error` event.
    pub fn destroy_with(&self, error: StreamError) {
        self.destroy_inner(Some(Arc::new(error)));
    }

    fn destroy_inner(&self, error: Option<Arc<StreamError>>) {
        let hook = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                drop(inner);
                match error {
                    Some(error) => {
                        self.emit(Event::Error(error));
                    }
                    None => {
                        self.emit(Event::Destroyed);
                    }
                }
                return;
            }
            inner.destroyed = true;
            inner.discarded = true;
            inner.buffer.clear();
            if !inner.closed {
                inner.close_hook.take()
            } else {
                None
            }
        };
        debug!("stream destroyed");
        if let Some(hook) = hook {
            hook();
        }
        match error {
            Some(error) => {
                self.emit(Event::Error(error));
            }
            None => {
                self.emit(Event::Destroyed);
            }
        }
    }

    fn trigger_abort(&self, reason: Arc<StreamError>) {
        self.inner.lock().aborted = true;
        debug!(%reason, "stream aborted");
        self.emit(Event::Abort(reason.clone()));
        self.destroy_inner(Some(reason));
    }

    // ---- aggregation ----

    /// Resolves when `end` fires; rejects on error or destroy.
    pub fn promise(&self) -> Promise<(), Arc<StreamError>> {
        let promise = Promise::new();
        {
            let p = promise.clone();
            self.on(EventKind::Destroyed, move |_| {
                p.reject(Arc::new(StreamError::Destroyed));
            });
        }
        {
            let p = promise.clone();
            self.on(EventKind::Error, move |ev| {
                if let Event::Error(error) = ev {
                    p.reject(error.clone());
                }
            });
        }
        {
            let p = promise.clone();
            self.on(EventKind::End, move |_| p.resolve(()));
        }
        promise
    }

    /// Consume the stream, resolving with every emitted chunk and the
    /// total payload size (zero in object mode) once it ends.
    pub fn collect(&self) -> Promise<Collected, Arc<StreamError>> {
        let object_mode = self.object_mode();
        let gathered = Arc::new(Mutex::new(Collected::default()));
        let done = self.promise();
        {
            let gathered = gathered.clone();
            self.on(EventKind::Data, move |ev| {
                if let Event::Data(chunk) = ev {
                    let mut acc = gathered.lock();
                    if !object_mode {
                        acc.data_length += match chunk {
                            Chunk::Bytes(b) => b.len(),
                            Chunk::Text(s) => s.len(),
                            Chunk::Object(_) => 0,
                        };
                    }
                    acc.items.push(chunk.clone());
                }
            });
        }
        let promise = Promise::new();
        {
            let p = promise.clone();
            done.then(move |_| {
                let collected = std::mem::take(&mut *gathered.lock());
                p.resolve(collected);
            });
        }
        {
            let p = promise.clone();
            done.catch(move |error| p.reject(error));
        }
        promise
    }

    /// Like [`Stream::collect`], but resolving with a single joined chunk.
    /// Refused in object mode.
    pub fn concat(&self) -> Result<Promise<Chunk, Arc<StreamError>>, StreamError> {
        let mode = self.inner.lock().mode;
        if mode.is_object() {
            return Err(StreamError::ConcatInObjectMode);
        }
        let promise = Promise::new();
        let collected = self.collect();
        {
            let p = promise.clone();
            collected.then(move |collected: Collected| {
                let joined = match mode {
                    Mode::Text(_) => {
                        let mut joined = String::with_capacity(collected.data_length);
                        for item in collected.items {
                            if let Chunk::Text(s) = item {
                                joined.push_str(&s);
                            }
                        }
                        Chunk::Text(joined)
                    }
                    _ => {
                        let mut joined = BytesMut::with_capacity(collected.data_length);
                        for item in collected.items {
                            if let Chunk::Bytes(b) = item {
                                joined.extend_from_slice(&b);
                            }
                        }
                        Chunk::Bytes(joined.freeze())
                    }
                };
                p.resolve(joined);
            });
        }
        {
            let p = promise.clone();
            collected.catch(move |error| p.reject(error));
        }
        Ok(promise)
    }

    /// Advance async-mode deferrals one turn: run everything queued, in
    /// FIFO order. A no-op in sync mode.
    pub fn tick(&self) {
        self.defer.drain();
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeTarget for Stream {
    fn write_chunk(&self, chunk: Chunk) -> bool {
        match self.write(chunk) {
            Ok(flowing) => flowing,
            Err(error) => {
                self.emit(Event::Error(Arc::new(error)));
                false
            }
        }
    }

    fn end_input(&self) {
        // `end` without a chunk cannot fail.
        let _ = self.end();
    }

    fn on_drain(&self, mut callback: Box<dyn FnMut() + Send>) -> u64 {
        self.on(EventKind::Drain, move |_| callback())
    }

    fn off_drain(&self, id: u64) {
        self.off(EventKind::Drain, id);
    }

    fn proxy_error(&self, error: Arc<StreamError>) {
        self.emit(Event::Error(error));
    }

    fn fd(&self) -> Option<i32> {
        None
    }
}
