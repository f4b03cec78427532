//! Minimal in-process streaming for byte, text, and object payloads.
//!
//! A [`Stream`] accepts writes from a producer, buffers them while nobody
//! is consuming, and emits them in FIFO order to listeners, piped
//! destinations, and iterators the moment a consumer appears. Consumers
//! exert backpressure by pausing the stream or by returning `false` from a
//! pipe destination's write; producers observe it through the return value
//! of [`Stream::write`]. Completion runs through a fixed endish sequence
//! (`end`, `prefinish`, `finish`, and `close` when requested), and
//! teardown through `destroy` or an external [`AbortSignal`].
//!
//! # Modules
//!
//! - `stream` - the core state machine and public surface
//! - `chunk` - the byte/text/object payload model
//! - `decoder` - incremental text decoding across chunk boundaries
//! - `events` - the listener registry
//! - `pipe` - downstream bindings and the writable-collaborator contract
//! - `promise` - awaitable completion values for `collect`/`concat`
//! - `signal` - abort controller/signal pair
//! - `iter` - sync and async iteration
//!
//! # Example
//!
//! ```
//! use rill::Stream;
//!
//! let stream = Stream::new();
//! stream.write(&b"hello"[..]).unwrap();
//! stream.end_with(&b" world"[..]).unwrap();
//!
//! let chunks: Vec<_> = stream.iter().collect();
//! assert_eq!(chunks[0].as_bytes().unwrap().as_ref(), b"hello world");
//! ```

mod buffer;
pub mod chunk;
pub mod decoder;
mod defer;
pub mod error;
pub mod events;
pub mod iter;
pub mod pipe;
pub mod promise;
pub mod signal;
pub mod stream;

pub use chunk::{Chunk, Mode};
pub use decoder::{IncrementalDecoder, TextEncoding};
pub use error::StreamError;
pub use events::{Event, EventKind};
pub use iter::{AsyncIter, Iter};
pub use pipe::{PipeOptions, PipeTarget, StdioSink};
pub use promise::{Collected, Promise, PromiseState};
pub use signal::{AbortController, AbortSignal};
pub use stream::{Stream, StreamBuilder, WriteCallback};
