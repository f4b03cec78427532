//! Downstream bindings: the writable-collaborator contract and the records
//! a stream keeps per attached destination.

use std::io::Write;
use std::sync::Arc;

use tracing::trace;

use crate::chunk::Chunk;
use crate::error::StreamError;

/// The contract a pipe destination must satisfy.
///
/// `write_chunk` returning `false` signals backpressure; the source pauses
/// and resumes when the destination fires its drain subscription. `fd`
/// identifies shared process streams (stdout is 1, stderr is 2) so sources
/// never end them.
pub trait PipeTarget: Send + Sync {
    /// Accept a chunk. Returns `false` when the destination wants the
    /// source to back off.
    fn write_chunk(&self, chunk: Chunk) -> bool;

    /// Signal end-of-input to the destination.
    fn end_input(&self);

    /// Subscribe to the destination's drain notifications. Returns a
    /// subscription ID for [`PipeTarget::off_drain`].
    fn on_drain(&self, callback: Box<dyn FnMut() + Send>) -> u64;

    /// Drop a drain subscription.
    fn off_drain(&self, id: u64);

    /// Receive an error forwarded from an error-proxying pipe.
    fn proxy_error(&self, error: Arc<StreamError>);

    /// File descriptor of the underlying sink, when it has one.
    fn fd(&self) -> Option<i32> {
        None
    }
}

/// Per-destination state held by the source stream.
pub(crate) struct PipeRecord {
    pub dest: Arc<dyn PipeTarget>,
    /// End the destination when the source ends.
    pub end_on_end: bool,
    /// Drain subscription on the destination.
    pub drain_id: u64,
    /// ID of the source error listener forwarding to the destination, for
    /// the error-proxying variant.
    pub proxy_id: Option<u64>,
}

impl PipeRecord {
    pub fn matches(&self, target: *const ()) -> bool {
        Arc::as_ptr(&self.dest) as *const () == target
    }

    /// Detach the drain subscription from the destination. The proxy error
    /// listener lives in the source registry and is removed by the caller.
    pub fn detach(&self) {
        self.dest.off_drain(self.drain_id);
    }
}

/// Options controlling a pipe attachment.
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// End the destination when the source ends. Forced off for process
    /// stdout/stderr destinations.
    pub end: bool,
    /// Re-emit source errors on the destination.
    pub proxy_errors: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            end: true,
            proxy_errors: false,
        }
    }
}

/// Adapter piping a stream into the process's stdout or stderr.
///
/// Shared process streams are never ended and exert no backpressure.
pub struct StdioSink {
    fd: i32,
}

impl StdioSink {
    pub fn stdout() -> Arc<Self> {
        Arc::new(Self { fd: 1 })
    }

    pub fn stderr() -> Arc<Self> {
        Arc::new(Self { fd: 2 })
    }

    fn write_all(&self, data: &[u8]) {
        let result = if self.fd == 1 {
            std::io::stdout().write_all(data)
        } else {
            std::io::stderr().write_all(data)
        };
        if let Err(error) = result {
            trace!(fd = self.fd, %error, "stdio write failed");
        }
    }
}

impl PipeTarget for StdioSink {
    fn write_chunk(&self, chunk: Chunk) -> bool {
        match chunk {
            Chunk::Bytes(b) => self.write_all(&b),
            Chunk::Text(s) => self.write_all(s.as_bytes()),
            Chunk::Object(v) => {
                self.write_all(v.to_string().as_bytes());
                self.write_all(b"\n");
            }
        }
        true
    }

    fn end_input(&self) {
        let result = if self.fd == 1 {
            std::io::stdout().flush()
        } else {
            std::io::stderr().flush()
        };
        if let Err(error) = result {
            trace!(fd = self.fd, %error, "stdio flush failed");
        }
    }

    fn on_drain(&self, _callback: Box<dyn FnMut() + Send>) -> u64 {
        0
    }

    fn off_drain(&self, _id: u64) {}

    fn proxy_error(&self, error: Arc<StreamError>) {
        trace!(fd = self.fd, %error, "error proxied to stdio sink");
    }

    fn fd(&self) -> Option<i32> {
        Some(self.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = PipeOptions::default();
        assert!(opts.end);
        assert!(!opts.proxy_errors);
    }

    #[test]
    fn test_stdio_fds() {
        assert_eq!(StdioSink::stdout().fd(), Some(1));
        assert_eq!(StdioSink::stderr().fd(), Some(2));
    }

    #[test]
    fn test_record_matching() {
        let sink = StdioSink::stdout();
        let dest: Arc<dyn PipeTarget> = sink.clone();
        let record = PipeRecord {
            dest,
            end_on_end: false,
            drain_id: 0,
            proxy_id: None,
        };
        assert!(record.matches(Arc::as_ptr(&sink) as *const ()));
        let other = StdioSink::stderr();
        assert!(!record.matches(Arc::as_ptr(&other) as *const ()));
    }
}
