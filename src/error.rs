//! Error type for stream operations.

use thiserror::Error;

/// Errors surfaced by stream operations, either as `Result` values for
/// usage mistakes or as `error` events for runtime failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A chunk was written after `end` was accepted.
    #[error("write after end")]
    WriteAfterEnd,

    /// A chunk was written after the stream was destroyed. Emitted as an
    /// `error` event rather than returned, and tagged with the
    /// `ERR_STREAM_DESTROYED` code.
    #[error("cannot call write after a stream was destroyed")]
    WriteAfterDestroy,

    /// The stream was torn down while a consumer was still waiting on it.
    #[error("stream destroyed")]
    Destroyed,

    /// A text encoding and object mode were both requested at construction.
    #[error("encoding and object mode may not be used together")]
    EncodingConflict,

    /// An object payload was written to a byte or text stream.
    #[error("non-contiguous data written to non-object mode stream")]
    NonContiguousWrite,

    /// `concat` was called on an object-mode stream.
    #[error("cannot concat in object mode")]
    ConcatInObjectMode,

    /// An encoding label was not recognized.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    /// The stream was cancelled through its abort signal without a more
    /// specific reason.
    #[error("the operation was aborted")]
    Aborted,

    /// An application-supplied error carried through `destroy` or `emit`.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Well-known code string for errors that carry one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            StreamError::WriteAfterDestroy => Some("ERR_STREAM_DESTROYED"),
            _ => None,
        }
    }

    /// Shorthand for an application-supplied error.
    pub fn other(msg: impl Into<String>) -> Self {
        StreamError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_only_on_destroyed_write() {
        assert_eq!(
            StreamError::WriteAfterDestroy.code(),
            Some("ERR_STREAM_DESTROYED")
        );
        assert_eq!(StreamError::WriteAfterEnd.code(), None);
        assert_eq!(StreamError::other("boom").code(), None);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(StreamError::WriteAfterEnd.to_string(), "write after end");
        assert_eq!(
            StreamError::ConcatInObjectMode.to_string(),
            "cannot concat in object mode"
        );
        assert_eq!(
            StreamError::UnknownEncoding("koi8-r".to_string()).to_string(),
            "unknown encoding: koi8-r"
        );
    }
}
