//! Payload model: the three chunk shapes a stream can carry.

use bytes::Bytes;
use serde_json::Value;

use crate::decoder::TextEncoding;

/// A single payload item travelling through a stream.
///
/// Byte streams carry [`Chunk::Bytes`], text streams carry [`Chunk::Text`]
/// (decoded in the stream's encoding), and object-mode streams pass any
/// variant through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Contiguous binary data.
    Bytes(Bytes),
    /// Decoded text.
    Text(String),
    /// An arbitrary structured value.
    Object(Value),
}

impl Chunk {
    /// Whether the chunk carries no data. Objects are never empty; they
    /// always enter the pipeline in object mode.
    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Bytes(b) => b.is_empty(),
            Chunk::Text(s) => s.is_empty(),
            Chunk::Object(_) => false,
        }
    }

    /// Borrow the binary payload, if this is a byte chunk.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the text payload, if this is a text chunk.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the object payload, if this is an object chunk.
    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Chunk::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Consume the chunk into its binary payload.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Chunk::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Consume the chunk into its text payload.
    pub fn into_text(self) -> Option<String> {
        match self {
            Chunk::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Bytes(b)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(v: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Chunk {
    fn from(v: &[u8]) -> Self {
        Chunk::Bytes(Bytes::copy_from_slice(v))
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(v: &[u8; N]) -> Self {
        Chunk::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_string())
    }
}

impl From<Value> for Chunk {
    fn from(v: Value) -> Self {
        Chunk::Object(v)
    }
}

/// The payload mode a stream was constructed with. Immutable for the life
/// of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw byte buffers; sizes are byte lengths.
    Bytes,
    /// Decoded strings in the given encoding; sizes are string lengths.
    Text(TextEncoding),
    /// Arbitrary values; sizes are item counts.
    Object,
}

impl Mode {
    /// Whether this is object mode.
    pub fn is_object(&self) -> bool {
        matches!(self, Mode::Object)
    }

    /// The text encoding, when in text mode.
    pub fn encoding(&self) -> Option<TextEncoding> {
        match self {
            Mode::Text(e) => Some(*e),
            _ => None,
        }
    }
}
