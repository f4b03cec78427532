//! Incremental byte-to-string decoding across chunk boundaries.
//!
//! A multi-byte sequence split across two writes must not surface as
//! replacement characters: the decoder holds the trailing partial bytes and
//! prepends them to the next write. The stream consults [`IncrementalDecoder::pending`]
//! to decide whether a string chunk may bypass the decoder entirely.

use bytes::Bytes;

use crate::error::StreamError;

/// Text encodings a stream can decode to and encode from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8.
    Utf8,
    /// UTF-16 little-endian.
    Utf16Le,
    /// Latin-1 (one byte per code point; encoding masks to the low byte).
    Latin1,
}

impl TextEncoding {
    /// Parse an encoding label, accepting the usual aliases.
    pub fn from_label(label: &str) -> Result<Self, StreamError> {
        match label.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(TextEncoding::Utf8),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(TextEncoding::Utf16Le),
            "latin1" | "binary" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(StreamError::UnknownEncoding(other.to_string())),
        }
    }

    /// Canonical label for this encoding.
    pub fn label(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf8",
            TextEncoding::Utf16Le => "utf16le",
            TextEncoding::Latin1 => "latin1",
        }
    }

    /// Encode a string into bytes in this encoding.
    pub fn encode(&self, s: &str) -> Bytes {
        match self {
            TextEncoding::Utf8 => Bytes::copy_from_slice(s.as_bytes()),
            TextEncoding::Utf16Le => {
                let mut out = Vec::with_capacity(s.len() * 2);
                for unit in s.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                Bytes::from(out)
            }
            TextEncoding::Latin1 => {
                let out: Vec<u8> = s.chars().map(|c| (c as u32 & 0xFF) as u8).collect();
                Bytes::from(out)
            }
        }
    }
}

/// Streaming decoder that keeps incomplete trailing sequences buffered.
pub struct IncrementalDecoder {
    encoding: TextEncoding,
    partial: Vec<u8>,
}

impl IncrementalDecoder {
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            partial: Vec::new(),
        }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Whether a partial multi-byte sequence is currently held.
    pub fn pending(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Decode the longest complete-codepoint prefix of the held partial
    /// bytes plus `bytes`; the new trailing remainder is held back.
    /// Complete but invalid sequences decode to U+FFFD.
    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            TextEncoding::Latin1 => decode_latin1(bytes),
            TextEncoding::Utf8 => {
                let mut buf = std::mem::take(&mut self.partial);
                buf.extend_from_slice(bytes);
                let cut = utf8_complete_len(&buf);
                self.partial = buf[cut..].to_vec();
                String::from_utf8_lossy(&buf[..cut]).into_owned()
            }
            TextEncoding::Utf16Le => {
                let mut buf = std::mem::take(&mut self.partial);
                buf.extend_from_slice(bytes);
                let cut = utf16le_complete_len(&buf);
                self.partial = buf[cut..].to_vec();
                decode_utf16le(&buf[..cut])
            }
        }
    }

    /// Flush whatever is still held; an incomplete sequence becomes
    /// replacement characters.
    pub fn end(&mut self) -> String {
        let rest = std::mem::take(&mut self.partial);
        if rest.is_empty() {
            return String::new();
        }
        match self.encoding {
            TextEncoding::Latin1 => decode_latin1(&rest),
            TextEncoding::Utf8 => String::from_utf8_lossy(&rest).into_owned(),
            TextEncoding::Utf16Le => {
                let even = rest.len() & !1;
                let mut out = decode_utf16le(&rest[..even]);
                if rest.len() != even {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                out
            }
        }
    }
}

/// Length of the longest prefix of `buf` that ends on a UTF-8 sequence
/// boundary. Only the final lead byte within reach of the end can start an
/// incomplete sequence, so scanning the last three bytes suffices.
fn utf8_complete_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let b = buf[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = if b >= 0xF0 {
            4
        } else if b >= 0xE0 {
            3
        } else if b >= 0xC0 {
            2
        } else {
            1
        };
        return if need > back { len - back } else { len };
    }
    len
}

/// Length of the longest prefix that ends on a UTF-16 unit boundary and
/// does not strand a lead surrogate waiting for its pair.
fn utf16le_complete_len(buf: &[u8]) -> usize {
    let even = buf.len() & !1;
    if even >= 2 {
        let unit = u16::from_le_bytes([buf[even - 2], buf[even - 1]]);
        if (0xD800..0xDC00).contains(&unit) {
            return even - 2;
        }
    }
    even
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
