//! # Wire Frame Codec
//!
//! Every payload on the fabric is a flat sequence of length-prefixed byte
//! frames: a big-endian `u32` length followed by that many bytes. The first
//! frame of a payload is always the UTF-8 command tag; the rest are the
//! command's arguments in order. There is no nesting and no type tagging,
//! which keeps the format trivially skippable and diffable on the wire.
//!
//! The module also carries the pipe-delimited array form used wherever a
//! list of peers or groups crosses the host boundary. Empty elements are
//! stripped on parse, so `mygroup|other|` never creates a phantom entry.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Incremental payload builder. Frames go in, one contiguous buffer comes
/// out.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one string frame.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put_bytes(s.as_bytes())
    }

    /// Appends one raw byte frame.
    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_u32(b.len() as u32);
        self.buf.put_slice(b);
        self
    }

    /// Finalizes the payload.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Builds a payload from a slice of string frames. Covers almost every
/// command on the fabric; anything fancier uses [`FrameWriter`] directly.
pub fn pack(frames: &[&str]) -> Bytes {
    let mut w = FrameWriter::new();
    for f in frames {
        w.put_str(f);
    }
    w.finish()
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Sequential payload reader. Each `take_*` consumes one frame; reading past
/// the end or hitting a short frame yields [`CodecError::Truncated`].
#[derive(Debug, Clone)]
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Consumes the next frame as raw bytes.
    pub fn take_bytes(&mut self) -> Result<Bytes, CodecError> {
        if self.buf.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(CodecError::Truncated);
        }
        Ok(self.buf.split_to(len))
    }

    /// Consumes the next frame as a UTF-8 string.
    pub fn take_str(&mut self) -> Result<String, CodecError> {
        let raw = self.take_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Utf8)
    }

    /// True when every frame has been consumed.
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// The unread remainder as one buffer, frame boundaries intact.
    pub fn rest(self) -> Bytes {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Pipe-delimited arrays
// ---------------------------------------------------------------------------

/// Serializes a list into the pipe-delimited array form. With
/// `front_delimiter` the delimiter leads (`|a|b`), otherwise it trails
/// (`a|b|`). An empty list serializes to the empty string either way.
pub fn join_array<S: AsRef<str>>(items: &[S], front_delimiter: bool) -> String {
    if items.is_empty() {
        return String::new();
    }
    let body = items
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("|");
    if front_delimiter {
        format!("|{}", body)
    } else {
        format!("{}|", body)
    }
}

/// Parses a pipe-delimited array, stripping empty elements so leading,
/// trailing, or doubled delimiters cannot create phantom entries.
pub fn parse_array(s: &str) -> Vec<String> {
    s.split('|')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
