// Copyright (c) 2024 Botho Foundation

//! Wire framing for overlay messages.
//!
//! Every frame on the wire is a fixed-width length header followed by a UTF-8
//! body:
//!
//! ```text
//! ┌──────────────────────────────────────┬──────────────────────────────┐
//! │ length: decimal ASCII, space-padded  │ body: COMMAND(payload)       │
//! │ (prefix_width bytes, default 64)     │ (exactly `length` bytes)     │
//! └──────────────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The command tag is everything before the first `(`; the payload is
//! everything between that `(` and the final `)` of the body. Payloads may
//! therefore contain parentheses of their own without breaking the envelope.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default width of the length header in bytes.
pub const DEFAULT_PREFIX_WIDTH: usize = 64;

/// Default maximum size of a frame body in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A malformed frame received from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Not enough bytes for the length header.
    #[error("length header truncated: got {len} of {width} bytes")]
    ShortHeader { len: usize, width: usize },

    /// The length header is not a padded decimal number.
    #[error("length header is not a decimal number: {0:?}")]
    InvalidLength(String),

    /// The declared body length exceeds the configured maximum.
    #[error("declared body length {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// The body does not have the declared length.
    #[error("body length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The body is not valid UTF-8.
    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    /// The body has no opening parenthesis after the command tag.
    #[error("envelope has no opening parenthesis")]
    MissingOpenParen,

    /// The body does not end with a closing parenthesis.
    #[error("envelope is not closed by a parenthesis")]
    MissingCloseParen,

    /// The command tag is empty or contains forbidden characters.
    #[error("invalid command tag: {0:?}")]
    InvalidCommand(String),
}

/// A frame that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// The command tag is empty or contains forbidden characters.
    #[error("invalid command tag: {0:?}")]
    InvalidCommand(String),

    /// The body exceeds the configured maximum.
    #[error("body length {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// The decimal body length does not fit into the header.
    #[error("length needs {digits} digits but the header is {width} bytes wide")]
    PrefixOverflow { digits: usize, width: usize },
}

/// Errors produced by [`FrameCodec`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// Malformed frame on the wire.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Frame could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether this error came from a malformed frame.
    pub fn is_framing(&self) -> bool {
        matches!(self, FrameError::Framing(_))
    }
}

/// One decoded frame: a command tag plus its text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command tag, e.g. `NODE_CON_ADDR`
    pub command: String,

    /// Payload between the envelope parentheses
    pub payload: String,
}

impl Frame {
    /// Create a new frame.
    pub fn new(command: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// The body as it appears on the wire, without the length header.
    pub fn body(&self) -> String {
        merge_command(&self.command, &self.payload)
    }
}

/// Join a command tag and a payload into an envelope: `cmd(msg)`.
pub fn merge_command(cmd: &str, msg: &str) -> String {
    format!("{cmd}({msg})")
}

/// Strip a known command tag and the enclosing parentheses from an envelope.
///
/// The caller has to know which command was sent; returns `None` when `msg`
/// is not a `cmd(...)` envelope.
pub fn split_command<'a>(cmd: &str, msg: &'a str) -> Option<&'a str> {
    msg.strip_prefix(cmd)?.strip_prefix('(')?.strip_suffix(')')
}

fn is_valid_command(command: &str) -> bool {
    !command.is_empty()
        && command
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '(' && c != ')')
}

/// Codec for length-prefixed `COMMAND(payload)` frames.
///
/// Usable directly through [`FrameCodec::encode`] / [`FrameCodec::decode`],
/// or as a `tokio_util` codec wrapped around a socket with `Framed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    prefix_width: usize,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX_WIDTH, DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec with the given header width and body size limit.
    pub fn new(prefix_width: usize, max_frame_size: usize) -> Self {
        Self {
            prefix_width,
            max_frame_size,
        }
    }

    /// Width of the length header in bytes.
    pub fn prefix_width(&self) -> usize {
        self.prefix_width
    }

    /// Maximum body size in bytes.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Render the length header for a body of `len` bytes.
    pub fn length_prefix(&self, len: usize) -> Result<Vec<u8>, EncodingError> {
        let digits = len.to_string();
        if digits.len() > self.prefix_width {
            return Err(EncodingError::PrefixOverflow {
                digits: digits.len(),
                width: self.prefix_width,
            });
        }

        let mut prefix = digits.into_bytes();
        prefix.resize(self.prefix_width, b' ');
        Ok(prefix)
    }

    /// Encode `command(payload)` with its length header.
    pub fn encode(&self, command: &str, payload: &str) -> Result<Vec<u8>, FrameError> {
        let mut dst = BytesMut::new();
        self.encode_into(command, payload, &mut dst)?;
        Ok(dst.to_vec())
    }

    /// Check that `command(payload)` can be put on the wire without writing
    /// anything. Returns the body length.
    pub fn check(&self, command: &str, payload: &str) -> Result<usize, EncodingError> {
        if !is_valid_command(command) {
            return Err(EncodingError::InvalidCommand(command.to_string()));
        }

        let body_len = command.len() + payload.len() + 2;
        if body_len > self.max_frame_size {
            return Err(EncodingError::TooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }
        Ok(body_len)
    }

    fn encode_into(
        &self,
        command: &str,
        payload: &str,
        dst: &mut BytesMut,
    ) -> Result<(), EncodingError> {
        let body_len = self.check(command, payload)?;
        let prefix = self.length_prefix(body_len)?;
        dst.reserve(prefix.len() + body_len);
        dst.put_slice(&prefix);
        dst.put_slice(command.as_bytes());
        dst.put_u8(b'(');
        dst.put_slice(payload.as_bytes());
        dst.put_u8(b')');
        Ok(())
    }

    /// Decode one complete frame. `raw` must hold exactly one frame.
    pub fn decode(&self, raw: &[u8]) -> Result<Frame, FrameError> {
        if raw.len() < self.prefix_width {
            return Err(FramingError::ShortHeader {
                len: raw.len(),
                width: self.prefix_width,
            }
            .into());
        }

        let declared = self.parse_length(&raw[..self.prefix_width])?;
        let body = &raw[self.prefix_width..];
        if body.len() != declared {
            return Err(FramingError::LengthMismatch {
                declared,
                actual: body.len(),
            }
            .into());
        }

        Ok(self.parse_body(body)?)
    }

    fn parse_length(&self, header: &[u8]) -> Result<usize, FramingError> {
        let text = std::str::from_utf8(header)
            .map_err(|_| FramingError::InvalidLength(String::from_utf8_lossy(header).into()))?;
        let digits = text.trim_matches(' ');

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FramingError::InvalidLength(text.to_string()));
        }

        let len: usize = digits
            .parse()
            .map_err(|_| FramingError::InvalidLength(text.to_string()))?;
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(len)
    }

    fn parse_body(&self, body: &[u8]) -> Result<Frame, FramingError> {
        let body = std::str::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)?;

        let open = body.find('(').ok_or(FramingError::MissingOpenParen)?;
        // The closing paren must come after the opening one, so "CMD(" fails here.
        if body.len() < open + 2 || !body.ends_with(')') {
            return Err(FramingError::MissingCloseParen);
        }

        let command = &body[..open];
        if !is_valid_command(command) {
            return Err(FramingError::InvalidCommand(command.to_string()));
        }

        Ok(Frame::new(command, &body[open + 1..body.len() - 1]))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < self.prefix_width {
            src.reserve(self.prefix_width - src.len());
            return Ok(None);
        }

        let declared = self.parse_length(&src[..self.prefix_width])?;
        let total = self.prefix_width + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total);
        Ok(Some(self.parse_body(&raw[self.prefix_width..])?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = Decoder::decode(self, src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Stream ended in the middle of a frame.
        if src.len() < self.prefix_width {
            return Err(FramingError::ShortHeader {
                len: src.len(),
                width: self.prefix_width,
            }
            .into());
        }
        let declared = self.parse_length(&src[..self.prefix_width])?;
        Err(FramingError::LengthMismatch {
            declared,
            actual: src.len() - self.prefix_width,
        }
        .into())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        Ok(self.encode_into(&item.command, &item.payload, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn test_length_prefix_is_padded() {
        let prefix = codec().length_prefix(27).unwrap();
        assert_eq!(prefix.len(), 64);
        assert_eq!(&prefix[..2], b"27");
        assert!(prefix[2..].iter().all(|b| *b == b' '));
    }

    #[test]
    fn test_encode_layout() {
        let raw = codec().encode("NODE_CON_ADDR", "127.0.0.1,5050").unwrap();
        let body = "NODE_CON_ADDR(127.0.0.1,5050)";

        assert_eq!(raw.len(), 64 + body.len());
        assert_eq!(&raw[64..], body.as_bytes());
        let header = std::str::from_utf8(&raw[..64]).unwrap();
        assert_eq!(header.trim_end(), body.len().to_string());
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let cases = [
            ("NODE_DATA", "hello"),
            ("NODE_DATA", ""),
            ("NODE_DATA", "nested (parens) and )( odd ones"),
            ("X", "ünïcødé ✓"),
            ("NODE_PEER_LIST", r#"[{"id":"a","host":"h","port":1}]"#),
        ];

        for (command, payload) in cases {
            let raw = codec.encode(command, payload).unwrap();
            let frame = codec.decode(&raw).unwrap();
            assert_eq!(frame, Frame::new(command, payload));
        }
    }

    #[test]
    fn test_length_counts_utf8_bytes() {
        let raw = codec().encode("X", "é").unwrap();
        let header = std::str::from_utf8(&raw[..64]).unwrap();
        // "X(" + 2 bytes + ")"
        assert_eq!(header.trim_end(), "5");
    }

    #[test]
    fn test_short_body_fails() {
        let codec = codec();
        let mut raw = codec.encode("NODE_DATA", "hello").unwrap();
        raw.pop();

        let err = codec.decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Framing(FramingError::LengthMismatch { declared: 16, actual: 15 })
        ));
    }

    #[test]
    fn test_long_body_fails() {
        let codec = codec();
        let mut raw = codec.encode("NODE_DATA", "hello").unwrap();
        raw.push(b'!');

        let err = codec.decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Framing(FramingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_non_numeric_length_fails() {
        let mut raw = b"12a".to_vec();
        raw.resize(64, b' ');
        raw.extend_from_slice(b"X(a)");

        let err = codec().decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Framing(FramingError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_blank_length_fails() {
        let raw = vec![b' '; 64];
        assert!(codec().decode(&raw).unwrap_err().is_framing());
    }

    #[test]
    fn test_short_header_fails() {
        let err = codec().decode(b"12   ").unwrap_err();
        assert!(matches!(
            err,
            FrameError::Framing(FramingError::ShortHeader { len: 5, width: 64 })
        ));
    }

    #[test]
    fn test_unbalanced_envelope_fails() {
        let codec = codec();
        for (body, expected) in [
            ("NODE_DATA", FramingError::MissingOpenParen),
            ("NODE_DATA(abc", FramingError::MissingCloseParen),
            ("NODE_DATA(", FramingError::MissingCloseParen),
            ("(abc)", FramingError::InvalidCommand(String::new())),
        ] {
            let mut raw = codec.length_prefix(body.len()).unwrap();
            raw.extend_from_slice(body.as_bytes());

            match codec.decode(&raw) {
                Err(FrameError::Framing(err)) => assert_eq!(err, expected, "body {body:?}"),
                other => panic!("expected framing error for {body:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let codec = codec();
        let body = [b'X', b'(', 0xff, b')'];
        let mut raw = codec.length_prefix(body.len()).unwrap();
        raw.extend_from_slice(&body);

        assert!(matches!(
            codec.decode(&raw).unwrap_err(),
            FrameError::Framing(FramingError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::new(64, 16);
        let err = codec.encode("NODE_DATA", "this payload is too long").unwrap_err();
        assert!(matches!(
            err,
            FrameError::Encoding(EncodingError::TooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_declaration() {
        let small = FrameCodec::new(64, 8);
        let raw = FrameCodec::default().encode("NODE_DATA", "0123456789").unwrap();
        assert!(matches!(
            small.decode(&raw).unwrap_err(),
            FrameError::Framing(FramingError::TooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_bad_command() {
        let codec = codec();
        for command in ["", "A(B", "WITH SPACE", "CLOSE)"] {
            assert!(matches!(
                codec.encode(command, "x").unwrap_err(),
                FrameError::Encoding(EncodingError::InvalidCommand(_))
            ));
        }
    }

    #[test]
    fn test_prefix_overflow() {
        let codec = FrameCodec::new(2, 1024);
        let payload = "x".repeat(120);
        assert!(matches!(
            codec.encode("NODE_DATA", &payload).unwrap_err(),
            FrameError::Encoding(EncodingError::PrefixOverflow { width: 2, .. })
        ));
    }

    #[test]
    fn test_custom_prefix_width_round_trip() {
        let codec = FrameCodec::new(8, 1024);
        let raw = codec.encode("NODE_HELLO", "hi").unwrap();
        assert_eq!(&raw[..8], b"14      ");
        assert_eq!(codec.decode(&raw).unwrap(), Frame::new("NODE_HELLO", "hi"));
    }

    #[test]
    fn test_merge_and_split_command() {
        let msg = merge_command("NODE_CON_ADDR", "10.0.0.1,5050");
        assert_eq!(msg, "NODE_CON_ADDR(10.0.0.1,5050)");
        assert_eq!(split_command("NODE_CON_ADDR", &msg), Some("10.0.0.1,5050"));
        assert_eq!(split_command("NODE_DATA", &msg), None);
        assert_eq!(split_command("NODE_CON_ADDR", "NODE_CON_ADDR(open"), None);
    }

    #[test]
    fn test_streaming_decoder_waits_for_full_frame() {
        let mut codec = codec();
        let raw = codec.encode("NODE_DATA", "streamed").unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&raw[..10]);
        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());

        buf.extend_from_slice(&raw[10..70]);
        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());

        buf.extend_from_slice(&raw[70..]);
        let frame = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new("NODE_DATA", "streamed"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decoder_splits_back_to_back_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        Encoder::encode(&mut codec, Frame::new("A", "1"), &mut buf).unwrap();
        Encoder::encode(&mut codec, Frame::new("B", "2"), &mut buf).unwrap();

        let first = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        let second = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(first.command, "A");
        assert_eq!(second.command, "B");
        assert!(Decoder::decode(&mut codec, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_eof_reports_truncated_frame() {
        let mut codec = codec();
        let raw = codec.encode("NODE_DATA", "cut short").unwrap();
        let mut buf = BytesMut::from(&raw[..raw.len() - 3]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Framing(FramingError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_check_matches_encode() {
        let codec = FrameCodec::new(64, 16);
        assert_eq!(codec.check("NODE_DATA", "abc"), Ok(14));
        assert!(matches!(
            codec.check("NODE_DATA", "this payload is too long"),
            Err(EncodingError::TooLarge { size: 35, max: 16 })
        ));
        assert!(codec.check("BAD TAG", "").is_err());
    }

    proptest! {
        /// Any valid tag and UTF-8 payload within the size limit survives
        /// encode then decode unchanged.
        #[test]
        fn prop_frame_round_trip(command in "[A-Z_]{1,24}", payload in any::<String>()) {
            let codec = codec();
            let raw = codec.encode(&command, &payload).unwrap();

            prop_assert_eq!(raw.len(), 64 + command.len() + payload.len() + 2);
            prop_assert_eq!(codec.decode(&raw).unwrap(), Frame::new(command, payload));
        }

        /// Parentheses inside the payload never confuse the envelope.
        #[test]
        fn prop_parenthesised_payload_round_trip(payload in "[() x,]{0,64}") {
            let codec = codec();
            let raw = codec.encode("NODE_DATA", &payload).unwrap();
            let frame = codec.decode(&raw).unwrap();

            prop_assert_eq!(&frame.payload, &payload);
            let body = frame.body();
            prop_assert_eq!(split_command("NODE_DATA", &body), Some(payload.as_str()));
        }
    }
}
