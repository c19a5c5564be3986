//! Tokio codecs turning serial byte streams into protocol units.
//!
//! The two instruments frame their output differently:
//!
//! - The RFID reader is handled one character at a time. Every received byte
//!   is a complete [`ProtocolUnit::Char`]; nothing is buffered across bytes.
//!   Line assembly belongs to the reader state machine.
//! - The balance is handled one frame at a time. Bytes accumulate until a
//!   `;`, CR or LF; a bare `?` is a frame on its own. A partial frame that
//!   sits idle longer than the configured timeout is discarded by the
//!   transport via [`BalanceCodec::discard_partial`].
//!
//! On output both codecs write the bytes they are given and nothing else.
//! In particular no line terminator is ever appended: a stray newline sent
//! to the reader aborts a continuous read.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use futures::{SinkExt, StreamExt};
//! use tokio_util::codec::Framed;
//! use weigh_protocol::{DeviceCodec, ProtocolUnit};
//!
//! # async fn example(port: tokio::io::DuplexStream) -> weigh_core::Result<()> {
//! let mut framed = Framed::new(port, DeviceCodec::reader());
//! framed.send(Bytes::from_static(b"c")).await?;
//!
//! while let Some(unit) = framed.next().await {
//!     if let ProtocolUnit::Char(byte) = unit? {
//!         println!("{}", byte as char);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use weigh_core::constants::{BALANCE_MAX_FRAME, BALANCE_REPLY_UNKNOWN, DEFAULT_PARTIAL_FRAME_TIMEOUT};
use weigh_core::{DeviceKind, Error, Result};

/// One decoded unit of device output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolUnit {
    /// A single character (reader framing).
    Char(u8),
    /// A complete, trimmed frame (balance framing).
    Frame(String),
    /// Input that could not be framed; the partial data was discarded.
    Malformed(String),
}

/// Per-character codec for the RFID reader.
#[derive(Debug, Default)]
pub struct ReaderCodec;

impl ReaderCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ReaderCodec {
    type Item = ProtocolUnit;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtocolUnit>> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProtocolUnit::Char(src.get_u8())))
    }
}

impl Encoder<Bytes> for ReaderCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Terminator-delimited codec for the balance.
#[derive(Debug)]
pub struct BalanceCodec {
    partial: Vec<u8>,
    last_byte: Option<Instant>,
    idle_timeout: Duration,
    max_frame: usize,
}

impl BalanceCodec {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            partial: Vec::new(),
            last_byte: None,
            idle_timeout,
            max_frame: BALANCE_MAX_FRAME,
        }
    }

    /// Override the longest partial frame kept.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// When the current partial frame goes stale, if there is one.
    pub fn partial_deadline(&self) -> Option<Instant> {
        if self.partial.is_empty() {
            return None;
        }
        self.last_byte.map(|at| at + self.idle_timeout)
    }

    /// Drop the current partial frame, returning how many bytes were lost.
    pub fn discard_partial(&mut self) -> usize {
        let discarded = self.partial.len();
        self.partial.clear();
        self.last_byte = None;
        discarded
    }

    pub fn partial_len(&self) -> usize {
        self.partial.len()
    }

    fn take_frame(&mut self) -> Option<String> {
        let frame = String::from_utf8_lossy(&self.partial).trim().to_string();
        self.partial.clear();
        self.last_byte = None;
        (!frame.is_empty()).then_some(frame)
    }
}

impl Default for BalanceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PARTIAL_FRAME_TIMEOUT)
    }
}

impl Decoder for BalanceCodec {
    type Item = ProtocolUnit;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtocolUnit>> {
        while src.has_remaining() {
            let byte = src.get_u8();
            match byte {
                b';' | b'\r' | b'\n' => {
                    if let Some(frame) = self.take_frame() {
                        return Ok(Some(ProtocolUnit::Frame(frame)));
                    }
                }
                b'?' if self.partial.iter().all(u8::is_ascii_whitespace) => {
                    self.discard_partial();
                    return Ok(Some(ProtocolUnit::Frame(BALANCE_REPLY_UNKNOWN.to_string())));
                }
                _ => {
                    if self.partial.len() >= self.max_frame {
                        let discarded = self.discard_partial();
                        self.partial.push(byte);
                        self.last_byte = Some(Instant::now());
                        return Ok(Some(ProtocolUnit::Malformed(format!(
                            "frame exceeds {} bytes without terminator",
                            discarded
                        ))));
                    }
                    self.partial.push(byte);
                    self.last_byte = Some(Instant::now());
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for BalanceCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Codec for either device kind.
#[derive(Debug)]
pub enum DeviceCodec {
    Reader(ReaderCodec),
    Balance(BalanceCodec),
}

impl DeviceCodec {
    pub fn reader() -> Self {
        Self::Reader(ReaderCodec::new())
    }

    pub fn balance(idle_timeout: Duration) -> Self {
        Self::Balance(BalanceCodec::new(idle_timeout))
    }

    pub fn for_kind(kind: DeviceKind, idle_timeout: Duration) -> Self {
        match kind {
            DeviceKind::Reader => Self::reader(),
            DeviceKind::Balance => Self::balance(idle_timeout),
        }
    }

    /// Deadline of the pending partial frame; readers never have one.
    pub fn partial_deadline(&self) -> Option<Instant> {
        match self {
            Self::Reader(_) => None,
            Self::Balance(codec) => codec.partial_deadline(),
        }
    }

    pub fn discard_partial(&mut self) -> usize {
        match self {
            Self::Reader(_) => 0,
            Self::Balance(codec) => codec.discard_partial(),
        }
    }
}

impl Decoder for DeviceCodec {
    type Item = ProtocolUnit;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ProtocolUnit>> {
        match self {
            Self::Reader(codec) => codec.decode(src),
            Self::Balance(codec) => codec.decode(src),
        }
    }
}

impl Encoder<Bytes> for DeviceCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Reader(codec) => codec.encode(item, dst),
            Self::Balance(codec) => codec.encode(item, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode_all(codec: &mut impl Decoder<Item = ProtocolUnit, Error = Error>, input: &[u8]) -> Vec<ProtocolUnit> {
        let mut buffer = BytesMut::from(input);
        let mut units = Vec::new();
        while let Some(unit) = codec.decode(&mut buffer).unwrap() {
            units.push(unit);
        }
        units
    }

    fn frames(units: &[&str]) -> Vec<ProtocolUnit> {
        units.iter().map(|s| ProtocolUnit::Frame(s.to_string())).collect()
    }

    #[test]
    fn test_reader_emits_every_byte() {
        let mut codec = ReaderCodec::new();
        let units = decode_all(&mut codec, b"Z1\r\n");
        assert_eq!(
            units,
            vec![
                ProtocolUnit::Char(b'Z'),
                ProtocolUnit::Char(b'1'),
                ProtocolUnit::Char(b'\r'),
                ProtocolUnit::Char(b'\n'),
            ]
        );
    }

    #[test]
    fn test_reader_encode_adds_nothing() {
        let mut codec = DeviceCodec::reader();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"c"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"c");
    }

    #[rstest]
    #[case(b"000\r\n", vec!["000"])]
    #[case(b"0;", vec!["0"])]
    #[case(b"1234\r\n1240\r\n", vec!["1234", "1240"])]
    #[case(b"?", vec!["?"])]
    #[case(b"\r\n?\r\n", vec!["?"])]
    #[case(b"  42 ;", vec!["42"])]
    #[case(b"\r\n\r\n;;", vec![])]
    fn test_balance_framing(#[case] input: &[u8], #[case] expected: Vec<&str>) {
        let mut codec = BalanceCodec::default();
        assert_eq!(decode_all(&mut codec, input), frames(&expected));
    }

    #[test]
    fn test_balance_partial_frame_waits_for_terminator() {
        let mut codec = BalanceCodec::default();
        assert!(decode_all(&mut codec, b"12").is_empty());
        assert_eq!(codec.partial_len(), 2);
        assert!(codec.partial_deadline().is_some());

        assert_eq!(decode_all(&mut codec, b"34\r\n"), frames(&["1234"]));
        assert!(codec.partial_deadline().is_none());
    }

    #[test]
    fn test_balance_discard_partial() {
        let mut codec = BalanceCodec::default();
        decode_all(&mut codec, b"12");
        assert_eq!(codec.discard_partial(), 2);
        assert_eq!(decode_all(&mut codec, b"5\r\n"), frames(&["5"]));
    }

    #[test]
    fn test_balance_question_mark_inside_frame_is_data() {
        let mut codec = BalanceCodec::default();
        assert_eq!(decode_all(&mut codec, b"ESR?;"), frames(&["ESR?"]));
    }

    #[test]
    fn test_balance_overlong_frame_is_malformed() {
        let mut codec = BalanceCodec::default().with_max_frame(4);
        let units = decode_all(&mut codec, b"123456\r\n");
        assert!(matches!(units[0], ProtocolUnit::Malformed(_)));
        assert_eq!(units[1], ProtocolUnit::Frame("56".to_string()));
    }

    #[test]
    fn test_device_codec_reader_has_no_partial_deadline() {
        let mut codec = DeviceCodec::for_kind(DeviceKind::Reader, Duration::from_millis(10));
        let mut buffer = BytesMut::from(&b"12"[..]);
        codec.decode(&mut buffer).unwrap();
        assert!(codec.partial_deadline().is_none());
        assert_eq!(codec.discard_partial(), 0);
    }
}
