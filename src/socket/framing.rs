//! Packet framing: reassembling logical frames from a byte stream.
//!
//! The engine is a push parser: `feed` appends raw bytes, `next_frame`
//! extracts at most one complete frame. Frame boundaries never depend on
//! how the bytes were chunked on the wire, and any frame that would
//! exceed `package_max_length` is a fatal protocol error.

use crate::base::neterror::NetError;
use bytes::{Bytes, BytesMut};

/// Upper bound on a single frame unless overridden.
pub const DEFAULT_PACKAGE_MAX_LENGTH: usize = 2 * 1024 * 1024;

/// Longest permitted end-of-frame marker.
pub const EOF_MARKER_MAX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
    Native,
}

/// Wire encoding of a length-prefix field, named by `pack()`-style
/// format characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthFormat {
    width: usize,
    signed: bool,
    order: ByteOrder,
}

impl LengthFormat {
    /// Maps a format character to its field layout:
    /// `c`/`C` one byte, `s`/`S` native u16, `n` big-endian u16,
    /// `v` little-endian u16, `l`/`L` native u32, `N` big-endian u32,
    /// `V` little-endian u32, `q`/`Q` native u64.
    pub fn from_pack_char(ch: char) -> Option<LengthFormat> {
        let (width, signed, order) = match ch {
            'c' => (1, true, ByteOrder::Native),
            'C' => (1, false, ByteOrder::Native),
            's' => (2, true, ByteOrder::Native),
            'S' => (2, false, ByteOrder::Native),
            'n' => (2, false, ByteOrder::Big),
            'v' => (2, false, ByteOrder::Little),
            'l' => (4, true, ByteOrder::Native),
            'L' => (4, false, ByteOrder::Native),
            'N' => (4, false, ByteOrder::Big),
            'V' => (4, false, ByteOrder::Little),
            'q' => (8, true, ByteOrder::Native),
            'Q' => (8, false, ByteOrder::Native),
            _ => return None,
        };
        Some(LengthFormat {
            width,
            signed,
            order,
        })
    }

    pub fn width(self) -> usize {
        self.width
    }

    /// Decodes the length field from `bytes` (which must hold at least
    /// `width` bytes). Signed formats may decode negative.
    fn decode(self, bytes: &[u8]) -> i64 {
        let mut raw = [0u8; 8];
        match self.order {
            ByteOrder::Big => raw[8 - self.width..].copy_from_slice(&bytes[..self.width]),
            ByteOrder::Little | ByteOrder::Native => {
                let mut tmp = [0u8; 8];
                tmp[..self.width].copy_from_slice(&bytes[..self.width]);
                if cfg!(target_endian = "big") && self.order == ByteOrder::Native {
                    raw[8 - self.width..].copy_from_slice(&bytes[..self.width]);
                } else {
                    raw.copy_from_slice(&tmp);
                    return self.finish_le(raw);
                }
            }
        }
        let value = u64::from_be_bytes(raw);
        self.sign_extend(value)
    }

    fn finish_le(self, raw: [u8; 8]) -> i64 {
        let value = u64::from_le_bytes(raw);
        self.sign_extend(value)
    }

    fn sign_extend(self, value: u64) -> i64 {
        if !self.signed {
            return value as i64;
        }
        let shift = 64 - self.width * 8;
        ((value << shift) as i64) >> shift
    }
}

/// Verdict of a custom length callback inspecting the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthDecision {
    /// Frame length is not yet determinable; feed more bytes.
    NeedMore,
    /// The frame spans `n` bytes from the start of the buffer.
    Total(usize),
}

/// How frame boundaries are recognized.
#[derive(Clone)]
pub enum FramingMode {
    /// No reassembly: every read yields whatever arrived.
    None,
    /// Frames end with a fixed marker.
    Eof {
        marker: Vec<u8>,
        /// When true, one read may carry several frames and the engine
        /// splits them apart; when false a frame is complete only when
        /// the buffer ends with the marker.
        split: bool,
    },
    /// Frames carry an explicit length field in their header.
    LengthPrefixed {
        format: LengthFormat,
        length_offset: usize,
        body_offset: usize,
    },
    /// Frame length decided by user code inspecting the raw buffer.
    Callback(fn(&[u8]) -> LengthDecision),
}

impl std::fmt::Debug for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingMode::None => f.write_str("None"),
            FramingMode::Eof { marker, split } => f
                .debug_struct("Eof")
                .field("marker", marker)
                .field("split", split)
                .finish(),
            FramingMode::LengthPrefixed {
                format,
                length_offset,
                body_offset,
            } => f
                .debug_struct("LengthPrefixed")
                .field("format", format)
                .field("length_offset", length_offset)
                .field("body_offset", body_offset)
                .finish(),
            FramingMode::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Framing mode plus the frame size bound.
#[derive(Debug, Clone)]
pub struct FramingConfig {
    pub mode: FramingMode,
    pub package_max_length: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig {
            mode: FramingMode::None,
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        }
    }
}

impl FramingConfig {
    pub fn none() -> FramingConfig {
        FramingConfig::default()
    }

    /// EOF-marker framing. Fails if the marker is empty or longer than
    /// [`EOF_MARKER_MAX_LEN`].
    pub fn eof(marker: impl Into<Vec<u8>>, split: bool) -> Result<FramingConfig, NetError> {
        let marker = marker.into();
        if marker.is_empty() || marker.len() > EOF_MARKER_MAX_LEN {
            return Err(NetError::InvalidSetting(format!(
                "package_eof must be 1..={EOF_MARKER_MAX_LEN} bytes, got {}",
                marker.len()
            )));
        }
        Ok(FramingConfig {
            mode: FramingMode::Eof { marker, split },
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        })
    }

    /// Length-prefixed framing with a `pack()`-style type character.
    pub fn length_prefixed(
        pack_char: char,
        length_offset: usize,
        body_offset: usize,
    ) -> Result<FramingConfig, NetError> {
        let format = LengthFormat::from_pack_char(pack_char).ok_or_else(|| {
            NetError::InvalidSetting(format!(
                "unknown package_length_type {pack_char:?}"
            ))
        })?;
        Ok(FramingConfig {
            mode: FramingMode::LengthPrefixed {
                format,
                length_offset,
                body_offset,
            },
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        })
    }

    pub fn callback(decide: fn(&[u8]) -> LengthDecision) -> FramingConfig {
        FramingConfig {
            mode: FramingMode::Callback(decide),
            package_max_length: DEFAULT_PACKAGE_MAX_LENGTH,
        }
    }

    pub fn max_length(mut self, max: usize) -> FramingConfig {
        self.package_max_length = max;
        self
    }
}

/// Incremental frame extractor over a growable byte buffer.
#[derive(Debug)]
pub struct FramingEngine {
    config: FramingConfig,
    buffer: BytesMut,
    /// Bytes already scanned for an EOF marker without finding one.
    scanned: usize,
    /// Set once a frame overruns the bound; latches the error.
    failed: bool,
}

impl FramingEngine {
    pub fn new(config: FramingConfig) -> FramingEngine {
        FramingEngine {
            config,
            buffer: BytesMut::new(),
            scanned: 0,
            failed: false,
        }
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Replaces the framing configuration. Buffered bytes are kept and
    /// reinterpreted under the new mode.
    pub fn set_config(&mut self, config: FramingConfig) {
        self.config = config;
        self.scanned = 0;
        self.failed = false;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.failed = false;
    }

    /// Extracts the next complete frame, or `None` if more bytes are
    /// needed. A frame (or an unbounded non-frame) larger than
    /// `package_max_length` is fatal: the buffer is dropped and the error
    /// is sticky for the connection.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.failed {
            return Err(NetError::PacketTooLong);
        }
        let max = self.config.package_max_length;
        match &self.config.mode {
            FramingMode::None => {
                if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    let frame = self.buffer.split().freeze();
                    Ok(Some(frame))
                }
            }
            FramingMode::Eof { marker, split: true } => {
                // Resume the scan where it left off, backing up in case a
                // marker straddles the previous chunk boundary.
                let start = self.scanned.saturating_sub(marker.len().saturating_sub(1));
                match find(&self.buffer[start..], marker) {
                    Some(pos) => {
                        let end = start + pos + marker.len();
                        if end > max {
                            self.buffer.clear();
                            self.scanned = 0;
                            self.failed = true;
                            return Err(NetError::PacketTooLong);
                        }
                        self.scanned = 0;
                        Ok(Some(self.buffer.split_to(end).freeze()))
                    }
                    None => {
                        if self.buffer.len() > max {
                            self.buffer.clear();
                            self.scanned = 0;
                            self.failed = true;
                            return Err(NetError::PacketTooLong);
                        }
                        self.scanned = self.buffer.len();
                        Ok(None)
                    }
                }
            }
            FramingMode::Eof { marker, split: false } => {
                if self.buffer.len() > max {
                    self.buffer.clear();
                    self.scanned = 0;
                    self.failed = true;
                    return Err(NetError::PacketTooLong);
                }
                if self.buffer.len() >= marker.len()
                    && self.buffer.ends_with(marker)
                {
                    Ok(Some(self.buffer.split().freeze()))
                } else {
                    Ok(None)
                }
            }
            FramingMode::LengthPrefixed {
                format,
                length_offset,
                body_offset,
            } => {
                let header_need = length_offset + format.width();
                if self.buffer.len() < header_need {
                    if header_need > max {
                        self.buffer.clear();
                        self.scanned = 0;
                        self.failed = true;
                        return Err(NetError::PacketTooLong);
                    }
                    return Ok(None);
                }
                let length = format.decode(&self.buffer[*length_offset..]);
                if length < 0 {
                    self.buffer.clear();
                    return Err(NetError::InvalidPacketHeader);
                }
                let total = body_offset
                    .checked_add(length as usize)
                    .ok_or(NetError::InvalidPacketHeader)?;
                if total == 0 {
                    self.buffer.clear();
                    return Err(NetError::InvalidPacketHeader);
                }
                if total > max {
                    self.buffer.clear();
                    self.scanned = 0;
                    self.failed = true;
                    return Err(NetError::PacketTooLong);
                }
                if self.buffer.len() < total {
                    return Ok(None);
                }
                let mut frame = self.buffer.split_to(total);
                let body = frame.split_off((*body_offset).min(total));
                Ok(Some(body.freeze()))
            }
            FramingMode::Callback(decide) => match decide(&self.buffer) {
                LengthDecision::NeedMore => {
                    if self.buffer.len() > max {
                        self.buffer.clear();
                        self.scanned = 0;
                        self.failed = true;
                        return Err(NetError::PacketTooLong);
                    }
                    Ok(None)
                }
                LengthDecision::Total(0) => {
                    self.buffer.clear();
                    Err(NetError::InvalidPacketHeader)
                }
                LengthDecision::Total(total) => {
                    if total > max {
                        self.buffer.clear();
                        self.scanned = 0;
                        self.failed = true;
                        return Err(NetError::PacketTooLong);
                    }
                    if self.buffer.len() < total {
                        Ok(None)
                    } else {
                        Ok(Some(self.buffer.split_to(total).freeze()))
                    }
                }
            },
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(engine: &mut FramingEngine) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = engine.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn eof_split_separates_back_to_back_frames() {
        let mut engine = FramingEngine::new(FramingConfig::eof(&b"\r\n"[..], true).unwrap());
        engine.feed(b"one\r\ntwo\r\nthr");
        assert_eq!(frames(&mut engine), vec![&b"one\r\n"[..], &b"two\r\n"[..]]);
        engine.feed(b"ee\r\n");
        assert_eq!(frames(&mut engine), vec![&b"three\r\n"[..]]);
    }

    #[test]
    fn eof_marker_straddling_chunks() {
        let mut engine = FramingEngine::new(FramingConfig::eof(&b"\r\n"[..], true).unwrap());
        engine.feed(b"hello\r");
        assert_eq!(engine.next_frame().unwrap(), None);
        engine.feed(b"\nrest");
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(b"hello\r\n")));
        assert_eq!(engine.buffered(), 4);
    }

    #[test]
    fn eof_without_split_needs_trailing_marker() {
        let mut engine = FramingEngine::new(FramingConfig::eof(&b"\r\n"[..], false).unwrap());
        engine.feed(b"a\r\nb");
        assert_eq!(engine.next_frame().unwrap(), None);
        engine.feed(b"\r\n");
        assert_eq!(
            engine.next_frame().unwrap(),
            Some(Bytes::from_static(b"a\r\nb\r\n"))
        );
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let config = FramingConfig::eof(&b"\r\n"[..], true).unwrap().max_length(10);
        let mut engine = FramingEngine::new(config);
        engine.feed(b"hello world\r\n");
        assert_eq!(engine.next_frame(), Err(NetError::PacketTooLong));
        assert!(engine.is_empty());
    }

    #[test]
    fn oversized_frame_error_is_sticky() {
        let config = FramingConfig::eof(&b"\r\n"[..], true).unwrap().max_length(10);
        let mut engine = FramingEngine::new(config);
        engine.feed(b"hello world\r\n");
        assert_eq!(engine.next_frame(), Err(NetError::PacketTooLong));
        engine.feed(b"ok\r\n");
        assert_eq!(engine.next_frame(), Err(NetError::PacketTooLong));
        engine.clear();
        engine.feed(b"ok\r\n");
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(b"ok\r\n")));
    }

    #[test]
    fn length_prefixed_yields_body_only() {
        let config = FramingConfig::length_prefixed('n', 0, 2).unwrap();
        let mut engine = FramingEngine::new(config);
        engine.feed(&[0x00, 0x05]);
        engine.feed(b"hel");
        assert_eq!(engine.next_frame().unwrap(), None);
        engine.feed(b"lo");
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(b"hello")));
    }

    #[test]
    fn length_prefixed_chunking_invariance() {
        let mut wire = Vec::new();
        for body in [&b"alpha"[..], &b"bee"[..], &b"candle"[..]] {
            wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
            wire.extend_from_slice(body);
        }
        for chunk in [1usize, 2, 3, wire.len()] {
            let config = FramingConfig::length_prefixed('n', 0, 2).unwrap();
            let mut engine = FramingEngine::new(config);
            let mut got = Vec::new();
            for piece in wire.chunks(chunk) {
                engine.feed(piece);
                while let Some(frame) = engine.next_frame().unwrap() {
                    got.push(frame);
                }
            }
            assert_eq!(got, vec![&b"alpha"[..], &b"bee"[..], &b"candle"[..]]);
        }
    }

    #[test]
    fn negative_length_is_invalid_header() {
        let config = FramingConfig::length_prefixed('l', 0, 4).unwrap();
        let mut engine = FramingEngine::new(config);
        engine.feed(&(-5i32).to_ne_bytes());
        assert_eq!(engine.next_frame(), Err(NetError::InvalidPacketHeader));
    }

    #[test]
    fn little_endian_and_offset_header() {
        // 4-byte magic, then a LE u16 length, body right after.
        let config = FramingConfig::length_prefixed('v', 4, 6).unwrap();
        let mut engine = FramingEngine::new(config);
        engine.feed(b"MAGC");
        engine.feed(&3u16.to_le_bytes());
        engine.feed(b"xyz");
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn callback_framing() {
        fn decide(buf: &[u8]) -> LengthDecision {
            if buf.len() < 1 {
                LengthDecision::NeedMore
            } else {
                LengthDecision::Total(1 + buf[0] as usize)
            }
        }
        let mut engine = FramingEngine::new(FramingConfig::callback(decide));
        engine.feed(&[3, b'a', b'b']);
        assert_eq!(engine.next_frame().unwrap(), None);
        engine.feed(&[b'c', 2, b'd', b'e']);
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(&[3, b'a', b'b', b'c'])));
        assert_eq!(engine.next_frame().unwrap(), Some(Bytes::from_static(&[2, b'd', b'e'])));
    }

    #[test]
    fn marker_length_bounds() {
        assert!(FramingConfig::eof(&b""[..], true).is_err());
        assert!(FramingConfig::eof(&b"123456789"[..], true).is_err());
        assert!(FramingConfig::eof(&b"12345678"[..], true).is_ok());
    }
}
