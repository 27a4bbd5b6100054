//! # RTCM3 Stream Framer
//!
//! Pure buffering and parsing state machine for the station byte stream. It owns
//! a single `BytesMut` buffer that only grows at the tail (`append`) and only
//! shrinks at the head (skipped noise, consumed frames). No I/O happens here and
//! nothing is logged: every discard is surfaced as a [`ParseEvent`] so the
//! connection that drives the parser can decide what to report.
//!
//! ## Wire Layout
//!
//! ```text
//! +------+--------+----------+-----------------+-----------+
//! | 0xD3 | 6 bits | 10 bits  | payload (L)     | CRC-24Q   |
//! |      | zero   | length L | type = 12 bits  | 3 bytes   |
//! +------+--------+----------+-----------------+-----------+
//! ```
//!
//! A frame is `L + 6` bytes. The trailer is validated with CRC-24Q; a mismatch
//! or non-zero reserved bits is treated as a desync: the preamble byte is dropped
//! and the scan resumes at the next candidate preamble.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use bytes::{Buf, Bytes, BytesMut};
use crc::{Crc, CRC_24_LTE_A};

/// Frame-start marker byte.
pub const PREAMBLE: u8 = 0xD3;
/// Preamble plus reserved bits plus 10-bit length.
pub const HEADER_SIZE: usize = 3;
/// CRC-24Q trailer.
pub const TRAILER_SIZE: usize = 3;
/// Largest payload a 10-bit length field can declare.
pub const MAX_PAYLOAD_LEN: usize = 1023;

const CRC24Q: Crc<u32> = Crc::<u32>::new(&CRC_24_LTE_A);

/// Computes the CRC-24Q checksum used by the RTCM3 transport layer.
pub fn crc24q(data: &[u8]) -> u32 {
    CRC24Q.checksum(data)
}

/// # Frame
///
/// One complete, CRC-validated message. The full wire bytes are kept because
/// downstream consumers receive them untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    msg_type: u16,
    raw: Bytes,
}

impl Frame {
    /// The 12-bit message type number carried in the first payload bits.
    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    /// The message body, without header or CRC trailer.
    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..self.raw.len() - TRAILER_SIZE]
    }

    /// Header + payload + trailer, exactly as received.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Length of the frame on the wire.
    pub fn total_length(&self) -> usize {
        self.raw.len()
    }

    /// Consumes the frame, returning its wire bytes.
    pub fn into_raw(self) -> Bytes {
        self.raw
    }
}

/// Encodes `payload` into a complete RTCM3 frame.
///
/// Returns `None` if the payload does not fit the 10-bit length field. Used by
/// tests and by tools that need to inject well-formed frames.
pub fn encode_frame(payload: &[u8]) -> Option<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }
    let mut out = BytesMut::with_capacity(payload.len() + HEADER_SIZE + TRAILER_SIZE);
    out.extend_from_slice(&[
        PREAMBLE,
        ((payload.len() >> 8) & 0x03) as u8,
        (payload.len() & 0xFF) as u8,
    ]);
    out.extend_from_slice(payload);
    let crc = crc24q(&out);
    out.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
    Some(out.freeze())
}

fn decode_msg_type(payload: &[u8]) -> u16 {
    match payload {
        [first, second, ..] => ((*first as u16) << 4) | ((*second as u16) >> 4),
        _ => 0,
    }
}

/// # Filter Specification
///
/// Which message types are forwarded. `Unfiltered` and `AllowAll` behave the
/// same; they only differ in how they were configured (no `filter` key versus
/// an explicit empty list).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FilterSpec {
    /// No filter configured: every frame passes.
    #[default]
    Unfiltered,
    /// Explicit empty allow-list: every frame passes.
    AllowAll,
    /// Only the listed message types pass.
    AllowSet(HashSet<u16>),
}

impl FilterSpec {
    /// Builds the filter from the configuration encoding: `None` means no
    /// filter, `Some([])` allows everything, anything else is an allow-set.
    pub fn from_config(filter: Option<&[u16]>) -> Self {
        match filter {
            None => FilterSpec::Unfiltered,
            Some([]) => FilterSpec::AllowAll,
            Some(types) => FilterSpec::AllowSet(types.iter().copied().collect()),
        }
    }

    /// Returns true if frames of `msg_type` should be forwarded.
    pub fn is_accepted(&self, msg_type: u16) -> bool {
        match self {
            FilterSpec::Unfiltered | FilterSpec::AllowAll => true,
            FilterSpec::AllowSet(types) => types.contains(&msg_type),
        }
    }
}

/// Why a candidate frame at the head of the buffer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The 6 reserved header bits were not zero.
    ReservedBits,
    /// The CRC-24Q trailer did not match.
    CrcMismatch,
}

/// One step of parser progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A frame that passed the filter.
    Frame(Frame),
    /// A structurally valid frame whose type the filter rejected. It has been
    /// consumed from the buffer.
    Filtered(Frame),
    /// Bytes before the next preamble (or the whole buffer if none) were
    /// discarded.
    Skipped(usize),
    /// A preamble byte was dropped because the frame it started was invalid.
    Corrupt(Corruption),
}

/// Counters kept across the lifetime of one parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Frames handed out as accepted.
    pub frames: u64,
    /// Frames consumed but rejected by the filter.
    pub filtered: u64,
    /// Bytes discarded as noise or as corrupt preambles.
    pub discarded_bytes: u64,
    /// Corrupt frame starts encountered.
    pub corrupt: u64,
}

/// # Frame Parser
///
/// Accumulates reads of arbitrary size and extracts frames as soon as they are
/// complete. Frames split across reads are held until the remaining bytes
/// arrive; the buffer is never truncated speculatively.
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    filter: FilterSpec,
    stats: ParserStats,
}

impl FrameParser {
    /// Creates a parser with an empty buffer.
    pub fn new(filter: FilterSpec) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            filter,
            stats: ParserStats::default(),
        }
    }

    /// Appends newly read bytes at the tail of the buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drops the oldest bytes so that at most `keep` remain. The next poll
    /// resynchronizes on a preamble. Returns how many bytes were dropped.
    pub fn discard_oldest(&mut self, keep: usize) -> usize {
        let excess = self.buffer.len().saturating_sub(keep);
        if excess > 0 {
            self.buffer.advance(excess);
            self.stats.discarded_bytes += excess as u64;
        }
        excess
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// The filter this parser was built with.
    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    /// Extracts the next accepted frame, silently consuming noise, corrupt
    /// starts and filtered frames on the way. Returns `None` once more data is
    /// needed; call it until it does.
    pub fn try_extract_frame(&mut self) -> Option<Frame> {
        loop {
            match self.poll()? {
                ParseEvent::Frame(frame) => return Some(frame),
                ParseEvent::Filtered(_) | ParseEvent::Skipped(_) | ParseEvent::Corrupt(_) => {}
            }
        }
    }

    /// Performs a single parsing step. Returns `None` when the buffer holds no
    /// complete frame and nothing can be discarded.
    pub fn poll(&mut self) -> Option<ParseEvent> {
        if self.buffer.is_empty() {
            return None;
        }

        match self.buffer.iter().position(|&b| b == PREAMBLE) {
            None => {
                let skipped = self.buffer.len();
                self.buffer.clear();
                self.stats.discarded_bytes += skipped as u64;
                return Some(ParseEvent::Skipped(skipped));
            }
            Some(offset) if offset > 0 => {
                self.buffer.advance(offset);
                self.stats.discarded_bytes += offset as u64;
                return Some(ParseEvent::Skipped(offset));
            }
            Some(_) => {}
        }

        if self.buffer.len() < HEADER_SIZE {
            return None;
        }

        if self.buffer[1] & 0xFC != 0 {
            return Some(self.drop_preamble(Corruption::ReservedBits));
        }

        let payload_len = (((self.buffer[1] & 0x03) as usize) << 8) | self.buffer[2] as usize;
        let total = payload_len + HEADER_SIZE + TRAILER_SIZE;
        if self.buffer.len() < total {
            return None;
        }

        let body_end = HEADER_SIZE + payload_len;
        let expected = ((self.buffer[body_end] as u32) << 16)
            | ((self.buffer[body_end + 1] as u32) << 8)
            | self.buffer[body_end + 2] as u32;
        if crc24q(&self.buffer[..body_end]) != expected {
            return Some(self.drop_preamble(Corruption::CrcMismatch));
        }

        let raw = self.buffer.split_to(total).freeze();
        let msg_type = decode_msg_type(&raw[HEADER_SIZE..body_end]);
        let frame = Frame { msg_type, raw };

        if self.filter.is_accepted(msg_type) {
            self.stats.frames += 1;
            Some(ParseEvent::Frame(frame))
        } else {
            self.stats.filtered += 1;
            Some(ParseEvent::Filtered(frame))
        }
    }

    fn drop_preamble(&mut self, reason: Corruption) -> ParseEvent {
        self.buffer.advance(1);
        self.stats.discarded_bytes += 1;
        self.stats.corrupt += 1;
        ParseEvent::Corrupt(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Builds a payload whose first 12 bits carry `msg_type`, padded to `len`.
    fn payload_for(msg_type: u16, len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len.max(2)];
        payload[0] = (msg_type >> 4) as u8;
        payload[1] = ((msg_type & 0x0F) << 4) as u8 | 0x05;
        for (i, byte) in payload.iter_mut().enumerate().skip(2) {
            *byte = (i * 7 % 251) as u8;
        }
        payload
    }

    fn frame_bytes(msg_type: u16, len: usize) -> Bytes {
        encode_frame(&payload_for(msg_type, len)).unwrap()
    }

    fn drain(parser: &mut FrameParser) -> Vec<Frame> {
        std::iter::from_fn(|| parser.try_extract_frame()).collect()
    }

    #[test]
    fn crc24q_matches_reference_check_value() {
        assert_eq!(crc24q(b"123456789"), 0xCD_E703);
        assert_eq!(crc24q(&[]), 0);
    }

    #[test]
    fn corrupted_trailer_byte_is_rejected() {
        let mut bytes = frame_bytes(1005, 19).to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&bytes);
        assert!(parser.try_extract_frame().is_none());
    }

    #[test]
    fn extracts_single_frame_all_at_once() {
        let bytes = frame_bytes(1005, 19);
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&bytes);

        let frame = parser.try_extract_frame().unwrap();
        assert_eq!(frame.msg_type(), 1005);
        assert_eq!(frame.total_length(), 19 + 6);
        assert_eq!(frame.raw(), &bytes);
        assert_eq!(frame.payload(), &payload_for(1005, 19)[..]);
        assert!(parser.try_extract_frame().is_none());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn discard_oldest_keeps_the_tail_and_resyncs() {
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&frame_bytes(1005, 40));
        parser.append(&frame_bytes(1077, 10));
        let tail = frame_bytes(1077, 10).len();

        // Cut inside the first frame: its remainder is noise.
        assert_eq!(parser.discard_oldest(tail + 5), 40 + 6 - 5);
        assert_eq!(parser.buffered(), tail + 5);
        assert_eq!(parser.discard_oldest(1_000), 0);

        let frames = drain(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type(), 1077);
    }

    #[test]
    fn waits_for_header_and_body() {
        let bytes = frame_bytes(1077, 40);
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);

        parser.append(&bytes[..2]);
        assert!(parser.try_extract_frame().is_none());
        assert_eq!(parser.buffered(), 2);

        parser.append(&bytes[2..30]);
        assert!(parser.try_extract_frame().is_none());
        assert_eq!(parser.buffered(), 30, "partial frame must stay buffered");

        parser.append(&bytes[30..]);
        assert_eq!(parser.try_extract_frame().unwrap().msg_type(), 1077);
    }

    #[test]
    fn back_to_back_frames_in_one_read() {
        let mut stream = Vec::new();
        for msg_type in [1005u16, 1074, 1084, 1230] {
            stream.extend_from_slice(&frame_bytes(msg_type, 12));
        }
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&stream);

        let types: Vec<u16> = drain(&mut parser).iter().map(Frame::msg_type).collect();
        assert_eq!(types, vec![1005, 1074, 1084, 1230]);
    }

    #[test]
    fn garbage_without_marker_is_discarded_then_frame_parses() {
        let garbage = vec![0x41u8; 37];
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&garbage);

        assert_eq!(parser.poll(), Some(ParseEvent::Skipped(37)));
        assert!(parser.poll().is_none());

        parser.append(&frame_bytes(1019, 8));
        assert_eq!(drain(&mut parser).len(), 1);
        assert_eq!(parser.stats().discarded_bytes, 37);
    }

    #[test]
    fn leading_noise_before_marker_is_skipped() {
        let mut stream = b"hello station".to_vec();
        stream.extend_from_slice(&frame_bytes(1033, 10));
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&stream);

        assert_eq!(parser.poll(), Some(ParseEvent::Skipped(13)));
        assert!(matches!(parser.poll(), Some(ParseEvent::Frame(f)) if f.msg_type() == 1033));
    }

    #[test]
    fn corrupt_crc_resyncs_on_next_frame() {
        let mut bad = frame_bytes(1005, 10).to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = frame_bytes(1006, 10);

        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&bad);
        parser.append(&good);

        assert_eq!(parser.poll(), Some(ParseEvent::Corrupt(Corruption::CrcMismatch)));
        let frames = drain(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type(), 1006);
        assert_eq!(parser.stats().corrupt, 1);
    }

    #[test]
    fn reserved_bits_set_is_a_desync() {
        let mut parser = FrameParser::new(FilterSpec::Unfiltered);
        parser.append(&[PREAMBLE, 0xFC, 0x00]);
        assert_eq!(parser.poll(), Some(ParseEvent::Corrupt(Corruption::ReservedBits)));
        assert_eq!(parser.buffered(), 2);
    }

    #[test]
    fn allow_set_consumes_but_hides_other_types() {
        let mut stream = Vec::new();
        for msg_type in [1005u16, 1004, 1077, 1004] {
            stream.extend_from_slice(&frame_bytes(msg_type, 16));
        }
        let filter = FilterSpec::from_config(Some(&[1005, 1077]));
        let mut parser = FrameParser::new(filter);
        parser.append(&stream);

        let types: Vec<u16> = drain(&mut parser).iter().map(Frame::msg_type).collect();
        assert_eq!(types, vec![1005, 1077]);
        assert_eq!(parser.buffered(), 0);
        assert_eq!(parser.stats().filtered, 2);
    }

    #[test]
    fn filtered_frame_is_reported_as_event() {
        let mut parser = FrameParser::new(FilterSpec::from_config(Some(&[1005])));
        parser.append(&frame_bytes(1004, 16));
        assert!(matches!(parser.poll(), Some(ParseEvent::Filtered(f)) if f.msg_type() == 1004));
    }

    #[test]
    fn filter_config_variants() {
        assert_eq!(FilterSpec::from_config(None), FilterSpec::Unfiltered);
        assert_eq!(FilterSpec::from_config(Some(&[])), FilterSpec::AllowAll);
        assert!(FilterSpec::AllowAll.is_accepted(1004));
        assert!(FilterSpec::Unfiltered.is_accepted(4094));
        assert!(!FilterSpec::from_config(Some(&[1005])).is_accepted(1004));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD_LEN + 1]).is_none());
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD_LEN]).is_some());
    }

    proptest! {
        #[test]
        fn any_partition_yields_the_same_single_frame(
            msg_type in 1u16..4095,
            len in 2usize..300,
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let bytes = frame_bytes(msg_type, len);
            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len())).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut parser = FrameParser::new(FilterSpec::Unfiltered);
            let mut frames = Vec::new();
            for window in points.windows(2) {
                parser.append(&bytes[window[0]..window[1]]);
                frames.extend(drain(&mut parser));
            }

            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames[0].msg_type(), msg_type);
            prop_assert_eq!(frames[0].payload(), &payload_for(msg_type, len)[..]);
        }
    }
}
