use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::seq_num::SeqNum;

/// fixed header size on the wire
pub const HEADER_LEN: usize = 10;
/// fixed payload size on the wire - shorter payloads are zero-padded, the
///  `length` header field says how many bytes are meaningful
pub const PAYLOAD_LEN: usize = 1008;
/// every segment has this exact size on the wire
pub const SEGMENT_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

const CHECKSUM_OFFSET: usize = 8;

bitflags! {
    /// The flag byte at offset 4 of the header. Only the low three bits are
    ///  assigned, decoding silently drops anything else.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        const SYN = 0b100;
        const ACK = 0b010;
        const FIN = 0b001;
    }
}

/// Mutually exclusive classification of a flag combination, in the shape the
///  receiver-side state machine consumes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
    /// no flags at all: a regular data segment
    Data,
}

impl SegmentFlags {
    pub fn kind(self) -> SegmentKind {
        let syn = self.contains(SegmentFlags::SYN);
        let ack = self.contains(SegmentFlags::ACK);
        let fin = self.contains(SegmentFlags::FIN);

        // nonsensical combinations (e.g. SYN+FIN) classify by the dominant flag
        match (syn, ack, fin) {
            (true, true, _) => SegmentKind::SynAck,
            (true, false, _) => SegmentKind::Syn,
            (false, true, true) => SegmentKind::FinAck,
            (false, true, false) => SegmentKind::Ack,
            (false, false, true) => SegmentKind::Fin,
            (false, false, false) => SegmentKind::Data,
        }
    }
}

/// One's complement checksum over consecutive big-endian 16-bit words with
///  end-around carry (any overflow past 16 bits is folded back into the low
///  bits after every addition).
///
/// Segments always have an even number of bytes; a trailing odd byte is
///  treated as the high byte of a zero-padded word anyway. The checksum of an
///  empty input is defined as 0x0000 and signals "no meaningful request" - it
///  is never a valid segment checksum.
pub fn checksum(data: &[u8]) -> u16 {
    if data.is_empty() {
        return 0;
    }

    let mut sum = 0u32;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let Some(&last) = words.remainder().first() {
        sum += (last as u32) << 8;
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Computes the checksum over the segment with the checksum field treated as
///  zero, and patches the result into the checksum field. This is the second
///  pass of the two-pass segment build: serialize with checksum 0, then
///  finalize.
pub fn init_checksum(segment: &mut [u8]) {
    assert!(segment.len() >= HEADER_LEN);

    segment[CHECKSUM_OFFSET] = 0;
    segment[CHECKSUM_OFFSET + 1] = 0;
    let sum = checksum(segment);
    segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
}

/// Verification contract for every inbound segment: recompute the checksum
///  with the checksum field zeroed and compare against the transmitted value.
///  Returns false for anything too short to carry a header.
///
/// No header field may be trusted before this returns true.
pub fn verify_checksum(segment: &[u8]) -> bool {
    if segment.len() < HEADER_LEN {
        return false;
    }

    let transmitted = u16::from_be_bytes([segment[CHECKSUM_OFFSET], segment[CHECKSUM_OFFSET + 1]]);
    let mut scratch = segment.to_vec();
    scratch[CHECKSUM_OFFSET] = 0;
    scratch[CHECKSUM_OFFSET + 1] = 0;
    checksum(&scratch) == transmitted
}

/// The fixed-layout segment header, all fields big-endian on the wire:
///
/// ```ascii
/// offset 0: seqnum   (u16)
/// offset 2: acknum   (u16)
/// offset 4: flags    (u8: bit2=SYN bit1=ACK bit0=FIN)
/// offset 5: window   (u8)
/// offset 6: length   (u16) - meaningful payload bytes, the rest is padding
/// offset 8: checksum (u16)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq_num: SeqNum,
    pub ack_num: SeqNum,
    pub flags: SegmentFlags,
    pub window: u8,
    pub length: u16,
    pub checksum: u16,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize = HEADER_LEN;

    /// header for a segment without payload (handshake / teardown / ack)
    pub fn control(seq_num: SeqNum, ack_num: SeqNum, flags: SegmentFlags, window: u8) -> SegmentHeader {
        SegmentHeader {
            seq_num,
            ack_num,
            flags,
            window,
            length: 0,
            checksum: 0,
        }
    }

    /// header for a regular data segment (no flags set)
    pub fn data(seq_num: SeqNum, ack_num: SeqNum, window: u8, length: u16) -> SegmentHeader {
        SegmentHeader {
            seq_num,
            ack_num,
            flags: SegmentFlags::empty(),
            window,
            length,
            checksum: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.seq_num.to_raw());
        buf.put_u16(self.ack_num.to_raw());
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.window);
        buf.put_u16(self.length);
        buf.put_u16(self.checksum);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("segment header truncated: {} bytes", buf.remaining());
        }

        let seq_num = SeqNum::from_raw(buf.get_u16());
        let ack_num = SeqNum::from_raw(buf.get_u16());
        let flags = SegmentFlags::from_bits_truncate(buf.get_u8());
        let window = buf.get_u8();
        let length = buf.get_u16();
        let checksum = buf.get_u16();

        Ok(SegmentHeader {
            seq_num,
            ack_num,
            flags,
            window,
            length,
            checksum,
        })
    }
}

/// Serializes header plus payload, zero-padded to the fixed segment size. The
///  checksum field is left at zero - `SendPipeline::finalize_and_send` (or an
///  explicit `init_checksum`) fills it in just before the segment hits the
///  wire.
pub fn build_segment(header: &SegmentHeader, payload: &[u8]) -> BytesMut {
    debug_assert!(payload.len() <= PAYLOAD_LEN);
    debug_assert!(header.length as usize == payload.len());

    let mut buf = BytesMut::with_capacity(SEGMENT_LEN);
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf.resize(SEGMENT_LEN, 0);
    buf
}
