use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use crate::error::{Result, RudpError};
use crate::profile::RudpProfile;
use crate::seq::SequenceNumber;

/// Fixed RUDP header length in octets.
pub const RUDP_HEADER_LEN: usize = 6;
/// Length of a SYN header including the parameter block.
pub const SYN_HEADER_LEN: usize = RUDP_HEADER_LEN + 16;
pub const RUDP_VERSION: u8 = 1;

bitflags! {
    /// The flag byte of the RUDP header, MSB first.
    ///
    /// ```ascii
    ///  0 1 2 3 4 5 6 7 8            15
    /// +-+-+-+-+-+-+-+-+---------------+
    /// |S|A|E|R|N|C| | |    Header     |
    /// |Y|C|A|S|U|H|0|0|    Length     |
    /// |N|K|K|T|L|K| | |               |
    /// +-+-+-+-+-+-+-+-+---------------+
    /// |  Sequence #   +   Ack Number  |
    /// +---------------+---------------+
    /// |            Checksum           |
    /// +---------------+---------------+
    /// ```
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct SegmentFlags: u8 {
        const SYN = 0x80;
        const ACK = 0x40;
        const EAK = 0x20;
        const RST = 0x10;
        const NUL = 0x08;
        const CHK = 0x04;
        const FIN = 0x02;
    }
}

/// The connection parameters offered in a SYN segment.
///
/// Sixteen octets following the fixed header (and counted as header by the
/// header-length field): version, window size, option flags, a spare octet,
/// then the timer and counter parameters of the profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SynParams {
    pub max_outstanding_segs: u8,
    pub option_flags: u8,
    pub max_segment_size: u16,
    pub retransmission_timeout: u16,
    pub cumulative_ack_timeout: u16,
    pub null_segment_timeout: u16,
    pub max_retrans: u8,
    pub max_cumulative_acks: u8,
    pub max_out_of_sequence: u8,
    pub max_auto_reset: u8,
}

impl SynParams {
    pub fn from_profile(profile: &RudpProfile) -> SynParams {
        SynParams {
            max_outstanding_segs: profile.max_outstanding_segs(),
            option_flags: 0,
            max_segment_size: profile.max_segment_size(),
            retransmission_timeout: profile.retransmission_timeout(),
            cumulative_ack_timeout: profile.cumulative_ack_timeout(),
            null_segment_timeout: profile.null_segment_timeout(),
            max_retrans: profile.max_retrans(),
            max_cumulative_acks: profile.max_cumulative_acks(),
            max_out_of_sequence: profile.max_out_of_sequence(),
            max_auto_reset: profile.max_auto_reset(),
        }
    }

    /// Builds the profile a connection adopts when accepting this offer.
    /// Queue sizes are not negotiated and are taken from `local`.
    pub fn into_profile(&self, local: &RudpProfile) -> Result<RudpProfile> {
        RudpProfile::new(
            local.max_send_queue_size(),
            local.max_recv_queue_size(),
            self.max_segment_size,
            self.max_outstanding_segs,
            self.max_retrans,
            self.max_cumulative_acks,
            self.max_out_of_sequence,
            self.max_auto_reset,
            self.null_segment_timeout,
            self.retransmission_timeout,
            self.cumulative_ack_timeout,
        )
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(RUDP_VERSION << 4);
        buf.put_u8(self.max_outstanding_segs);
        buf.put_u8(self.option_flags);
        buf.put_u8(0); // spare
        buf.put_u16(self.max_segment_size);
        buf.put_u16(self.retransmission_timeout);
        buf.put_u16(self.cumulative_ack_timeout);
        buf.put_u16(self.null_segment_timeout);
        buf.put_u8(self.max_retrans);
        buf.put_u8(self.max_cumulative_acks);
        buf.put_u8(self.max_out_of_sequence);
        buf.put_u8(self.max_auto_reset);
    }

    fn parse(body: &[u8]) -> Result<SynParams> {
        if body.len() < 16 {
            return Err(RudpError::Malformed("truncated SYN parameter block"));
        }
        if body[0] >> 4 != RUDP_VERSION {
            return Err(RudpError::Malformed("unsupported RUDP version"));
        }
        Ok(SynParams {
            max_outstanding_segs: body[1],
            option_flags: body[2],
            max_segment_size: u16::from_be_bytes([body[4], body[5]]),
            retransmission_timeout: u16::from_be_bytes([body[6], body[7]]),
            cumulative_ack_timeout: u16::from_be_bytes([body[8], body[9]]),
            null_segment_timeout: u16::from_be_bytes([body[10], body[11]]),
            max_retrans: body[12],
            max_cumulative_acks: body[13],
            max_out_of_sequence: body[14],
            max_auto_reset: body[15],
        })
    }
}

/// A single RUDP segment, dispatched by its flag byte.
///
/// `ack` is present iff the ACK flag is set on the wire. DAT and EAK always
/// carry a cumulative ack; the others may piggyback one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Syn {
        seq: SequenceNumber,
        ack: Option<SequenceNumber>,
        params: SynParams,
    },
    Ack {
        seq: SequenceNumber,
        ack: SequenceNumber,
    },
    Eak {
        seq: SequenceNumber,
        ack: SequenceNumber,
        out_of_seq: Vec<SequenceNumber>,
    },
    Rst {
        seq: SequenceNumber,
        ack: Option<SequenceNumber>,
    },
    Nul {
        seq: SequenceNumber,
        ack: Option<SequenceNumber>,
    },
    Fin {
        seq: SequenceNumber,
        ack: Option<SequenceNumber>,
    },
    Dat {
        seq: SequenceNumber,
        ack: SequenceNumber,
        payload: Vec<u8>,
    },
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.ack() {
            Some(ack) => write!(f, "{} [ SEQ = {}, ACK = {} ]", self.type_name(), self.seq(), ack),
            None => write!(f, "{} [ SEQ = {}, ACK = N/A ]", self.type_name(), self.seq()),
        }
    }
}

impl Segment {
    pub fn type_name(&self) -> &'static str {
        match self {
            Segment::Syn { .. } => "SYN",
            Segment::Ack { .. } => "ACK",
            Segment::Eak { .. } => "EAK",
            Segment::Rst { .. } => "RST",
            Segment::Nul { .. } => "NUL",
            Segment::Fin { .. } => "FIN",
            Segment::Dat { .. } => "DAT",
        }
    }

    pub fn seq(&self) -> SequenceNumber {
        match self {
            Segment::Syn { seq, .. }
            | Segment::Ack { seq, .. }
            | Segment::Eak { seq, .. }
            | Segment::Rst { seq, .. }
            | Segment::Nul { seq, .. }
            | Segment::Fin { seq, .. }
            | Segment::Dat { seq, .. } => *seq,
        }
    }

    pub fn ack(&self) -> Option<SequenceNumber> {
        match self {
            Segment::Syn { ack, .. }
            | Segment::Rst { ack, .. }
            | Segment::Nul { ack, .. }
            | Segment::Fin { ack, .. } => *ack,
            Segment::Ack { ack, .. } | Segment::Eak { ack, .. } | Segment::Dat { ack, .. } => {
                Some(*ack)
            }
        }
    }

    /// `true` for the variants that consume a sequence number and therefore
    /// take part in the retransmission discipline.
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            Segment::Syn { .. } | Segment::Nul { .. } | Segment::Fin { .. } | Segment::Dat { .. }
        )
    }

    pub fn flags(&self) -> SegmentFlags {
        let variant = match self {
            Segment::Syn { .. } => SegmentFlags::SYN,
            Segment::Ack { .. } => SegmentFlags::ACK,
            Segment::Eak { .. } => SegmentFlags::EAK,
            Segment::Rst { .. } => SegmentFlags::RST,
            Segment::Nul { .. } => SegmentFlags::NUL,
            Segment::Fin { .. } => SegmentFlags::FIN,
            Segment::Dat { .. } => SegmentFlags::empty(),
        };
        if self.ack().is_some() {
            variant | SegmentFlags::ACK
        } else {
            variant
        }
    }

    fn header_length(&self) -> usize {
        match self {
            Segment::Syn { .. } => SYN_HEADER_LEN,
            Segment::Eak { out_of_seq, .. } => RUDP_HEADER_LEN + out_of_seq.len(),
            _ => RUDP_HEADER_LEN,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags().bits());
        buf.put_u8(self.header_length() as u8);
        buf.put_u8(self.seq().to_raw());
        buf.put_u8(self.ack().map(SequenceNumber::to_raw).unwrap_or(0));
        buf.put_u16(0); // checksum: CHK is reserved, written as zero

        match self {
            Segment::Syn { params, .. } => params.ser(buf),
            Segment::Eak { out_of_seq, .. } => {
                for seq in out_of_seq {
                    buf.put_u8(seq.to_raw());
                }
            }
            Segment::Dat { payload, .. } => buf.put_slice(payload),
            _ => {}
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header_length() + 128);
        self.ser(&mut buf);
        buf
    }

    /// Parses one segment from `bytes[off..off + len]`.
    ///
    /// Dispatch order is SYN, NUL, EAK, RST, FIN, then ACK vs DAT by length;
    /// exactly one variant is selected. A flag byte carrying none of those
    /// bits is malformed.
    pub fn parse(bytes: &[u8], off: usize, len: usize) -> Result<Segment> {
        if len < RUDP_HEADER_LEN || off + len > bytes.len() {
            return Err(RudpError::Malformed("segment shorter than header"));
        }
        let bytes = &bytes[off..off + len];

        let flags = SegmentFlags::from_bits_retain(bytes[0]);
        let hlen = bytes[1] as usize;
        let seq = SequenceNumber::from_raw(bytes[2]);
        // the ack number field is only meaningful with the ACK flag
        let ack = if flags.contains(SegmentFlags::ACK) {
            Some(SequenceNumber::from_raw(bytes[3]))
        } else {
            None
        };

        if hlen < RUDP_HEADER_LEN || hlen > len {
            return Err(RudpError::Malformed("header length out of bounds"));
        }

        if flags.contains(SegmentFlags::SYN) {
            let params = SynParams::parse(&bytes[RUDP_HEADER_LEN..hlen])?;
            Ok(Segment::Syn { seq, ack, params })
        } else if flags.contains(SegmentFlags::NUL) {
            Ok(Segment::Nul { seq, ack })
        } else if flags.contains(SegmentFlags::EAK) {
            let ack = ack.ok_or(RudpError::Malformed("extended ack without cumulative ack"))?;
            let out_of_seq = bytes[RUDP_HEADER_LEN..hlen]
                .iter()
                .map(|&raw| SequenceNumber::from_raw(raw))
                .collect();
            Ok(Segment::Eak { seq, ack, out_of_seq })
        } else if flags.contains(SegmentFlags::RST) {
            Ok(Segment::Rst { seq, ack })
        } else if flags.contains(SegmentFlags::FIN) {
            Ok(Segment::Fin { seq, ack })
        } else if flags.contains(SegmentFlags::ACK) {
            if len == RUDP_HEADER_LEN {
                Ok(Segment::Ack { seq, ack: ack.expect("ACK flag checked above") })
            } else {
                Ok(Segment::Dat {
                    seq,
                    ack: ack.expect("ACK flag checked above"),
                    payload: bytes[hlen..].to_vec(),
                })
            }
        } else {
            Err(RudpError::Malformed("no recognized flag set"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sn(raw: u8) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn default_params() -> SynParams {
        SynParams::from_profile(&RudpProfile::default())
    }

    #[rstest]
    #[case::syn(Segment::Syn { seq: sn(0), ack: None, params: default_params() })]
    #[case::syn_ack(Segment::Syn { seq: sn(0), ack: Some(sn(0)), params: default_params() })]
    #[case::ack(Segment::Ack { seq: sn(7), ack: sn(3) })]
    #[case::eak(Segment::Eak { seq: sn(7), ack: sn(3), out_of_seq: vec![sn(5), sn(6)] })]
    #[case::eak_empty(Segment::Eak { seq: sn(7), ack: sn(3), out_of_seq: vec![] })]
    #[case::rst(Segment::Rst { seq: sn(9), ack: None })]
    #[case::nul(Segment::Nul { seq: sn(200), ack: Some(sn(199)) })]
    #[case::fin(Segment::Fin { seq: sn(255), ack: Some(sn(12)) })]
    #[case::dat(Segment::Dat { seq: sn(1), ack: sn(0), payload: vec![1, 2, 3] })]
    #[case::dat_wrap(Segment::Dat { seq: sn(255), ack: sn(254), payload: vec![0xff; 100] })]
    fn test_round_trip(#[case] original: Segment) {
        let buf = original.to_bytes();
        let parsed = Segment::parse(&buf, 0, buf.len()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_dat_wire_layout() {
        let seg = Segment::Dat { seq: sn(5), ack: sn(4), payload: vec![0xab, 0xcd] };
        let buf = seg.to_bytes();
        assert_eq!(buf.as_ref(), &[0x40, 6, 5, 4, 0, 0, 0xab, 0xcd]);
    }

    #[test]
    fn test_syn_wire_layout() {
        let seg = Segment::Syn { seq: sn(0), ack: None, params: default_params() };
        let buf = seg.to_bytes();
        assert_eq!(buf.len(), SYN_HEADER_LEN);
        assert_eq!(&buf[..6], &[0x80, 22, 0, 0, 0, 0]);
        assert_eq!(buf[6], RUDP_VERSION << 4);
        // max_segment_size 128 big-endian
        assert_eq!(&buf[10..12], &[0, 128]);
    }

    #[test]
    fn test_eak_wire_layout() {
        let seg = Segment::Eak { seq: sn(2), ack: sn(1), out_of_seq: vec![sn(3), sn(5)] };
        let buf = seg.to_bytes();
        assert_eq!(buf.as_ref(), &[0x60, 8, 2, 1, 0, 0, 3, 5]);
    }

    #[test]
    fn test_parse_with_offset() {
        let seg = Segment::Ack { seq: sn(1), ack: sn(0) };
        let mut datagram = vec![0xee, 0xee];
        datagram.extend_from_slice(&seg.to_bytes());
        let parsed = Segment::parse(&datagram, 2, RUDP_HEADER_LEN).unwrap();
        assert_eq!(parsed, seg);
    }

    #[rstest]
    #[case::too_short(vec![0x40, 6, 0, 0, 0])]
    #[case::no_flags(vec![0x00, 6, 0, 0, 0, 0])]
    #[case::only_chk(vec![0x04, 6, 0, 0, 0, 0])]
    #[case::hlen_below_minimum(vec![0x40, 5, 0, 0, 0, 0, 1])]
    #[case::hlen_beyond_segment(vec![0x60, 9, 0, 0, 0, 0, 1])]
    #[case::syn_truncated(vec![0x80, 22, 0, 0, 0, 0, 0x10, 3])]
    fn test_malformed(#[case] bytes: Vec<u8>) {
        let len = bytes.len();
        assert!(matches!(Segment::parse(&bytes, 0, len), Err(RudpError::Malformed(_))));
    }

    #[test]
    fn test_dispatch_priority_syn_wins() {
        // SYN|ACK with a payload-sized body must parse as SYN, not DAT
        let seg = Segment::Syn { seq: sn(0), ack: Some(sn(0)), params: default_params() };
        let buf = seg.to_bytes();
        assert!(matches!(Segment::parse(&buf, 0, buf.len()).unwrap(), Segment::Syn { .. }));
    }

    #[test]
    fn test_ack_number_ignored_without_ack_flag() {
        // RST with a stale value in the ack field: parsed ack must be absent
        let bytes = [0x10, 6, 9, 77, 0, 0];
        match Segment::parse(&bytes, 0, 6).unwrap() {
            Segment::Rst { seq, ack } => {
                assert_eq!(seq, sn(9));
                assert_eq!(ack, None);
            }
            other => panic!("unexpected segment: {other}"),
        }
    }

    #[test]
    fn test_checksum_is_pass_through() {
        // nonzero checksum bytes are accepted and ignored
        let bytes = [0x40 | 0x04, 6, 1, 0, 0xde, 0xad];
        assert!(matches!(Segment::parse(&bytes, 0, 6), Ok(Segment::Ack { .. })));
    }

    #[test]
    fn test_syn_params_adopt_offer() {
        let local = RudpProfile::default();
        let offer = SynParams {
            max_outstanding_segs: 5,
            option_flags: 0,
            max_segment_size: 256,
            retransmission_timeout: 400,
            cumulative_ack_timeout: 200,
            null_segment_timeout: 1000,
            max_retrans: 7,
            max_cumulative_acks: 2,
            max_out_of_sequence: 4,
            max_auto_reset: 3,
        };
        let adopted = offer.into_profile(&local).unwrap();
        assert_eq!(adopted.max_outstanding_segs(), 5);
        assert_eq!(adopted.max_segment_size(), 256);
        assert_eq!(adopted.retransmission_timeout(), 400);
        // queue sizes are not negotiated
        assert_eq!(adopted.max_send_queue_size(), local.max_send_queue_size());
    }

    #[test]
    fn test_syn_params_bad_offer_is_config_error() {
        let offer = SynParams {
            max_outstanding_segs: 0,
            option_flags: 0,
            max_segment_size: 128,
            retransmission_timeout: 600,
            cumulative_ack_timeout: 300,
            null_segment_timeout: 2000,
            max_retrans: 0,
            max_cumulative_acks: 3,
            max_out_of_sequence: 3,
            max_auto_reset: 3,
        };
        assert!(matches!(
            offer.into_profile(&RudpProfile::default()),
            Err(RudpError::Config { field: "max_outstanding_segs", .. })
        ));
    }
}
