use crate::error::{Result, RudpError};
use crate::segment::RUDP_HEADER_LEN;

/// The RUDP parameters of a connection. Immutable once constructed; every
/// field is validated against its protocol range.
///
/// The server side adopts the parameters offered in the client's SYN, so a
/// profile configured on a listener only governs connections until their
/// handshake completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RudpProfile {
    max_send_queue_size: u8,
    max_recv_queue_size: u8,
    max_segment_size: u16,
    max_outstanding_segs: u8,
    max_retrans: u8,
    max_cumulative_acks: u8,
    max_out_of_sequence: u8,
    max_auto_reset: u8,
    null_segment_timeout: u16,
    retransmission_timeout: u16,
    cumulative_ack_timeout: u16,
}

pub const MAX_SEND_QUEUE_SIZE: u8 = 32;
pub const MAX_RECV_QUEUE_SIZE: u8 = 32;
pub const MAX_SEGMENT_SIZE: u16 = 128;
pub const MAX_OUTSTANDING_SEGS: u8 = 3;
pub const MAX_CUMULATIVE_ACKS: u8 = 3;
pub const MAX_OUT_OF_SEQUENCE: u8 = 3;
pub const MAX_AUTO_RESET: u8 = 3;
pub const NULL_SEGMENT_TIMEOUT: u16 = 2000;
pub const RETRANSMISSION_TIMEOUT: u16 = 600;
pub const CUMULATIVE_ACK_TIMEOUT: u16 = 300;

impl Default for RudpProfile {
    /// The default profile. The protocol draft suggests 3 for the
    /// retransmission limit, but with lossy links a finite limit stalls
    /// connections that would recover, so the default is 0 (unlimited).
    fn default() -> Self {
        RudpProfile {
            max_send_queue_size: MAX_SEND_QUEUE_SIZE,
            max_recv_queue_size: MAX_RECV_QUEUE_SIZE,
            max_segment_size: MAX_SEGMENT_SIZE,
            max_outstanding_segs: MAX_OUTSTANDING_SEGS,
            max_retrans: 0,
            max_cumulative_acks: MAX_CUMULATIVE_ACKS,
            max_out_of_sequence: MAX_OUT_OF_SEQUENCE,
            max_auto_reset: MAX_AUTO_RESET,
            null_segment_timeout: NULL_SEGMENT_TIMEOUT,
            retransmission_timeout: RETRANSMISSION_TIMEOUT,
            cumulative_ack_timeout: CUMULATIVE_ACK_TIMEOUT,
        }
    }
}

#[allow(clippy::too_many_arguments)]
impl RudpProfile {
    pub fn new(
        max_send_queue_size: u8,
        max_recv_queue_size: u8,
        max_segment_size: u16,
        max_outstanding_segs: u8,
        max_retrans: u8,
        max_cumulative_acks: u8,
        max_out_of_sequence: u8,
        max_auto_reset: u8,
        null_segment_timeout: u16,
        retransmission_timeout: u16,
        cumulative_ack_timeout: u16,
    ) -> Result<RudpProfile> {
        check("max_send_queue_size", max_send_queue_size as u32, 1, 255)?;
        check("max_recv_queue_size", max_recv_queue_size as u32, 1, 255)?;
        check("max_segment_size", max_segment_size as u32, 22, 65535)?;
        check("max_outstanding_segs", max_outstanding_segs as u32, 1, 255)?;
        check("max_retrans", max_retrans as u32, 0, 255)?;
        check("max_cumulative_acks", max_cumulative_acks as u32, 0, 255)?;
        check("max_out_of_sequence", max_out_of_sequence as u32, 0, 255)?;
        check("max_auto_reset", max_auto_reset as u32, 0, 255)?;
        check("null_segment_timeout", null_segment_timeout as u32, 0, 65535)?;
        check("retransmission_timeout", retransmission_timeout as u32, 100, 65535)?;
        check("cumulative_ack_timeout", cumulative_ack_timeout as u32, 100, 65535)?;

        Ok(RudpProfile {
            max_send_queue_size,
            max_recv_queue_size,
            max_segment_size,
            max_outstanding_segs,
            max_retrans,
            max_cumulative_acks,
            max_out_of_sequence,
            max_auto_reset,
            null_segment_timeout,
            retransmission_timeout,
            cumulative_ack_timeout,
        })
    }

    /// Maximum send queue size (segments).
    pub fn max_send_queue_size(&self) -> u8 {
        self.max_send_queue_size
    }

    /// Maximum receive queue size (segments).
    pub fn max_recv_queue_size(&self) -> u8 {
        self.max_recv_queue_size
    }

    /// Maximum segment size (octets, including the header).
    pub fn max_segment_size(&self) -> u16 {
        self.max_segment_size
    }

    /// Maximum number of outstanding (sent but unacknowledged) segments.
    pub fn max_outstanding_segs(&self) -> u8 {
        self.max_outstanding_segs
    }

    /// Maximum number of consecutive retransmissions (0 means unlimited).
    pub fn max_retrans(&self) -> u8 {
        self.max_retrans
    }

    /// Maximum number of unacknowledged received segments before an ACK is
    /// forced out.
    pub fn max_cumulative_acks(&self) -> u8 {
        self.max_cumulative_acks
    }

    /// Maximum number of out-of-sequence received segments before an EAK is
    /// forced out.
    pub fn max_out_of_sequence(&self) -> u8 {
        self.max_out_of_sequence
    }

    /// Maximum number of consecutive auto resets. Declared by the protocol
    /// but without behavior.
    pub fn max_auto_reset(&self) -> u8 {
        self.max_auto_reset
    }

    /// Null segment (keepalive) timeout in ms; 0 disables the keepalive.
    pub fn null_segment_timeout(&self) -> u16 {
        self.null_segment_timeout
    }

    /// Retransmission timeout in ms.
    pub fn retransmission_timeout(&self) -> u16 {
        self.retransmission_timeout
    }

    /// Cumulative acknowledge timeout in ms.
    pub fn cumulative_ack_timeout(&self) -> u16 {
        self.cumulative_ack_timeout
    }

    /// The largest DAT payload that fits a segment of this profile.
    pub fn max_payload_len(&self) -> usize {
        self.max_segment_size as usize - RUDP_HEADER_LEN
    }
}

fn check(field: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(RudpError::Config { field, value, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let p = RudpProfile::default();
        RudpProfile::new(
            p.max_send_queue_size(),
            p.max_recv_queue_size(),
            p.max_segment_size(),
            p.max_outstanding_segs(),
            p.max_retrans(),
            p.max_cumulative_acks(),
            p.max_out_of_sequence(),
            p.max_auto_reset(),
            p.null_segment_timeout(),
            p.retransmission_timeout(),
            p.cumulative_ack_timeout(),
        )
        .unwrap();
        assert_eq!(p.max_retrans(), 0);
        assert_eq!(p.max_payload_len(), 122);
    }

    #[rstest]
    #[case::send_queue_zero(0, 32, 128, 3, "max_send_queue_size")]
    #[case::recv_queue_zero(32, 0, 128, 3, "max_recv_queue_size")]
    #[case::segment_too_small(32, 32, 21, 3, "max_segment_size")]
    #[case::outstanding_zero(32, 32, 128, 0, "max_outstanding_segs")]
    fn test_out_of_range(
        #[case] send_q: u8,
        #[case] recv_q: u8,
        #[case] mss: u16,
        #[case] outstanding: u8,
        #[case] expected_field: &str,
    ) {
        let err = RudpProfile::new(send_q, recv_q, mss, outstanding, 0, 3, 3, 3, 2000, 600, 300)
            .unwrap_err();
        match err {
            RudpError::Config { field, .. } => assert_eq!(field, expected_field),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case::retransmission(99, 300, "retransmission_timeout")]
    #[case::cumulative_ack(600, 99, "cumulative_ack_timeout")]
    fn test_timeout_lower_bounds(#[case] retrans: u16, #[case] cum_ack: u16, #[case] expected_field: &str) {
        let err = RudpProfile::new(32, 32, 128, 3, 0, 3, 3, 3, 0, retrans, cum_ack).unwrap_err();
        match err {
            RudpError::Config { field, .. } => assert_eq!(field, expected_field),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_null_segment_timeout_zero_is_allowed() {
        let p = RudpProfile::new(32, 32, 128, 3, 0, 3, 3, 3, 0, 600, 300).unwrap();
        assert_eq!(p.null_segment_timeout(), 0);
    }
}
