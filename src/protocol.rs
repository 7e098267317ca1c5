//! KCP protocol types, constants, wire codec and wraparound helpers

use bytes::{Buf, BufMut};
use std::sync::LazyLock;
use tokio::time::Instant;

/// KCP protocol constants
pub mod constants {
    pub const IKCP_RTO_NDL: u32 = 30; // no delay min rto
    pub const IKCP_RTO_MIN: u32 = 100; // normal min rto
    pub const IKCP_RTO_DEF: u32 = 200; // default rto
    pub const IKCP_RTO_MAX: u32 = 60000; // max rto
    pub const IKCP_CMD_PUSH: u8 = 81; // cmd: push data
    pub const IKCP_CMD_ACK: u8 = 82; // cmd: ack
    pub const IKCP_CMD_WASK: u8 = 83; // cmd: window probe (ask)
    pub const IKCP_CMD_WINS: u8 = 84; // cmd: window size (tell)
    pub const IKCP_WND_SND: u32 = 32; // default send window
    pub const IKCP_WND_RCV: u32 = 128; // default receive window
    pub const IKCP_MTU_DEF: u32 = 1400; // default mtu
    pub const IKCP_MTU_MIN: u32 = 50; // smallest usable mtu
    pub const IKCP_INTERVAL: u32 = 100; // default update interval
    pub const IKCP_INTERVAL_MIN: u32 = 10; // intervals below this fall back to the default
    pub const IKCP_DEADLINK: u32 = 20; // max dead link count
    pub const IKCP_THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const IKCP_THRESH_MIN: u32 = 2; // min slow start threshold
    pub const IKCP_PROBE_INIT: u32 = 7000; // 7 secs to probe window size
    pub const IKCP_PROBE_LIMIT: u32 = 120000; // up to 120 secs to probe window
    pub const IKCP_FASTACK_LIMIT: u32 = 5; // max times to trigger fastack
    pub const IKCP_FRAGMENT_MAX: usize = 256; // fragments per message
    pub const IKCP_QUEUE_SIZE: usize = 32; // default send/receive queue capacity (segments)
    pub const IKCP_SLAP_LIMIT: i32 = 10000; // resync flush clock beyond this drift
}

/// Conversation ID type (carried big-endian in front of every header)
pub type ConvId = u64;

/// Sequence number type
pub type SeqNum = u32;

/// Timestamp type (milliseconds, wrapping)
pub type Timestamp = u32;

/// Header length without the conversation ID prefix
pub const HEADER_LENGTH_WITHOUT_CONVID: usize = 20;

/// Header length with the 8-byte conversation ID prefix
pub const HEADER_LENGTH_WITH_CONVID: usize = 28;

/// Header length for a conversation with or without an ID
#[inline]
pub const fn header_length(has_conversation_id: bool) -> usize {
    if has_conversation_id {
        HEADER_LENGTH_WITH_CONVID
    } else {
        HEADER_LENGTH_WITHOUT_CONVID
    }
}

/// Segment command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Push = constants::IKCP_CMD_PUSH,
    Ack = constants::IKCP_CMD_ACK,
    WindowProbe = constants::IKCP_CMD_WASK,
    WindowSize = constants::IKCP_CMD_WINS,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            constants::IKCP_CMD_PUSH => Some(Self::Push),
            constants::IKCP_CMD_ACK => Some(Self::Ack),
            constants::IKCP_CMD_WASK => Some(Self::WindowProbe),
            constants::IKCP_CMD_WINS => Some(Self::WindowSize),
            _ => None,
        }
    }

    /// Get command type as string for debugging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "PUSH",
            Self::Ack => "ACK",
            Self::WindowProbe => "WASK",
            Self::WindowSize => "WINS",
        }
    }
}

/// KCP segment header.
///
/// The payload length and the optional conversation ID are not part of the
/// header value: the length always follows from the payload being encoded,
/// and the ID is fixed per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub command: Command,
    pub fragment: u8,
    pub window_size: u16,
    pub timestamp: Timestamp,
    pub serial_number: SeqNum,
    pub unacknowledged: SeqNum,
}

/// A segment parsed out of an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedSegment<'a> {
    pub conversation_id: Option<ConvId>,
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl PacketHeader {
    pub fn new(
        command: Command,
        fragment: u8,
        window_size: u16,
        timestamp: Timestamp,
        serial_number: SeqNum,
        unacknowledged: SeqNum,
    ) -> Self {
        Self {
            command,
            fragment,
            window_size,
            timestamp,
            serial_number,
            unacknowledged,
        }
    }

    /// Encode header (and length word) into `buf`. Returns bytes written.
    pub fn encode<B: BufMut>(
        &self,
        conversation_id: Option<ConvId>,
        payload_len: usize,
        buf: &mut B,
    ) -> usize {
        if let Some(id) = conversation_id {
            buf.put_u64(id);
        }
        buf.put_u8(self.command as u8);
        buf.put_u8(self.fragment);
        buf.put_u16_le(self.window_size);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.serial_number);
        buf.put_u32_le(self.unacknowledged);
        buf.put_u32_le(payload_len as u32);
        header_length(conversation_id.is_some())
    }

    /// Decode one segment from the front of `buf`.
    ///
    /// Returns the segment and the number of bytes it occupies, or `None` when
    /// the buffer is shorter than a header, the declared payload length runs
    /// past the end of the buffer, or the command is unknown.
    pub fn decode(buf: &[u8], has_conversation_id: bool) -> Option<(DecodedSegment<'_>, usize)> {
        let header_len = header_length(has_conversation_id);
        if buf.len() < header_len {
            return None;
        }

        let mut cursor = buf;
        let conversation_id = has_conversation_id.then(|| cursor.get_u64());
        let command = Command::from_u8(cursor.get_u8())?;
        let fragment = cursor.get_u8();
        let window_size = cursor.get_u16_le();
        let timestamp = cursor.get_u32_le();
        let serial_number = cursor.get_u32_le();
        let unacknowledged = cursor.get_u32_le();
        let length = cursor.get_u32_le() as usize;

        if length > cursor.len() {
            return None;
        }

        let segment = DecodedSegment {
            conversation_id,
            header: Self {
                command,
                fragment,
                window_size,
                timestamp,
                serial_number,
                unacknowledged,
            },
            payload: &cursor[..length],
        };
        Some((segment, header_len + length))
    }
}

/// Statistics for a KCP conversation
#[derive(Debug, Default, Clone, Copy)]
pub struct KcpStats {
    /// Total payload bytes sent (first transmissions only)
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Datagrams carrying at least one accepted segment. Undecodable input
    /// and segments for another conversation are not counted.
    pub packets_received: u64,
    /// Timeout retransmissions
    pub retransmissions: u64,
    /// Fast retransmissions
    pub fast_retransmissions: u64,
    /// Smoothed RTT in milliseconds
    pub rtt: u32,
    /// RTT variance
    pub rtt_var: u32,
    /// Current RTO
    pub rto: u32,
    /// Send window size
    pub snd_wnd: u32,
    /// Receive window size
    pub rcv_wnd: u32,
    /// Remote advertised window
    pub rmt_wnd: u32,
    /// Congestion window size
    pub cwnd: u32,
    /// Segments in send buffer
    pub snd_buf_size: u32,
    /// Segments in receive buffer
    pub rcv_buf_size: u32,
}

static CLOCK_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Current timestamp in milliseconds. Wraps after ~49 days.
///
/// Backed by the Tokio clock so paused-time tests drive it.
pub fn current_timestamp() -> Timestamp {
    Instant::now()
        .saturating_duration_since(*CLOCK_EPOCH)
        .as_millis() as Timestamp
}

/// Calculate time difference handling wrapping
#[inline]
pub fn time_diff(later: Timestamp, earlier: Timestamp) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Check if a sequence number is before another (handling wrapping)
#[inline]
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if a sequence number is after another (handling wrapping)
#[inline]
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(Command::Push, 3, 0x0102, 0x0A0B0C0D, 7, 5);
        let mut buf = BytesMut::new();
        let written = header.encode(Some(0x1122334455667788), 4, &mut buf);
        buf.extend_from_slice(b"data");

        assert_eq!(written, HEADER_LENGTH_WITH_CONVID);
        assert_eq!(&buf[..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(buf[8], 81);
        assert_eq!(buf[9], 3);
        assert_eq!(&buf[10..12], &[0x02, 0x01]);
        assert_eq!(&buf[12..16], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&buf[24..28], &[4, 0, 0, 0]);

        let (segment, used) = PacketHeader::decode(&buf, true).unwrap();
        assert_eq!(used, 32);
        assert_eq!(segment.conversation_id, Some(0x1122334455667788));
        assert_eq!(segment.header, header);
        assert_eq!(segment.payload, b"data");
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let header = PacketHeader::new(Command::Ack, 0, 32, 1, 2, 3);
        let mut buf = BytesMut::new();
        header.encode(None, 10, &mut buf);
        buf.extend_from_slice(&[0u8; 9]);

        // Declared length runs past the end
        assert!(PacketHeader::decode(&buf, false).is_none());
        // Shorter than a header
        assert!(PacketHeader::decode(&buf[..19], false).is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut buf = [0u8; HEADER_LENGTH_WITHOUT_CONVID];
        buf[0] = 99;
        assert!(PacketHeader::decode(&buf, false).is_none());
    }

    #[test]
    fn test_wrapping_helpers() {
        assert!(seq_before(u32::MAX, 0));
        assert!(seq_after(1, u32::MAX));
        assert_eq!(time_diff(5, u32::MAX - 4), 10);
        assert_eq!(time_diff(0, 10), -10);
    }
}
