//! KCP protocol engine
//!
//! Owns the send and receive windows, the retransmission timers, the
//! congestion window and the probe state. The engine never performs I/O:
//! every entry point takes the current timestamp, and the packets a flush
//! produces are collected until the control loop calls
//! [`KcpEngine::drain_output`].
//!
//! The send and receive queues are shared with the application; the engine
//! pulls segments from the send queue when the window opens and pushes
//! in-order segments into the receive queue.

use crate::ack_list::AckList;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::KcpConfig;
use crate::protocol::{
    constants, header_length, seq_after, seq_before, time_diff, Command, ConvId, KcpStats,
    PacketHeader, SeqNum, Timestamp,
};
use crate::receive_queue::ReceiveQueue;
use crate::send_queue::SendQueue;

use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const ASK_SEND: u8 = 1; // need to send a window probe
const ASK_TELL: u8 = 2; // need to announce our window

/// RTT calculation state
#[derive(Debug)]
struct RttState {
    srtt: u32,    // Smoothed RTT
    rttvar: u32,  // RTT variance
    rto: u32,     // Retransmission timeout
    min_rto: u32, // Minimum RTO
}

/// Window control state
#[derive(Debug)]
struct WindowState {
    snd: u32,      // Send window size
    rcv: u32,      // Receive window size
    rmt: u32,      // Remote window size
    cwnd: u32,     // Congestion window
    ssthresh: u32, // Slow start threshold
    incr: u32,     // Byte budget for congestion avoidance
}

/// Probe state for window probing
#[derive(Debug, Default)]
struct ProbeState {
    flags: u8,
    wait: u32,
    ts: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct KeepAliveState {
    interval: u32,
    grace: u32,
}

/// Receive-window announcement backoff
#[derive(Debug, Clone, Copy)]
struct WindowNotifyState {
    initial: u32,
    maximum: u32,
    ts: Timestamp,
    wait: u32,
}

/// A segment in the send window.
#[derive(Debug)]
struct SendSegment {
    sn: SeqNum,
    fragment: u8,
    data: PooledBuffer,
    resendts: Timestamp,
    rto: u32,
    fastack: u32,
    xmit: u32,
}

/// An out-of-order segment in the receive window.
#[derive(Debug)]
struct ReceiveSegment {
    sn: SeqNum,
    fragment: u8,
    data: PooledBuffer,
}

/// Packs segments into MTU-sized packets with the reserved space zeroed.
struct PacketWriter {
    pool: Arc<dyn BufferPool>,
    buffer: PooledBuffer,
    packets: Vec<PooledBuffer>,
    mtu: usize,
    pre: usize,
    post: usize,
}

impl PacketWriter {
    fn new(pool: Arc<dyn BufferPool>, mtu: usize, pre: usize, post: usize) -> Self {
        let buffer = Self::fresh(&pool, mtu, pre);
        Self {
            pool,
            buffer,
            packets: Vec::new(),
            mtu,
            pre,
            post,
        }
    }

    fn fresh(pool: &Arc<dyn BufferPool>, mtu: usize, pre: usize) -> PooledBuffer {
        let mut buffer = PooledBuffer::rent(pool, mtu);
        buffer.resize(pre, 0);
        buffer
    }

    /// Make room for `need` bytes, emitting the current packet if it would
    /// overflow the MTU.
    fn reserve(&mut self, need: usize) -> &mut BytesMut {
        if self.buffer.len() + need > self.mtu - self.post {
            self.emit();
        }
        &mut self.buffer
    }

    fn emit(&mut self) {
        let next = Self::fresh(&self.pool, self.mtu, self.pre);
        let mut packet = std::mem::replace(&mut self.buffer, next);
        let len = packet.len();
        packet.resize(len + self.post, 0);
        self.packets.push(packet);
    }

    /// Packets emitted so far, not counting the one being filled.
    fn emitted(&self) -> usize {
        self.packets.len()
    }

    fn finish(mut self) -> Vec<PooledBuffer> {
        if self.buffer.len() > self.pre {
            self.emit();
        }
        self.packets
    }
}

/// KCP engine implementing the core protocol logic
pub struct KcpEngine {
    // Core
    conversation_id: Option<ConvId>,
    mtu: usize,
    mss: usize,
    pre_buffer: usize,
    post_buffer: usize,
    interval: u32,
    nodelay: bool,
    fast_resend: u32,
    no_cwnd: bool,

    // Sequence numbers
    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,

    // Timing and window
    rtt: RttState,
    wnd: WindowState,
    probe: ProbeState,
    ts_flush: Timestamp,
    last_send: Timestamp,
    last_receive: Timestamp,
    keep_alive: Option<KeepAliveState>,
    window_notify: Option<WindowNotifyState>,
    advertised_zero_window: bool,

    // Buffers
    snd_buf: VecDeque<SendSegment>,
    rcv_buf: VecDeque<ReceiveSegment>,
    ack_list: AckList,
    output: Vec<PooledBuffer>,
    send_queue: Arc<SendQueue>,
    receive_queue: Arc<ReceiveQueue>,
    pool: Arc<dyn BufferPool>,

    // State
    stats: KcpStats,
    dead: bool,
}

impl KcpEngine {
    pub fn new(
        config: &KcpConfig,
        send_queue: Arc<SendQueue>,
        receive_queue: Arc<ReceiveQueue>,
        pool: Arc<dyn BufferPool>,
        current: Timestamp,
    ) -> Self {
        let nodelay = config.nodelay.nodelay;
        let min_rto = if nodelay {
            constants::IKCP_RTO_NDL
        } else {
            constants::IKCP_RTO_MIN
        };
        let mss = config.mss();
        let snd_wnd = config.effective_snd_wnd();

        Self {
            conversation_id: config.conversation_id,
            mtu: config.mtu as usize,
            mss,
            pre_buffer: config.pre_buffer_size as usize,
            post_buffer: config.post_buffer_size as usize,
            interval: config.effective_interval(),
            nodelay,
            fast_resend: config.nodelay.resend,
            no_cwnd: config.nodelay.no_congestion_control,

            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,

            rtt: RttState {
                srtt: 0,
                rttvar: 0,
                rto: constants::IKCP_RTO_DEF,
                min_rto,
            },
            wnd: WindowState {
                snd: snd_wnd,
                rcv: config.effective_rcv_wnd(),
                rmt: config.effective_remote_wnd(),
                cwnd: 1,
                ssthresh: constants::IKCP_THRESH_INIT,
                incr: mss as u32,
            },
            probe: ProbeState::default(),
            ts_flush: current,
            last_send: current,
            last_receive: current,
            keep_alive: config.keep_alive.map(|ka| KeepAliveState {
                interval: millis(ka.send_interval),
                grace: millis(ka.grace_period),
            }),
            window_notify: config.receive_window_notification.map(|rwn| {
                let initial = millis(rwn.initial_interval);
                WindowNotifyState {
                    initial,
                    maximum: millis(rwn.maximum_interval),
                    ts: current.wrapping_add(initial),
                    wait: 0,
                }
            }),
            advertised_zero_window: false,

            snd_buf: VecDeque::with_capacity(snd_wnd as usize),
            rcv_buf: VecDeque::new(),
            ack_list: AckList::with_capacity(snd_wnd as usize),
            output: Vec::new(),
            send_queue,
            receive_queue,
            pool,

            stats: KcpStats::default(),
            dead: false,
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Process one inbound datagram, which may carry several segments.
    ///
    /// Processing stops silently at the first segment with a foreign
    /// conversation ID, an unknown command or a truncated payload; segments
    /// before it keep their effect. Returns whether protocol state changed.
    pub fn input(&mut self, packet: &[u8], current: Timestamp) -> bool {
        let prev_una = self.snd_una;
        let mut max_ack: Option<SeqNum> = None;
        let mut mutated = false;
        let mut rest = packet;
        let mut accepted = false;

        trace!(bytes = packet.len(), "Processing inbound packet");

        while let Some((segment, used)) =
            PacketHeader::decode(rest, self.conversation_id.is_some())
        {
            if segment.conversation_id != self.conversation_id {
                trace!(
                    packet_conv = ?segment.conversation_id,
                    "Conversation ID mismatch, dropping rest of packet"
                );
                break;
            }
            if !accepted {
                accepted = true;
                self.stats.packets_received += 1;
            }
            rest = &rest[used..];
            let header = segment.header;

            self.last_receive = current;
            self.wnd.rmt = header.window_size as u32;
            mutated |= self.parse_una(header.unacknowledged);
            mutated |= self.shrink_buf();

            match header.command {
                Command::Ack => {
                    let rtt = time_diff(current, header.timestamp);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    mutated |= self.parse_ack(header.serial_number);
                    mutated |= self.shrink_buf();

                    max_ack = match max_ack {
                        Some(sn) if !seq_after(header.serial_number, sn) => Some(sn),
                        _ => Some(header.serial_number),
                    };
                }
                Command::Push => {
                    let sn = header.serial_number;
                    if seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) {
                        self.ack_list.add(sn, header.timestamp);
                        if !seq_before(sn, self.rcv_nxt) {
                            mutated |= self.parse_data(sn, header.fragment, segment.payload);
                        }
                        if let Some(notify) = self.window_notify.as_mut() {
                            if notify.wait != 0 {
                                notify.wait = 0;
                                notify.ts = current.wrapping_add(notify.initial);
                            }
                        }
                    }
                }
                Command::WindowProbe => {
                    self.probe.flags |= ASK_TELL;
                }
                Command::WindowSize => {}
            }
        }

        if let Some(sn) = max_ack {
            self.parse_fastack(sn);
        }

        if seq_after(self.snd_una, prev_una) {
            self.update_cwnd();
        }

        self.report_to_send_queue();
        mutated
    }

    /// Move newly contiguous segments into the receive queue after the
    /// application freed room. Returns true if a flush is warranted.
    pub fn drain_receive_buffer(&mut self) -> bool {
        let moved = self.move_to_recv_queue();
        if self.advertised_zero_window && self.wnd_unused() > 0 {
            // Tell the peer the window reopened instead of waiting for its probe
            self.probe.flags |= ASK_TELL;
            self.advertised_zero_window = false;
            return true;
        }
        moved
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Paced flush: runs at most once per interval unless in no-delay mode.
    /// Returns whether a flush happened.
    pub fn update(&mut self, current: Timestamp) -> bool {
        let mut slap = time_diff(current, self.ts_flush);
        if !(-constants::IKCP_SLAP_LIMIT..=constants::IKCP_SLAP_LIMIT).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 || self.nodelay {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(current);
            return true;
        }
        false
    }

    /// Emit pending acks, new and retransmitted data, probes and window
    /// announcements.
    pub fn flush(&mut self, current: Timestamp) {
        let conv = self.conversation_id;
        let header_len = header_length(conv.is_some());
        let wnd_unused = self.wnd_unused();
        let window_size = wnd_unused.min(u16::MAX as u32) as u16;
        let una = self.rcv_nxt;
        let mut writer = PacketWriter::new(self.pool.clone(), self.mtu, self.pre_buffer, self.post_buffer);

        // Acknowledgments
        for (sn, ts) in self.ack_list.iter() {
            let buf = writer.reserve(header_len);
            PacketHeader::new(Command::Ack, 0, window_size, ts, sn, una).encode(conv, 0, buf);
        }

        // Effective window
        let mut cwnd = self.wnd.snd.min(self.wnd.rmt);
        if !self.no_cwnd {
            cwnd = cwnd.min(self.wnd.cwnd);
        }

        // Send queue -> send window
        while seq_before(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) {
            let Some(queued) = self.send_queue.try_dequeue() else {
                break;
            };
            self.snd_buf.push_back(SendSegment {
                sn: self.snd_nxt,
                fragment: queued.fragment,
                data: queued.data,
                resendts: current,
                rto: self.rtt.rto,
                fastack: 0,
                xmit: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let resent = if self.fast_resend > 0 {
            self.fast_resend
        } else {
            u32::MAX
        };
        let rtomin = if self.nodelay { 0 } else { self.rtt.rto >> 3 };
        let rx_rto = self.rtt.rto;
        let mut lost = false;
        let mut change = false;

        // Data segments
        for segment in self.snd_buf.iter_mut() {
            let needsend = if segment.xmit == 0 {
                segment.xmit = 1;
                segment.resendts = current.wrapping_add(segment.rto).wrapping_add(rtomin);
                segment.rto = rx_rto;
                self.stats.bytes_sent += segment.data.len() as u64;
                true
            } else if time_diff(current, segment.resendts) >= 0 {
                segment.xmit += 1;
                if self.nodelay {
                    segment.rto += segment.rto / 2;
                } else {
                    segment.rto += segment.rto.max(rx_rto);
                }
                segment.rto = segment.rto.min(constants::IKCP_RTO_MAX);
                segment.resendts = current.wrapping_add(segment.rto);
                self.stats.retransmissions += 1;
                lost = true;
                true
            } else if segment.fastack > resent && segment.xmit <= constants::IKCP_FASTACK_LIMIT {
                segment.xmit += 1;
                segment.fastack = 0;
                segment.resendts = current.wrapping_add(segment.rto);
                self.stats.fast_retransmissions += 1;
                change = true;
                true
            } else {
                false
            };

            if needsend {
                let buf = writer.reserve(header_len + segment.data.len());
                PacketHeader::new(
                    Command::Push,
                    segment.fragment,
                    window_size,
                    current,
                    segment.sn,
                    una,
                )
                .encode(conv, segment.data.len(), buf);
                buf.extend_from_slice(&segment.data);

                if segment.xmit >= constants::IKCP_DEADLINK && !self.dead {
                    warn!(sn = segment.sn, xmit = segment.xmit, "Dead link detected");
                    self.dead = true;
                }
            }
        }

        self.ack_list.clear();

        // Window probing while the remote window is zero
        if self.wnd.rmt == 0 {
            if self.probe.wait == 0 {
                self.probe.wait = constants::IKCP_PROBE_INIT;
                self.probe.ts = current.wrapping_add(self.probe.wait);
            } else if time_diff(current, self.probe.ts) >= 0 {
                if self.probe.wait < constants::IKCP_PROBE_INIT {
                    self.probe.wait = constants::IKCP_PROBE_INIT;
                }
                self.probe.wait += self.probe.wait / 2;
                if self.probe.wait > constants::IKCP_PROBE_LIMIT {
                    self.probe.wait = constants::IKCP_PROBE_LIMIT;
                }
                self.probe.ts = current.wrapping_add(self.probe.wait);
                self.probe.flags |= ASK_SEND;
            }
        } else {
            self.probe.ts = 0;
            self.probe.wait = 0;
        }

        if self.probe.flags & ASK_SEND != 0 {
            debug!(wait = self.probe.wait, "Probing remote window");
            let buf = writer.reserve(header_len);
            PacketHeader::new(Command::WindowProbe, 0, window_size, 0, 0, una).encode(conv, 0, buf);
        }

        if writer.emitted() == 0 && self.should_send_window_size(current) {
            let buf = writer.reserve(header_len);
            PacketHeader::new(Command::WindowSize, 0, window_size, 0, 0, una).encode(conv, 0, buf);
        }

        self.probe.flags = 0;
        self.advertised_zero_window = wnd_unused == 0;
        self.push_output(writer.finish(), current);

        // Congestion window
        if change {
            debug!(cwnd = self.wnd.cwnd, "Fast retransmit, shrinking congestion window");
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.wnd.ssthresh = (inflight / 2).max(constants::IKCP_THRESH_MIN);
            self.wnd.cwnd = self.wnd.ssthresh.saturating_add(resent);
            self.wnd.incr = self.wnd.cwnd.saturating_mul(self.mss as u32);
        }
        if lost {
            debug!(cwnd, rto = self.rtt.rto, "Retransmission timeout, resetting congestion window");
            self.wnd.ssthresh = (cwnd / 2).max(constants::IKCP_THRESH_MIN);
            self.reset_cwnd();
        }
        if self.wnd.cwnd < 1 {
            self.reset_cwnd();
        }
        self.clamp_cwnd();

        // Keep-alive
        if let Some(ka) = self.keep_alive {
            if i64::from(time_diff(current, self.last_send)) > i64::from(ka.interval) {
                let mut writer =
                    PacketWriter::new(self.pool.clone(), self.mtu, self.pre_buffer, self.post_buffer);
                let buf = writer.reserve(header_len);
                PacketHeader::new(Command::WindowSize, 0, window_size, 0, 0, una).encode(conv, 0, buf);
                debug!("Sending keep-alive");
                self.push_output(writer.finish(), current);
            }
        }

        self.report_to_send_queue();
    }

    /// Take the packets produced since the last call.
    pub fn drain_output(&mut self) -> Vec<PooledBuffer> {
        std::mem::take(&mut self.output)
    }

    // ── Status ──────────────────────────────────────────────────────────

    /// A segment reached the dead-link retransmission count.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Keep-alive is enabled and nothing valid arrived within the grace
    /// period.
    pub fn is_idle_expired(&self, current: Timestamp) -> bool {
        self.keep_alive
            .is_some_and(|ka| i64::from(time_diff(current, self.last_receive)) > i64::from(ka.grace))
    }

    pub fn stats(&self) -> KcpStats {
        KcpStats {
            rtt: self.rtt.srtt,
            rtt_var: self.rtt.rttvar,
            rto: self.rtt.rto,
            snd_wnd: self.wnd.snd,
            rcv_wnd: self.wnd.rcv,
            rmt_wnd: self.wnd.rmt,
            cwnd: self.wnd.cwnd,
            snd_buf_size: self.snd_buf.len() as u32,
            rcv_buf_size: self.rcv_buf.len() as u32,
            ..self.stats
        }
    }

    pub fn snd_una(&self) -> SeqNum {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> SeqNum {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> SeqNum {
        self.rcv_nxt
    }

    pub fn rto(&self) -> u32 {
        self.rtt.rto
    }

    pub fn cwnd(&self) -> u32 {
        self.wnd.cwnd
    }

    pub fn remote_window(&self) -> u32 {
        self.wnd.rmt
    }

    /// Release every buffered segment and pending packet.
    pub fn close(&mut self) {
        debug!(
            snd_buf = self.snd_buf.len(),
            rcv_buf = self.rcv_buf.len(),
            "Releasing engine buffers"
        );
        self.snd_buf.clear();
        self.rcv_buf.clear();
        self.ack_list.clear();
        self.output.clear();
    }

    // Private helper methods

    fn push_output(&mut self, packets: Vec<PooledBuffer>, current: Timestamp) {
        if packets.is_empty() {
            return;
        }
        self.last_send = current;
        self.stats.packets_sent += packets.len() as u64;
        self.output.extend(packets);
    }

    fn report_to_send_queue(&self) {
        self.send_queue
            .update_engine_state(self.snd_buf.is_empty(), self.ack_list.is_empty());
    }

    /// Drop segments below the peer's cumulative ack.
    fn parse_una(&mut self, una: SeqNum) -> bool {
        let mut removed = false;
        while self.snd_buf.front().is_some_and(|seg| seq_before(seg.sn, una)) {
            if let Some(seg) = self.snd_buf.pop_front() {
                self.send_queue.subtract_unflushed_bytes(seg.data.len());
                removed = true;
            }
        }
        removed
    }

    fn parse_ack(&mut self, sn: SeqNum) -> bool {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return false;
        }

        let found = self
            .snd_buf
            .iter()
            .take_while(|seg| !seq_before(sn, seg.sn))
            .position(|seg| seg.sn == sn);
        match found.and_then(|i| self.snd_buf.remove(i)) {
            Some(seg) => {
                self.send_queue.subtract_unflushed_bytes(seg.data.len());
                true
            }
            None => false,
        }
    }

    fn parse_fastack(&mut self, sn: SeqNum) {
        if seq_before(sn, self.snd_una) || !seq_before(sn, self.snd_nxt) {
            return;
        }

        for segment in self.snd_buf.iter_mut() {
            if seq_before(sn, segment.sn) {
                break;
            }
            if segment.sn != sn {
                segment.fastack += 1;
            }
        }
    }

    fn shrink_buf(&mut self) -> bool {
        let una = self.snd_buf.front().map_or(self.snd_nxt, |seg| seg.sn);
        let changed = una != self.snd_una;
        self.snd_una = una;
        changed
    }

    fn parse_data(&mut self, sn: SeqNum, fragment: u8, payload: &[u8]) -> bool {
        if !seq_before(sn, self.rcv_nxt.wrapping_add(self.wnd.rcv)) || seq_before(sn, self.rcv_nxt) {
            return false;
        }

        let mut insert_at = self.rcv_buf.len();
        let mut repeat = false;
        for (i, seg) in self.rcv_buf.iter().enumerate().rev() {
            if seg.sn == sn {
                repeat = true;
                break;
            }
            if seq_after(sn, seg.sn) {
                break;
            }
            insert_at = i;
        }

        let mut mutated = false;
        if !repeat {
            self.rcv_buf.insert(
                insert_at,
                ReceiveSegment {
                    sn,
                    fragment,
                    data: PooledBuffer::copy_from_slice(&self.pool, payload),
                },
            );
            self.stats.bytes_received += payload.len() as u64;
            mutated = true;
        }

        self.move_to_recv_queue() || mutated
    }

    fn move_to_recv_queue(&mut self) -> bool {
        let mut moved = false;
        while self.rcv_buf.front().is_some_and(|seg| seg.sn == self.rcv_nxt)
            && self.receive_queue.len() < self.wnd.rcv as usize
        {
            let Some(seg) = self.rcv_buf.pop_front() else {
                break;
            };
            self.receive_queue.enqueue(seg.data, seg.fragment);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            moved = true;
        }
        moved
    }

    /// Feed one RTT sample. The echoed timestamp is peer-controlled, so the
    /// estimator runs in u64 and only the clamped RTO narrows back.
    fn update_ack(&mut self, rtt: u32) {
        let rtt = u64::from(rtt);
        let mut srtt = u64::from(self.rtt.srtt);
        let mut rttvar = u64::from(self.rtt.rttvar);
        if srtt == 0 {
            srtt = rtt;
            rttvar = rtt / 2;
        } else {
            let delta = rtt.abs_diff(srtt);
            rttvar = (3 * rttvar + delta) / 4;
            srtt = ((7 * srtt + rtt) / 8).max(1);
        }

        let rto = srtt + u64::from(self.interval).max(4 * rttvar);
        let rto = rto.clamp(
            u64::from(self.rtt.min_rto),
            u64::from(constants::IKCP_RTO_MAX),
        );
        self.rtt.srtt = u32::try_from(srtt).unwrap_or(u32::MAX);
        self.rtt.rttvar = u32::try_from(rttvar).unwrap_or(u32::MAX);
        self.rtt.rto = u32::try_from(rto).unwrap_or(constants::IKCP_RTO_MAX);
    }

    /// Slow start below the threshold, additive increase above it.
    fn update_cwnd(&mut self) {
        if self.wnd.cwnd >= self.wnd.rmt {
            return;
        }
        let mss = self.mss as u32;
        if self.wnd.cwnd < self.wnd.ssthresh {
            self.wnd.cwnd += 1;
            self.wnd.incr = self.wnd.incr.saturating_add(mss);
        } else {
            if self.wnd.incr < mss {
                self.wnd.incr = mss;
            }
            self.wnd.incr = self
                .wnd
                .incr
                .saturating_add(mss * mss / self.wnd.incr + mss / 16);
            self.wnd.cwnd = self.wnd.incr.div_ceil(mss.max(1));
        }
        self.clamp_cwnd();
    }

    /// Keep the congestion window within [1, min(snd_wnd, rmt_wnd)].
    fn clamp_cwnd(&mut self) {
        let cap = self.wnd.snd.min(self.wnd.rmt).max(1);
        if self.wnd.cwnd > cap {
            self.wnd.cwnd = cap;
            self.wnd.incr = self.wnd.incr.min(cap.saturating_mul(self.mss as u32));
        }
    }

    #[inline]
    fn reset_cwnd(&mut self) {
        self.wnd.cwnd = 1;
        self.wnd.incr = self.mss as u32;
    }

    fn wnd_unused(&self) -> u32 {
        (self.wnd.rcv as usize).saturating_sub(self.receive_queue.len()) as u32
    }

    fn should_send_window_size(&mut self, current: Timestamp) -> bool {
        if self.probe.flags & ASK_TELL != 0 {
            return true;
        }
        let Some(notify) = self.window_notify.as_mut() else {
            return false;
        };
        if time_diff(current, notify.ts) < 0 {
            return false;
        }

        notify.wait = if notify.wait < notify.initial {
            notify.initial
        } else if notify.wait >= notify.maximum {
            notify.maximum
        } else {
            notify.maximum.min(notify.wait + notify.wait / 2)
        };
        notify.ts = current.wrapping_add(notify.wait);
        true
    }
}

/// Milliseconds of `duration`, saturating at `u32::MAX`.
fn millis(duration: std::time::Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
