//! Configuration types for KCP conversations.
//!
//! [`KcpConfig`] is a builder: start from [`KcpConfig::new`] or a preset and
//! chain setters. Out-of-range window, queue and interval values fall back to
//! the protocol defaults; [`KcpConfig::validate`] rejects the rest.

use crate::error::{KcpError, Result};
use crate::protocol::{constants, header_length, ConvId};
use std::time::Duration;

// ── NodeDelayConfig ─────────────────────────────────────────────────────

/// Node delay configuration for different performance modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDelayConfig {
    /// Enable no-delay mode (lower minimum RTO, gentler RTO backoff)
    pub nodelay: bool,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast resend threshold (0 disables fast retransmit)
    pub resend: u32,
    /// Disable congestion control
    pub no_congestion_control: bool,
}

impl NodeDelayConfig {
    /// Normal mode - balanced performance and reliability
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: constants::IKCP_INTERVAL,
            resend: 0,
            no_congestion_control: false,
        }
    }

    /// Fast mode - optimized for low latency
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 20,
            resend: 2,
            no_congestion_control: false,
        }
    }

    /// Turbo mode - maximum performance, minimum latency
    pub fn turbo() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion_control: true,
        }
    }

    /// Custom configuration
    pub fn custom(nodelay: bool, interval: u32, resend: u32, no_congestion_control: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            no_congestion_control,
        }
    }
}

// ── Optional features ───────────────────────────────────────────────────

/// Keep-alive settings.
///
/// A zero-payload WindowSize segment goes out when nothing was sent for
/// `send_interval`; the conversation closes itself when nothing valid was
/// received for `grace_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub send_interval: Duration,
    pub grace_period: Duration,
}

impl KeepAliveConfig {
    pub fn new(send_interval: Duration, grace_period: Duration) -> Self {
        Self {
            send_interval,
            grace_period,
        }
    }
}

/// Periodic receive-window announcements, backing off from
/// `initial_interval` up to `maximum_interval` while no data arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindowNotificationConfig {
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
}

impl ReceiveWindowNotificationConfig {
    pub fn new(initial_interval: Duration, maximum_interval: Duration) -> Self {
        Self {
            initial_interval,
            maximum_interval,
        }
    }
}

// ── KcpConfig ───────────────────────────────────────────────────────────

/// Full conversation configuration.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mtu: u32,
    /// Space reserved in front of every packet for outer framing
    pub pre_buffer_size: u32,
    /// Space reserved behind every packet for outer framing
    pub post_buffer_size: u32,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    /// Remote receive window assumed until the peer advertises one
    pub remote_wnd: u32,
    pub nodelay: NodeDelayConfig,
    pub stream_mode: bool,
    /// Send queue capacity in segments
    pub send_queue_size: usize,
    /// Receive queue capacity in segments
    pub receive_queue_size: usize,
    pub keep_alive: Option<KeepAliveConfig>,
    pub receive_window_notification: Option<ReceiveWindowNotificationConfig>,
    /// Prefix every segment with this 8-byte ID and drop segments without it
    pub conversation_id: Option<ConvId>,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: constants::IKCP_MTU_DEF,
            pre_buffer_size: 0,
            post_buffer_size: 0,
            snd_wnd: constants::IKCP_WND_SND,
            rcv_wnd: constants::IKCP_WND_RCV,
            remote_wnd: constants::IKCP_WND_RCV,
            nodelay: NodeDelayConfig::normal(),
            stream_mode: false,
            send_queue_size: constants::IKCP_QUEUE_SIZE,
            receive_queue_size: constants::IKCP_QUEUE_SIZE,
            keep_alive: None,
            receive_window_notification: None,
            conversation_id: None,
        }
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl KcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn reserved_space(mut self, pre: u32, post: u32) -> Self {
        self.pre_buffer_size = pre;
        self.post_buffer_size = post;
        self
    }

    pub fn send_window(mut self, wnd: u32) -> Self {
        self.snd_wnd = wnd;
        self
    }

    pub fn recv_window(mut self, wnd: u32) -> Self {
        self.rcv_wnd = wnd;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn remote_window(mut self, wnd: u32) -> Self {
        self.remote_wnd = wnd;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::fast();
        self
    }

    pub fn turbo_mode(mut self) -> Self {
        self.nodelay = NodeDelayConfig::turbo();
        self
    }

    pub fn nodelay_config(mut self, config: NodeDelayConfig) -> Self {
        self.nodelay = config;
        self
    }

    pub fn stream_mode(mut self, enabled: bool) -> Self {
        self.stream_mode = enabled;
        self
    }

    pub fn conversation_id(mut self, id: ConvId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    // -- Queues and optional features --

    pub fn queue_size(mut self, send: usize, receive: usize) -> Self {
        self.send_queue_size = send;
        self.receive_queue_size = receive;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Option<KeepAliveConfig>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn receive_window_notification(
        mut self,
        notification: Option<ReceiveWindowNotificationConfig>,
    ) -> Self {
        self.receive_window_notification = notification;
        self
    }

    // -- Derived values --

    /// Update interval after applying the minimum
    pub fn effective_interval(&self) -> u32 {
        if self.nodelay.interval < constants::IKCP_INTERVAL_MIN {
            constants::IKCP_INTERVAL
        } else {
            self.nodelay.interval
        }
    }

    pub fn effective_snd_wnd(&self) -> u32 {
        non_zero_or(self.snd_wnd, constants::IKCP_WND_SND)
    }

    pub fn effective_rcv_wnd(&self) -> u32 {
        non_zero_or(self.rcv_wnd, constants::IKCP_WND_RCV)
    }

    pub fn effective_remote_wnd(&self) -> u32 {
        non_zero_or(self.remote_wnd, constants::IKCP_WND_RCV)
    }

    pub fn effective_send_queue_size(&self) -> usize {
        if self.send_queue_size == 0 {
            constants::IKCP_QUEUE_SIZE
        } else {
            self.send_queue_size
        }
    }

    pub fn effective_receive_queue_size(&self) -> usize {
        if self.receive_queue_size == 0 {
            constants::IKCP_QUEUE_SIZE
        } else {
            self.receive_queue_size
        }
    }

    /// Payload bytes per segment after the header and reserved space
    pub fn mss(&self) -> usize {
        (self.mtu as usize)
            .saturating_sub(header_length(self.conversation_id.is_some()))
            .saturating_sub(self.pre_buffer_size as usize)
            .saturating_sub(self.post_buffer_size as usize)
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        if self.mtu < constants::IKCP_MTU_MIN || self.mtu > 65535 {
            return Err(KcpError::config("MTU must be between 50 and 65535"));
        }
        let reserved = self.pre_buffer_size as usize + self.post_buffer_size as usize;
        let header = header_length(self.conversation_id.is_some());
        if reserved >= self.mtu as usize - header {
            // mtu >= 50 > header length, checked above
            return Err(KcpError::config(
                "Reserved buffer space leaves no room for the KCP header",
            ));
        }
        if let Some(ka) = self.keep_alive {
            if ka.send_interval.is_zero() || ka.grace_period.is_zero() {
                return Err(KcpError::config("Keep-alive intervals must be greater than 0"));
            }
            if exceeds_clock_range(ka.send_interval) || exceeds_clock_range(ka.grace_period) {
                return Err(KcpError::config("Keep-alive intervals must fit the 32-bit millisecond clock"));
            }
        }
        if let Some(rwn) = self.receive_window_notification {
            if rwn.initial_interval.is_zero() || rwn.maximum_interval < rwn.initial_interval {
                return Err(KcpError::config(
                    "Receive window notification intervals must satisfy 0 < initial <= maximum",
                ));
            }
            if exceeds_clock_range(rwn.maximum_interval) {
                return Err(KcpError::config(
                    "Receive window notification interval must fit the 32-bit millisecond clock",
                ));
            }
        }
        Ok(())
    }
}

/// Timestamps wrap at 2^32 ms and are compared as signed differences, so
/// intervals must stay below 2^31 ms.
fn exceeds_clock_range(interval: Duration) -> bool {
    interval.as_millis() > i32::MAX as u128
}

fn non_zero_or(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = KcpConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.mss(), 1380);
        assert_eq!(config.effective_interval(), 100);
    }

    #[test]
    fn test_mtu_bounds() {
        assert!(KcpConfig::new().mtu(49).validate().is_err());
        assert!(KcpConfig::new().mtu(50).validate().is_ok());
    }

    #[test]
    fn test_reserved_space_must_leave_room() {
        let config = KcpConfig::new().mtu(100).reserved_space(40, 40);
        assert!(config.validate().is_err());

        let config = KcpConfig::new().mtu(100).reserved_space(8, 4);
        assert!(config.validate().is_ok());
        assert_eq!(config.mss(), 68);

        let config = config.conversation_id(9);
        assert_eq!(config.mss(), 60);
    }

    #[test]
    fn test_intervals_must_fit_clock() {
        let month = Duration::from_secs(30 * 24 * 3600);
        let config = KcpConfig::new().keep_alive(Some(KeepAliveConfig::new(
            Duration::from_secs(60),
            month,
        )));
        assert!(matches!(config.validate(), Err(KcpError::Config { .. })));

        let config = KcpConfig::new().receive_window_notification(Some(
            ReceiveWindowNotificationConfig::new(Duration::from_secs(1), month),
        ));
        assert!(config.validate().is_err());

        let config = KcpConfig::new().keep_alive(Some(KeepAliveConfig::new(
            Duration::from_secs(60),
            Duration::from_millis(i32::MAX as u64),
        )));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallbacks() {
        let config = KcpConfig::new()
            .window_size(0, 0)
            .queue_size(0, 0)
            .nodelay_config(NodeDelayConfig::custom(true, 5, 2, false));
        assert_eq!(config.effective_snd_wnd(), 32);
        assert_eq!(config.effective_rcv_wnd(), 128);
        assert_eq!(config.effective_send_queue_size(), 32);
        assert_eq!(config.effective_interval(), 100);
    }
}
