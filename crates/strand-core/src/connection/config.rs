//! Reliable connection tuning.

use std::time::Duration;

/// Reliable connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Receive buffer advertised to the peer, in bytes
    pub receive_window: u16,
    /// Largest payload per segment
    pub mss: usize,
    /// Maximum segment lifetime; `TimeWait` lasts twice as long
    pub msl: Duration,
    /// Give up on unacknowledged data after this long
    pub user_timeout: Duration,
    /// Retransmission timeout before any RTT sample
    pub initial_rto: Duration,
    /// Lower RTO bound
    pub min_rto: Duration,
    /// Upper RTO bound
    pub max_rto: Duration,
    /// SRTT gain
    pub alpha: f64,
    /// RTTVAR gain
    pub beta: f64,
    /// RTTVAR multiplier
    pub k: u32,
    /// Retransmissions of SYN, SYN,ACK or REQ before `HandshakeTimeout`
    pub syn_retries: u32,
    /// Retransmissions of a data segment before `RetransmissionExhausted`
    pub data_retries: u32,
    /// Silence before the first idle probe
    pub probe_interval: Duration,
    /// Unanswered probes before `PeerUnreachable`
    pub probe_limit: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            receive_window: u16::MAX,
            mss: 1200,
            msl: Duration::from_secs(2),
            user_timeout: Duration::from_secs(60),
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
            alpha: 0.125,
            beta: 0.25,
            k: 4,
            syn_retries: 5,
            data_retries: 8,
            probe_interval: Duration::from_secs(15),
            probe_limit: 3,
        }
    }
}

impl ConnectionConfig {
    /// Check the parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.mss == 0 {
            return Err("mss must be positive".into());
        }
        if usize::from(self.receive_window) < self.mss {
            return Err(format!(
                "receive_window {} is smaller than mss {}",
                self.receive_window, self.mss
            ));
        }
        if self.min_rto > self.max_rto {
            return Err("min_rto exceeds max_rto".into());
        }
        if !(0.0..=1.0).contains(&self.alpha) || !(0.0..=1.0).contains(&self.beta) {
            return Err("alpha and beta must be within [0, 1]".into());
        }
        if self.probe_interval.is_zero() {
            return Err("probe_interval must be positive".into());
        }
        Ok(())
    }
}
