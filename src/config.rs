use std::time::Duration;

use anyhow::bail;

/// Tuning knobs for one endpoint. Both ends of a connection should run with
///  the same retransmission timeout, the rest is per-endpoint.
#[derive(Clone, Debug)]
pub struct RelSegConfig {
    /// flow control window the server advertises initially, and the upper
    ///  bound on the client's number of un-acked in-flight segments
    pub window: u8,
    /// fixed retransmission timeout, no RTT estimation
    pub retransmission_timeout: Duration,
    /// bound on consecutive retransmissions of the same segment before the
    ///  endpoint gives up on the exchange
    pub retry_count: u32,
    /// quiescence interval after which a driver runs its periodic work when
    ///  no segments are arriving
    pub tick_interval: Duration,
    /// number of payload chunks the client buffers between `send()` and the
    ///  wire
    pub send_backlog_capacity: usize,
    /// how long `recv()` waits for a first payload before returning empty
    pub recv_idle_timeout: Duration,
    /// how long `accept()` waits for a client before giving up
    pub accept_timeout: Duration,
    /// upper bound on how long the server lingers in CLOSING re-acking
    ///  duplicate FINs
    pub teardown_deadline: Duration,
    /// bound on duplicate-FIN re-acks during CLOSING
    pub teardown_retry_count: u32,
}

impl Default for RelSegConfig {
    fn default() -> Self {
        RelSegConfig {
            window: 100,
            retransmission_timeout: Duration::from_millis(100),
            retry_count: 10,
            tick_interval: Duration::from_millis(100),
            send_backlog_capacity: 1000,
            recv_idle_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(20),
            teardown_deadline: Duration::from_secs(30),
            teardown_retry_count: 10,
        }
    }
}

impl RelSegConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            bail!("flow control window must be at least 1");
        }
        if self.retransmission_timeout.is_zero() {
            bail!("retransmission timeout must be positive");
        }
        if self.retry_count == 0 {
            bail!("retry count must be at least 1");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.tick_interval > self.retransmission_timeout {
            bail!("tick interval must not exceed the retransmission timeout, \
                retransmissions would be detected late");
        }
        if self.send_backlog_capacity == 0 {
            bail!("send backlog capacity must be at least 1");
        }
        if self.accept_timeout < self.retransmission_timeout {
            bail!("accept timeout shorter than a single retransmission interval");
        }
        if self.teardown_deadline.is_zero() {
            bail!("teardown deadline must be positive");
        }
        Ok(())
    }
}
