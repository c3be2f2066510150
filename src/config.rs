use crate::types::*;
use anyhow::bail;
use std::time::Duration;

pub struct SockConfig {
    /// The UDP payload size the protocol packs its packets into. The protocol
    /// never sends anything bigger than this, and since message splitting is
    /// not implemented, it also bounds the size of a single message.
    ///
    /// The default is deliberately conservative (the classic 576-byte
    /// minimum-reassembly MTU); on networks known to carry full Ethernet
    /// frames this can be raised to 1472 (IPV4) / 1452 (IPV6).
    pub mtu: usize,

    /// Heartbeats per second while the connection is otherwise idle.
    pub heartbeat_frequency: f64,

    /// Flush ticks per second. Outbound messages are batched until the next
    /// tick (or until a packet fills up, whichever comes first).
    pub tick_frequency: f64,

    /// How long the connection may be silent before it is considered dead.
    pub connection_timeout: Duration,

    /// The timeout for the initial handshake. Usually shorter than
    /// `connection_timeout` so a connect against a dead host fails quickly.
    pub initial_connection_timeout: Duration,

    /// After this many missed heartbeat intervals the delegate gets a
    /// connection-lost warning (followed by connection-regained if traffic
    /// resumes before the timeout proper).
    pub heartbeats_before_connection_warning: f64,

    /// Byte cap for buffered out-of-order messages on reliable ordered
    /// channels. Messages beyond the cap are dropped and recovered via
    /// retransmission.
    pub receiver_buffer_size: usize,

    /// Byte cap for not-yet-acknowledged reliable messages. `send` fails
    /// with `SenderBufferFull` when this is exhausted.
    pub sender_buffer_size: usize,

    /// Whether inbound SYNs may create server connections on this socket.
    pub accept_connections: bool,
}

impl Default for SockConfig {
    fn default() -> SockConfig {
        SockConfig {
            mtu: DEFAULT_MTU,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            tick_frequency: DEFAULT_TICK_FREQUENCY,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            initial_connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            heartbeats_before_connection_warning: DEFAULT_HEARTBEATS_BEFORE_CONNECTION_WARNING,
            receiver_buffer_size: DEFAULT_RECEIVER_BUFFER_SIZE,
            sender_buffer_size: DEFAULT_SENDER_BUFFER_SIZE,
            accept_connections: false,
        }
    }
}

impl SockConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 128 {
            bail!("mtu of {} is too small to fit packet headers and a message", self.mtu);
        }
        if self.heartbeat_frequency <= 0.0 || self.tick_frequency <= 0.0 {
            bail!("heartbeat and tick frequencies must be positive");
        }
        if self.connection_timeout.is_zero() || self.initial_connection_timeout.is_zero() {
            bail!("connection timeouts must be positive");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.heartbeat_frequency)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_frequency)
    }

    pub fn time_before_connection_warning(&self) -> Duration {
        self.heartbeat_interval()
            .mul_f64(self.heartbeats_before_connection_warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SockConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_mtu_is_rejected() {
        let config = SockConfig {
            mtu: 64,
            ..SockConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
