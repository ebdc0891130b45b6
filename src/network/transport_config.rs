use std::time::Duration;
use anyhow::bail;


#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// number of automatic retries after a failed outgoing TCP connect. Retries are internal to
    ///  the connection; once they are exhausted, the connection stays disconnected until the next
    ///  send triggers a fresh attempt
    pub connect_retries: u32,
    pub connect_retry_backoff: Duration,

    /// Payload bytes per UDP chunk. The default stays below the 576 byte minimum datagram size
    ///  every IPv4 host must accept, minus IP and UDP headers.
    pub udp_chunk_size: usize,

    /// frames declaring a longer payload are treated as a protocol error
    pub max_frame_len: usize,

    /// sleep between checks while a blocking send waits for the write queue to drain
    pub block_poll_interval: Duration,
    /// idle sleep of the master post office's inbound loop when no data is available
    pub receive_poll_interval: Duration,

    /// Capacity of each queue's inbound channel. Data arriving while it is full is dropped:
    ///  this is a best-effort transport.
    pub inbound_queue_capacity: usize,

    /// partial UDP reassemblies older than this are evicted on the next insertion
    pub reassembly_ttl: Duration,
    /// upper bound for the number of partial UDP reassemblies per connection, evicting the oldest
    pub max_pending_reassemblies: usize,
    /// chunks declaring a larger total are dropped on receipt
    pub max_chunks_per_message: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        let udp_chunk_size = 508;
        let max_frame_len = 64*1024*1024;

        TransportConfig {
            connect_retries: 3,
            connect_retry_backoff: Duration::from_secs(2),
            udp_chunk_size,
            max_frame_len,
            block_poll_interval: Duration::from_millis(10),
            receive_poll_interval: Duration::from_millis(10),
            inbound_queue_capacity: 4096,
            reassembly_ttl: Duration::from_secs(30),
            max_pending_reassemblies: 1024,
            max_chunks_per_message: max_frame_len.div_ceil(udp_chunk_size),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_chunk_size == 0 {
            bail!("UDP chunk size must be positive");
        }
        if self.inbound_queue_capacity == 0 {
            bail!("inbound queue capacity must be positive");
        }
        if self.max_pending_reassemblies == 0 {
            bail!("max pending reassemblies must be positive");
        }
        if self.max_chunks_per_message == 0 {
            bail!("max chunks per message must be positive");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TransportConfig::new().validate().is_ok());
    }

    #[test]
    fn test_default_chunk_limit_covers_max_frame() {
        let config = TransportConfig::new();
        assert_eq!(config.max_chunks_per_message, 132_105);
        assert!(config.max_chunks_per_message * config.udp_chunk_size >= config.max_frame_len);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = TransportConfig::new();
        config.udp_chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
