//! Stream tuning knobs.

use std::time::Duration;

use protocol::DEFAULT_MAX_WRITE_SIZE;

/// Configuration for a message stream's chunking and retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Largest chunk payload written per frame, in bytes.
    ///
    /// Starts at the conservative link default; the connection driver raises
    /// it when the transport reports a larger MTU.
    pub max_write_size: usize,
    /// How many times an unacknowledged frame is rewritten before the
    /// message is abandoned.
    pub retry_limit: u32,
    /// How long to wait for an ACK before rewriting a frame.
    pub retry_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            retry_limit: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl StreamConfig {
    pub fn with_max_write_size(mut self, max_write_size: usize) -> Self {
        self.max_write_size = max_write_size;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.max_write_size, 20);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_setters() {
        let config = StreamConfig::default()
            .with_max_write_size(180)
            .with_retry_limit(3)
            .with_retry_delay(Duration::from_millis(500));
        assert_eq!(config.max_write_size, 180);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
    }
}
