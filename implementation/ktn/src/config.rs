use std::time::Duration;

/// How often a single data unit or control packet is transmitted before the
/// peer is considered gone.
pub const MAX_RESENDS: usize = 5;

/// How many receive timeouts in a row `receive` tolerates.
pub const MAX_RECEIVES: usize = 5;

/// The deadline of a single blocking receive on the transport.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// The quiescence interval spent in TIME_WAIT (twice the maximum segment
/// lifetime).
pub const TIME_WAIT: Duration = Duration::from_secs(2);

/// Tunables of a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Config {
    /// Maximum number of transmissions per data unit or control packet.
    pub max_resends: usize,

    /// Maximum number of consecutive receive timeouts.
    pub max_receives: usize,

    /// Receive deadline handed to transports built from this config.
    pub recv_timeout: Duration,

    /// Time spent in TIME_WAIT.
    pub time_wait: Duration,
}

impl Config {
    /// Constructs the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the resend budget.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    pub fn max_resends(mut self, n: usize) -> Self {
        assert!(n > 0, "at least one transmission is required");
        self.max_resends = n;
        self
    }

    /// Sets the receive retry budget.
    pub fn max_receives(mut self, n: usize) -> Self {
        self.max_receives = n;
        self
    }

    /// Sets the transport receive deadline.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Sets the TIME_WAIT interval.
    pub fn time_wait(mut self, interval: Duration) -> Self {
        self.time_wait = interval;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_resends: MAX_RESENDS,
            max_receives: MAX_RECEIVES,
            recv_timeout: RECV_TIMEOUT,
            time_wait: TIME_WAIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();

        assert_eq!(config.max_resends, 5);
        assert_eq!(config.max_receives, 5);
        assert_eq!(config.recv_timeout, Duration::from_secs(1));
    }

    #[test]
    fn builder() {
        let config = Config::new()
            .max_resends(3)
            .time_wait(Duration::from_millis(10));

        assert_eq!(config.max_resends, 3);
        assert_eq!(config.max_receives, MAX_RECEIVES);
        assert_eq!(config.time_wait, Duration::from_millis(10));
    }

    #[test]
    #[should_panic]
    fn zero_resends() {
        Config::new().max_resends(0);
    }
}
