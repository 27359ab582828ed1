//! Control plane configuration

use std::time::Duration;

/// Settings for registration and channel brokering
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Shared secret agents must present; `None` admits any agent
    pub shared_key: Option<String>,

    /// Deadline for a data connection to answer a channel-open command
    pub channel_open_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shared_key: None,
            channel_open_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Set the shared key (an empty key disables authentication)
    pub fn with_shared_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.shared_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_channel_open_timeout(mut self, timeout: Duration) -> Self {
        self.channel_open_timeout = timeout;
        self
    }
}

/// Per control connection settings
#[derive(Debug, Clone)]
pub struct ControlConnectionConfig {
    /// Interval between keep-alive pings sent to the agent
    pub keep_alive_interval: Duration,

    /// Close the connection if the agent sends nothing for this long
    pub idle_timeout: Duration,

    /// How long `close` waits for the close handshake before dropping the socket
    pub close_grace: Duration,

    /// Commands queued for the writer task before senders wait
    pub command_queue_capacity: usize,
}

impl Default for ControlConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            close_grace: Duration::from_secs(2),
            command_queue_capacity: 64,
        }
    }
}

impl ControlConnectionConfig {
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_shared_key_disables_auth() {
        let config = BrokerConfig::default().with_shared_key("");
        assert!(config.shared_key.is_none());

        let config = BrokerConfig::default().with_shared_key("secret");
        assert_eq!(config.shared_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_defaults() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.channel_open_timeout, Duration::from_secs(10));

        let control = ControlConnectionConfig::default();
        assert!(control.idle_timeout > control.keep_alive_interval);
        assert!(control.command_queue_capacity > 0);
    }
}
