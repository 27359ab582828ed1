//! Reconnection with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
    /// Give up after this many consecutive retries (None = never)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks consecutive failures and the delay before the next attempt
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current backoff, unless cancelled first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return Err(ReconnectError::MaxAttemptsReached(self.attempt));
            }
        }
        self.attempt += 1;

        let delay = self.current_backoff;
        debug!("Reconnecting in {:?} (attempt {})", delay, self.attempt);

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        self.current_backoff = delay.mul_f64(self.config.multiplier).min(self.config.max_backoff);
        Ok(())
    }

    /// Forget past failures after a connection succeeded
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Connection re-established after {} attempt(s)", self.attempt);
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
