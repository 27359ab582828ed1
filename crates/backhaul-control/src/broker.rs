//! Channel brokering between inbound requests and agent data connections

use backhaul_proto::ChannelId;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::{bridge, BridgeResult, DataConnection};
use crate::channel::{ChannelLease, ChannelTable};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, MatchError};
use crate::registry::ConnectionRegistry;

/// Opens channels to agents and matches their data connections
pub struct ChannelBroker {
    registry: Arc<ConnectionRegistry>,
    open_timeout: Duration,
}

/// A matched channel, ready to be bridged to a requester
pub struct ChannelHandle {
    pub domain: String,
    pub channel_id: ChannelId,
    pub upstream: Url,
    pub control_connection_id: String,
    data: DataConnection,
    lease: ChannelLease,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("domain", &self.domain)
            .field("channel_id", &self.channel_id)
            .field("upstream", &self.upstream.as_str())
            .field("data", &self.data)
            .finish()
    }
}

impl ChannelHandle {
    pub fn data_connection(&self) -> &DataConnection {
        &self.data
    }

    /// Stream bytes between the requester and the agent until either closes
    ///
    /// The channel is closed and its ID freed when this returns.
    pub async fn bridge<S>(self, requester: S) -> BridgeResult
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ChannelHandle {
            domain,
            channel_id,
            data,
            lease,
            ..
        } = self;

        lease.mark_streaming();
        let connection_id = data.connection_id.clone();
        let result = bridge(requester, data.into_stream()).await;

        info!(
            domain = %domain,
            channel_id = channel_id,
            connection_id = %connection_id,
            bytes_to_agent = result.a_to_b,
            bytes_from_agent = result.b_to_a,
            "Channel closed"
        );
        if let Some(e) = &result.error {
            debug!("[{}] Bridge ended with error: {}", connection_id, e);
        }

        drop(lease);
        result
    }
}

/// Removes a reserved channel that never produced a handle
struct PendingGuard {
    table: ChannelTable,
    channel_id: ChannelId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) -> ChannelLease {
        self.armed = false;
        ChannelLease::new(self.table.clone(), self.channel_id)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            // No lease exists yet, so whatever state the slot reached is ours to drop
            self.table.release(self.channel_id);
        }
    }
}

enum Wake {
    Delivered(Result<DataConnection, oneshot::error::RecvError>),
    Disconnected,
    Deadline,
}

/// Turn whatever ended the wait into the delivered connection or an error
///
/// Disconnect and deadline only fail the open if the channel can still be
/// expired. A channel that was matched first is taken from `rx` instead, so
/// the caller ends up with exactly one of the handle or the error.
async fn settle(
    wake: Wake,
    table: &ChannelTable,
    channel_id: ChannelId,
    rx: oneshot::Receiver<DataConnection>,
    domain: &str,
) -> Result<DataConnection, BrokerError> {
    let failure = match wake {
        Wake::Delivered(result) => {
            return result.map_err(|_| BrokerError::AgentDisconnected(domain.to_string()))
        }
        Wake::Disconnected => BrokerError::AgentDisconnected(domain.to_string()),
        Wake::Deadline => BrokerError::ChannelTimeout {
            domain: domain.to_string(),
            channel_id,
        },
    };

    if table.expire(channel_id) {
        return Err(failure);
    }
    // Matched before the wake-up was observed
    rx.await.map_err(|_| failure)
}

impl ChannelBroker {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &BrokerConfig) -> Self {
        Self {
            registry,
            open_timeout: config.channel_open_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Open a channel to the agent serving `domain` using the configured deadline
    pub async fn open_channel(&self, domain: &str) -> Result<ChannelHandle, BrokerError> {
        self.open_channel_with_timeout(domain, self.open_timeout)
            .await
    }

    /// Open a channel, waiting at most `timeout` for the agent's data connection
    ///
    /// Dropping the returned future removes the pending channel.
    pub async fn open_channel_with_timeout(
        &self,
        domain: &str,
        timeout: Duration,
    ) -> Result<ChannelHandle, BrokerError> {
        let deadline = Instant::now() + timeout;

        let connection = self
            .registry
            .resolve(domain)
            .ok_or_else(|| BrokerError::DomainNotBound(domain.to_string()))?;
        let domain = connection.domain.clone();

        let (channel_id, mut rx) = connection
            .reserve_channel()
            .ok_or_else(|| BrokerError::ChannelIdsExhausted(domain.clone()))?;
        let guard = PendingGuard {
            table: connection.channels().clone(),
            channel_id,
            armed: true,
        };

        match tokio::time::timeout_at(deadline, connection.send_open_channel(channel_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BrokerError::AgentUnreachable {
                    domain,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(BrokerError::ChannelTimeout { domain, channel_id }),
        }

        debug!(
            "[{}] Waiting for data connection on channel {}",
            connection.connection_id, channel_id
        );

        let wake = tokio::select! {
            result = &mut rx => Wake::Delivered(result),
            _ = connection.wait_closed() => Wake::Disconnected,
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
        };

        let data = match settle(wake, &guard.table, channel_id, rx, &domain).await {
            Ok(data) => data,
            Err(e) => {
                if let BrokerError::ChannelTimeout { .. } = e {
                    warn!(
                        "[{}] Channel {} timed out after {:?}",
                        connection.connection_id, channel_id, timeout
                    );
                }
                return Err(e);
            }
        };

        let lease = guard.disarm();
        info!(
            "[{}] Channel {} matched for {} via {}",
            connection.connection_id, channel_id, domain, data.connection_id
        );

        Ok(ChannelHandle {
            domain,
            channel_id,
            upstream: connection.upstream.clone(),
            control_connection_id: connection.connection_id.clone(),
            data,
            lease,
        })
    }

    /// Hand an agent's data connection to the request waiting on its channel
    ///
    /// A connection carrying a session id that is not the bound control
    /// connection's is refused, even when its channel id is pending. Rejected
    /// connections are shut down before this returns.
    pub async fn match_incoming(
        &self,
        domain: &str,
        channel_id: ChannelId,
        data: DataConnection,
    ) -> Result<(), MatchError> {
        let result = match self.registry.resolve(domain) {
            Some(connection)
                if data
                    .session_id
                    .as_deref()
                    .is_some_and(|session| session != connection.connection_id) =>
            {
                Err((MatchError::StaleSession(channel_id), data))
            }
            Some(connection) => connection.channels().try_match(channel_id, data),
            None => Err((MatchError::UnknownChannel(channel_id), data)),
        };

        match result {
            Ok(()) => Ok(()),
            Err((error, data)) => {
                warn!(
                    "[{}] Rejected data connection for {} channel {}: {}",
                    data.connection_id, domain, channel_id, error
                );
                data.shutdown().await;
                Err(error)
            }
        }
    }
}
