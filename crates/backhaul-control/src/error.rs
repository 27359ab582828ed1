//! Control plane errors

use backhaul_proto::ChannelId;
use thiserror::Error;

/// Rejections from [`crate::ConnectionRegistry::register`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Authentication failed for domain {0}")]
    AuthenticationFailed(String),

    #[error("Domain {0} is already bound to another agent")]
    DomainAlreadyBound(String),
}

/// Failures of [`crate::ChannelBroker::open_channel`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("No agent is registered for domain {0}")]
    DomainNotBound(String),

    #[error("Agent for domain {domain} is unreachable: {reason}")]
    AgentUnreachable { domain: String, reason: String },

    #[error("Agent for domain {0} disconnected while a channel was pending")]
    AgentDisconnected(String),

    #[error("Timed out waiting for channel {channel_id} on domain {domain}")]
    ChannelTimeout { domain: String, channel_id: ChannelId },

    #[error("No free channel IDs on the control connection for domain {0}")]
    ChannelIdsExhausted(String),
}

/// Rejections of incoming data connections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Channel {0} is already matched")]
    AlreadyMatched(ChannelId),

    #[error("Channel {0} was abandoned before the data connection arrived")]
    Abandoned(ChannelId),

    #[error("Authentication failed for data connection on channel {0}")]
    AuthenticationFailed(ChannelId),

    #[error("Data connection for channel {0} belongs to an earlier control session")]
    StaleSession(ChannelId),
}

/// Outcome of an agent session that ended in rejection
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Match(#[from] MatchError),
}
