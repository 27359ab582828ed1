//! Per control connection channel table
//!
//! Every channel moves through an explicit state machine:
//!
//! ```text
//! Pending -> Matched -> Streaming -> Closed
//!    \
//!     -> TimedOut
//! ```
//!
//! Only `Pending`, `Matched` and `Streaming` channels occupy a slot. Reaching
//! `Closed` or `TimedOut` removes the slot, which frees the channel ID. All
//! transitions happen under the slot's map entry lock, so two racing
//! transitions on one ID are applied one after the other.

use backhaul_proto::ChannelId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bridge::DataConnection;
use crate::error::MatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Matched,
    Streaming,
    Closed,
    TimedOut,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Pending => "Pending",
            ChannelState::Matched => "Matched",
            ChannelState::Streaming => "Streaming",
            ChannelState::Closed => "Closed",
            ChannelState::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

struct ChannelSlot {
    created_at: Instant,
    state: ChannelState,
    waiter: Option<oneshot::Sender<DataConnection>>,
}

/// Channels of one control connection, keyed by ID
#[derive(Clone, Default)]
pub struct ChannelTable {
    slots: Arc<DashMap<ChannelId, ChannelSlot>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `channel_id` as a new pending channel
    ///
    /// Returns `None` if the ID is already occupied. The receiver yields the
    /// data connection once one is matched to the channel.
    pub fn insert_pending(&self, channel_id: ChannelId) -> Option<oneshot::Receiver<DataConnection>> {
        match self.slots.entry(channel_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(ChannelSlot {
                    created_at: Instant::now(),
                    state: ChannelState::Pending,
                    waiter: Some(tx),
                });
                debug!("Channel {} -> {}", channel_id, ChannelState::Pending);
                Some(rx)
            }
        }
    }

    /// Match a data connection to a pending channel and wake its waiter
    ///
    /// On rejection the connection is handed back so the caller can close it.
    pub fn try_match(
        &self,
        channel_id: ChannelId,
        connection: DataConnection,
    ) -> Result<(), (MatchError, DataConnection)> {
        let waiter = {
            let Some(mut slot) = self.slots.get_mut(&channel_id) else {
                return Err((MatchError::UnknownChannel(channel_id), connection));
            };
            if slot.state != ChannelState::Pending {
                return Err((MatchError::AlreadyMatched(channel_id), connection));
            }
            slot.state = ChannelState::Matched;
            debug!(
                "Channel {} -> {} after {:?}",
                channel_id,
                ChannelState::Matched,
                slot.created_at.elapsed()
            );
            slot.waiter.take()
        };

        let delivered = match waiter {
            Some(tx) => tx.send(connection),
            None => Err(connection),
        };

        delivered.map_err(|connection| {
            // Nobody is left to take the connection
            self.remove_matched(channel_id);
            warn!("Channel {} abandoned before delivery", channel_id);
            (MatchError::Abandoned(channel_id), connection)
        })
    }

    /// Drop a slot that is still in `Matched`, leaving a newer reservation
    /// of the same ID alone
    fn remove_matched(&self, channel_id: ChannelId) -> bool {
        self.slots
            .remove_if(&channel_id, |_, slot| slot.state == ChannelState::Matched)
            .is_some()
    }

    /// `Pending -> TimedOut`; returns false if the channel is no longer pending
    pub fn expire(&self, channel_id: ChannelId) -> bool {
        let expired = self
            .slots
            .remove_if(&channel_id, |_, slot| slot.state == ChannelState::Pending)
            .is_some();
        if expired {
            debug!("Channel {} -> {}", channel_id, ChannelState::TimedOut);
        }
        expired
    }

    /// `Matched -> Streaming`
    pub fn mark_streaming(&self, channel_id: ChannelId) -> bool {
        match self.slots.get_mut(&channel_id) {
            Some(mut slot) if slot.state == ChannelState::Matched => {
                slot.state = ChannelState::Streaming;
                debug!("Channel {} -> {}", channel_id, ChannelState::Streaming);
                true
            }
            _ => false,
        }
    }

    /// Any state -> `Closed`, freeing the ID
    pub fn release(&self, channel_id: ChannelId) {
        if let Some((_, slot)) = self.slots.remove(&channel_id) {
            debug!(
                "Channel {} {} -> {} after {:?}",
                channel_id,
                slot.state,
                ChannelState::Closed,
                slot.created_at.elapsed()
            );
        }
    }

    /// Drop every pending channel; their waiters observe a closed receiver
    pub fn abandon_pending(&self) -> usize {
        let mut abandoned = 0;
        self.slots.retain(|_, slot| {
            let keep = slot.state != ChannelState::Pending;
            if !keep {
                abandoned += 1;
            }
            keep
        });
        abandoned
    }

    pub fn contains(&self, channel_id: ChannelId) -> bool {
        self.slots.contains_key(&channel_id)
    }

    pub fn state(&self, channel_id: ChannelId) -> Option<ChannelState> {
        self.slots.get(&channel_id).map(|slot| slot.state)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Ownership of a matched channel's ID
///
/// Dropping the lease closes the channel and frees the ID.
pub struct ChannelLease {
    channel_id: ChannelId,
    table: ChannelTable,
}

impl ChannelLease {
    pub(crate) fn new(table: ChannelTable, channel_id: ChannelId) -> Self {
        Self { channel_id, table }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn mark_streaming(&self) -> bool {
        self.table.mark_streaming(self.channel_id)
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.table.release(self.channel_id);
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}
