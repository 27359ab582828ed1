//! Domain to control connection registry

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::ControlConnection;
use crate::error::RegistryError;

/// Snapshot of one domain binding
#[derive(Debug, Clone)]
pub struct DomainBinding {
    pub domain: String,
    pub upstream: Url,
    pub connection_id: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Live domain bindings, at most one control connection per domain
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ControlConnection>>,
    shared_key: Option<String>,
}

impl ConnectionRegistry {
    /// Create a registry; an empty or missing key disables authentication
    pub fn new(shared_key: Option<String>) -> Self {
        Self {
            connections: DashMap::new(),
            shared_key: shared_key.filter(|key| !key.is_empty()),
        }
    }

    /// Check a presented credential against the shared key
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        match &self.shared_key {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }

    /// Bind the connection's domain
    ///
    /// The first live registration wins. A rejected connection is closed
    /// with the rejection as its close reason.
    pub async fn register(
        &self,
        credential: Option<&str>,
        connection: Arc<ControlConnection>,
    ) -> Result<(), RegistryError> {
        let result = self.bind(credential, &connection);

        match &result {
            Ok(()) => {
                info!(
                    domain = %connection.domain,
                    connection_id = %connection.connection_id,
                    remote_addr = %connection.remote_addr,
                    "Agent registered"
                );
            }
            Err(e) => {
                warn!(
                    domain = %connection.domain,
                    connection_id = %connection.connection_id,
                    remote_addr = %connection.remote_addr,
                    "Agent registration rejected: {}",
                    e
                );
                connection.close(&e.to_string()).await;
            }
        }

        result
    }

    fn bind(
        &self,
        credential: Option<&str>,
        connection: &Arc<ControlConnection>,
    ) -> Result<(), RegistryError> {
        if !self.authenticate(credential) {
            return Err(RegistryError::AuthenticationFailed(connection.domain.clone()));
        }

        match self.connections.entry(connection.domain.to_ascii_lowercase()) {
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Err(RegistryError::DomainAlreadyBound(connection.domain.clone()));
                }
                debug!(
                    "Replacing closed connection {} for {}",
                    entry.get().connection_id,
                    connection.domain
                );
                entry.insert(connection.clone());
                Ok(())
            }
        }
    }

    /// Look up the live connection bound to a domain
    pub fn resolve(&self, domain: &str) -> Option<Arc<ControlConnection>> {
        let domain = domain.to_ascii_lowercase();
        self.connections
            .get(&domain)
            .map(|entry| entry.value().clone())
            .filter(|connection| !connection.is_closed())
    }

    /// Upstream hint of the agent serving a domain
    pub fn upstream(&self, domain: &str) -> Option<Url> {
        self.resolve(domain).map(|connection| connection.upstream.clone())
    }

    /// Remove the binding, but only if it still belongs to `connection`
    pub fn unregister(&self, domain: &str, connection: &Arc<ControlConnection>) -> bool {
        let domain = domain.to_ascii_lowercase();
        let removed = self
            .connections
            .remove_if(&domain, |_, current| Arc::ptr_eq(current, connection))
            .is_some();
        if removed {
            info!(
                domain = %domain,
                connection_id = %connection.connection_id,
                "Agent unregistered"
            );
        }
        removed
    }

    /// Snapshot of all live bindings
    pub fn list(&self) -> Vec<DomainBinding> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| {
                let connection = entry.value();
                DomainBinding {
                    domain: entry.key().clone(),
                    upstream: connection.upstream.clone(),
                    connection_id: connection.connection_id.clone(),
                    remote_addr: connection.remote_addr,
                    connected_at: connection.connected_at,
                }
            })
            .collect()
    }

    /// Number of live bindings
    pub fn len(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}
