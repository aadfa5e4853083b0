use std::collections::HashMap;

use manager_sdk::ManagerClient;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{codes, ManagerError, ManagerResult};
use crate::registry::Registry;

/// Clients for peer managers, keyed by manager id and rebuilt when a peer
/// re-registers under a new address.
pub struct ManagerClients {
    registry: Registry,
    http: reqwest::Client,
    clients: Mutex<HashMap<String, ManagerClient>>,
}

impl ManagerClients {
    pub fn new(registry: Registry, http: reqwest::Client) -> Self {
        Self {
            registry,
            http,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// A missing manager row means the owner is gone, which callers treat
    /// the same as an unreachable owner.
    pub async fn get(&self, manager_id: &str) -> ManagerResult<ManagerClient> {
        let manager = self.registry.get_manager(manager_id).await?.ok_or_else(|| {
            ManagerError::internal("owning manager is not registered")
                .with_code(codes::OWNER_UNREACHABLE)
                .with_detail("manager_id", manager_id)
        })?;

        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(manager_id) {
            if client.base_url() == manager.manager_address.trim_end_matches('/') {
                return Ok(client.clone());
            }
        }
        debug!(manager_id, address = %manager.manager_address, "building peer manager client");
        let client = ManagerClient::with_client(self.http.clone(), manager.manager_address);
        clients.insert(manager_id.to_string(), client.clone());
        Ok(client)
    }

    pub fn forget(&self, manager_id: &str) {
        self.clients.lock().remove(manager_id);
    }
}

#[cfg(test)]
mod tests {
    use manager_sdk::registry::{InMemoryRegistryStore, ManagerRecord};

    use super::*;

    #[tokio::test]
    async fn unknown_owner_is_unreachable() {
        let clients = ManagerClients::new(
            Registry::new(InMemoryRegistryStore::new()),
            reqwest::Client::new(),
        );
        let err = clients.get("gone").await.unwrap_err();
        assert!(err.has_code(codes::OWNER_UNREACHABLE));
    }

    #[tokio::test]
    async fn rebuilds_client_when_address_changes() {
        let registry = Registry::new(InMemoryRegistryStore::new());
        let mut record = ManagerRecord {
            id: "m2".into(),
            manager_address: "http://10.0.0.2:8080".into(),
            worker_broker_address: String::new(),
            joined_at: 0,
            last_ping_at: 0,
        };
        registry.create_manager(&record).await.unwrap();
        let clients = ManagerClients::new(registry.clone(), reqwest::Client::new());
        assert_eq!(clients.get("m2").await.unwrap().base_url(), "http://10.0.0.2:8080");

        record.manager_address = "http://10.0.0.3:8080/".into();
        registry.update_manager(&record).await.unwrap();
        assert_eq!(clients.get("m2").await.unwrap().base_url(), "http://10.0.0.3:8080");
    }
}
