//! Registration tables and the load ordering of servers
//!
//! Every mutation of a server's client set goes through
//! [`Registry::update_server`], which takes the server out of the load
//! ordering, applies the change, and puts it back, so the ordering always
//! matches current membership.

use crate::peer::{ClientPeer, ServerHandle, ACCEPT_UNLIMITED_CLIENTS};
use crate::work::{ItemId, WorkItem};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Capacity stored for servers that accept unlimited clients
pub const DEFAULT_MAX_CLIENTS: u32 = 100_000;

/// Capacity as stored, or `None` if the declared value is invalid
pub fn effective_capacity(declared: i32) -> Option<u32> {
    if declared == ACCEPT_UNLIMITED_CLIENTS {
        Some(DEFAULT_MAX_CLIENTS)
    } else if declared > 0 {
        Some(declared as u32)
    } else {
        None
    }
}

pub struct ClientRecord {
    pub id: u32,
    pub host: String,
    pub peer: Arc<dyn ClientPeer>,
    pub server_id: Option<u32>,
    pub in_flight: HashMap<ItemId, WorkItem>,
    pub keep_alive: Option<JoinHandle<()>>,
}

pub struct ServerRecord {
    pub id: u32,
    pub host: String,
    pub peer: ServerHandle,
    pub max_clients: u32,
    pub accept_only_by_request: bool,
    pub clients: HashSet<u32>,
    pub keep_alive: Option<JoinHandle<()>>,
}

impl ServerRecord {
    pub fn is_full(&self) -> bool {
        self.clients.len() as u64 >= self.max_clients as u64
    }

    pub fn load_key(&self) -> LoadKey {
        LoadKey {
            clients: self.clients.len() as u64,
            max_clients: self.max_clients,
            id: self.id,
        }
    }
}

/// Position of a server in the load ordering
///
/// Ordered by `clients / max_clients` compared exactly, ties broken by id.
#[derive(Debug, Clone, Copy)]
pub struct LoadKey {
    pub clients: u64,
    pub max_clients: u32,
    pub id: u32,
}

impl LoadKey {
    pub fn load_factor(&self) -> f64 {
        self.clients as f64 / self.max_clients.max(1) as f64
    }
}

impl Ord for LoadKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.clients as u128 * other.max_clients as u128;
        let rhs = other.clients as u128 * self.max_clients as u128;
        lhs.cmp(&rhs).then(self.id.cmp(&other.id))
    }
}

impl PartialEq for LoadKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LoadKey {}

impl PartialOrd for LoadKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct Registry {
    pub clients: HashMap<u32, ClientRecord>,
    pub servers: HashMap<u32, ServerRecord>,
    by_load: BTreeSet<LoadKey>,
    next_client_id: u32,
    next_server_id: u32,
}

impl Registry {
    pub fn next_client_id(&mut self) -> u32 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    pub fn next_server_id(&mut self) -> u32 {
        let id = self.next_server_id;
        self.next_server_id += 1;
        id
    }

    pub fn insert_client(&mut self, record: ClientRecord) {
        self.clients.insert(record.id, record);
    }

    pub fn insert_server(&mut self, record: ServerRecord) {
        self.by_load.insert(record.load_key());
        self.servers.insert(record.id, record);
    }

    /// Remove a server from both the table and the load ordering
    pub fn remove_server(&mut self, id: u32) -> Option<ServerRecord> {
        let record = self.servers.remove(&id)?;
        self.by_load.remove(&record.load_key());
        Some(record)
    }

    /// Server ids from least to most loaded
    pub fn servers_by_load(&self) -> Vec<u32> {
        self.by_load.iter().map(|key| key.id).collect()
    }

    /// Apply `change` to a server while keeping the load ordering consistent
    pub fn update_server<R>(
        &mut self,
        id: u32,
        change: impl FnOnce(&mut ServerRecord) -> R,
    ) -> Option<R> {
        let record = self.servers.get_mut(&id)?;
        self.by_load.remove(&record.load_key());
        let result = change(record);
        self.by_load.insert(record.load_key());
        Some(result)
    }

    /// Move a client onto `server_id`, leaving its previous server
    ///
    /// Reassigning a client to the server it already has is a no-op.
    pub fn assign(&mut self, client_id: u32, server_id: u32) {
        let previous = match self.clients.get(&client_id) {
            Some(client) => client.server_id,
            None => return,
        };
        if previous == Some(server_id) {
            return;
        }
        if let Some(old) = previous {
            self.update_server(old, |s| s.clients.remove(&client_id));
        }
        self.update_server(server_id, |s| s.clients.insert(client_id));
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.server_id = Some(server_id);
        }
    }

    /// Drop a client from its server's membership
    pub fn unassign(&mut self, client_id: u32) {
        let previous = self
            .clients
            .get_mut(&client_id)
            .and_then(|c| c.server_id.take());
        if let Some(server_id) = previous {
            self.update_server(server_id, |s| s.clients.remove(&client_id));
        }
    }

    /// Whether the load ordering matches every server's current membership
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.by_load.len() == self.servers.len()
            && self
                .servers
                .values()
                .all(|s| self.by_load.contains(&s.load_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockClient, MockServer};

    fn server(registry: &mut Registry, max_clients: u32) -> u32 {
        let id = registry.next_server_id();
        registry.insert_server(ServerRecord {
            id,
            host: "server.local".to_string(),
            peer: Arc::new(MockServer::new(max_clients as i32)),
            max_clients,
            accept_only_by_request: false,
            clients: HashSet::new(),
            keep_alive: None,
        });
        id
    }

    fn client(registry: &mut Registry) -> u32 {
        let id = registry.next_client_id();
        registry.insert_client(ClientRecord {
            id,
            host: "client.local".to_string(),
            peer: Arc::new(MockClient::new("client.local")),
            server_id: None,
            in_flight: HashMap::new(),
            keep_alive: None,
        });
        id
    }

    #[test]
    fn test_capacity() {
        assert_eq!(effective_capacity(ACCEPT_UNLIMITED_CLIENTS), Some(DEFAULT_MAX_CLIENTS));
        assert_eq!(effective_capacity(3), Some(3));
        assert_eq!(effective_capacity(-2), None);
    }

    #[test]
    fn test_load_key_compares_exact_ratios() {
        let third = LoadKey { clients: 1, max_clients: 3, id: 9 };
        let half = LoadKey { clients: 2, max_clients: 4, id: 0 };
        let also_half = LoadKey { clients: 1, max_clients: 2, id: 1 };
        assert!(third < half);
        assert!(half < also_half);
        assert_eq!(half.load_factor(), 0.5);
    }

    #[test]
    fn test_assignment_reorders_servers() {
        let mut registry = Registry::default();
        let small = server(&mut registry, 2);
        let large = server(&mut registry, 10);
        let c0 = client(&mut registry);
        let c1 = client(&mut registry);

        registry.assign(c0, small);
        assert_eq!(registry.servers_by_load(), vec![large, small]);

        registry.assign(c1, large);
        registry.assign(c0, large);
        assert_eq!(registry.servers[&small].clients.len(), 0);
        assert_eq!(registry.servers[&large].clients.len(), 2);
        assert_eq!(registry.servers_by_load(), vec![small, large]);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_reassign_to_same_server_keeps_membership() {
        let mut registry = Registry::default();
        let s = server(&mut registry, 2);
        let c = client(&mut registry);

        registry.assign(c, s);
        registry.assign(c, s);
        assert!(registry.servers[&s].clients.contains(&c));
        assert_eq!(registry.clients[&c].server_id, Some(s));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_full_server() {
        let mut registry = Registry::default();
        let s = server(&mut registry, 1);
        let c = client(&mut registry);
        assert!(!registry.servers[&s].is_full());
        registry.assign(c, s);
        assert!(registry.servers[&s].is_full());

        registry.unassign(c);
        assert!(!registry.servers[&s].is_full());
        assert_eq!(registry.clients[&c].server_id, None);
        assert!(registry.is_consistent());
    }
}
