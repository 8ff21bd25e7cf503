use crate::mac::MacAddress;
use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;
use std::os::fd::RawFd;

/// Identity of a connected client; the descriptor of its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub RawFd);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live clients plus the MAC -> clients subscription index.
///
/// The registry owns each client's connection `C`. `remove` hands it back so
/// the caller decides when it is closed; nothing here performs I/O.
pub struct ClientRegistry<C> {
    clients: HashMap<ClientId, C>,
    subscriptions: HashMap<MacAddress, HashSet<ClientId>>,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            clients: HashMap::default(),
            subscriptions: HashMap::default(),
        }
    }
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false and leaves the existing entry alone if `id` is known.
    pub fn add(&mut self, id: ClientId, conn: C) -> bool {
        if self.clients.contains_key(&id) {
            return false;
        }
        self.clients.insert(id, conn);
        true
    }

    /// Drops `id` from the client set and from every subscription.
    /// Unknown ids are ignored.
    pub fn remove(&mut self, id: ClientId) -> Option<C> {
        let conn = self.clients.remove(&id);
        self.subscriptions.retain(|_, subs| {
            subs.remove(&id);
            !subs.is_empty()
        });
        conn
    }

    /// Records interest of `id` in `mac`. Registering a pair twice is a no-op.
    /// Returns false when `id` is not connected.
    pub fn register(&mut self, mac: MacAddress, id: ClientId) -> bool {
        if !self.clients.contains_key(&id) {
            return false;
        }
        self.subscriptions.entry(mac).or_default().insert(id);
        true
    }

    /// Snapshot of the subscribers of `mac`, detached from the index.
    pub fn subscribers_for(&self, mac: &MacAddress) -> Vec<ClientId> {
        self.subscriptions
            .get(mac)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&C> {
        self.clients.get(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(HashSet::len).sum()
    }

    /// Empties the registry, returning every connection.
    pub fn drain(&mut self) -> Vec<(ClientId, C)> {
        self.subscriptions.clear();
        self.clients.drain().collect()
    }
}
