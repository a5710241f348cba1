use crate::error::MessagingError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Per-target connection cache owned by a sender-side driver.
///
/// A connection is opened the first time a target is addressed and reused
/// afterwards. The owning driver evicts it with [`ConnectionPool::remove`]
/// when a timeout or I/O error leaves the stream at an unknown frame offset,
/// and drops everything on disconnect.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    connections: HashMap<u32, C>,
}

impl<C> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConnectionPool<C> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Return the connection for `target`, opening it with `connect` if absent.
    pub async fn get_or_connect<F, Fut>(
        &mut self,
        target: u32,
        connect: F,
    ) -> Result<&mut C, MessagingError>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<C, MessagingError>>,
    {
        match self.connections.entry(target) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let connection = connect(target).await?;
                debug!("Opened pooled connection for target {}", target);
                Ok(entry.insert(connection))
            }
        }
    }

    pub fn get_mut(&mut self, target: u32) -> Option<&mut C> {
        self.connections.get_mut(&target)
    }

    pub fn remove(&mut self, target: u32) -> Option<C> {
        let removed = self.connections.remove(&target);
        if removed.is_some() {
            debug!("Evicted pooled connection for target {}", target);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, target: u32) -> bool {
        self.connections.contains_key(&target)
    }
}
