//! Who is currently present.

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub username: String,
    pub peer_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} has already announced itself")]
    DuplicateConnection(ConnectionId),
}

/// Announced connections in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    records: Mutex<Vec<ConnectionRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        connection_id: ConnectionId,
        username: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Result<ConnectionRecord, RegistryError> {
        let mut records = self.lock();
        if records.iter().any(|r| r.connection_id == connection_id) {
            return Err(RegistryError::DuplicateConnection(connection_id));
        }

        let record = ConnectionRecord {
            connection_id,
            username: username.into(),
            peer_id: peer_id.into(),
        };
        records.push(record.clone());
        Ok(record)
    }

    /// Removing an absent connection is not an error; `None` just means there was nothing to remove.
    pub fn deregister(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let mut records = self.lock();
        let index = records.iter().position(|r| r.connection_id == connection_id)?;
        Some(records.remove(index))
    }

    /// First match in registration order; peer ids are not unique.
    pub fn find_by_peer_id(&self, peer_id: &str) -> Option<ConnectionRecord> {
        self.lock().iter().find(|r| r.peer_id == peer_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConnectionRecord>> {
        // the vec is never left half-modified, so a poisoned lock is still usable
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
