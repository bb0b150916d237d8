use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info};

use crate::types::{AuthorityFlags, AvatarRef, ConnectionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RebindError {
    #[error("connection {0} is not connected")]
    NotConnected(ConnectionId),
    #[error("connection {0} has no avatar to replace")]
    NoAvatar(ConnectionId),
}

/// The networking layer's view of live peers. The transfer core only reads
/// connection attributes and writes the avatar binding and ready flag.
pub trait ConnectionRegistry {
    fn is_connected(&self, connection: ConnectionId) -> bool;
    fn is_authenticated(&self, connection: ConnectionId) -> bool;
    fn avatar(&self, connection: ConnectionId) -> Option<AvatarRef>;
    fn authority(&self, connection: ConnectionId) -> Option<AuthorityFlags>;
    /// Binds `avatar` in place of the current one, keeping the connection's
    /// authority flags. Returns the avatar that was replaced.
    fn rebind_avatar(
        &mut self,
        connection: ConnectionId,
        avatar: AvatarRef,
    ) -> Result<AvatarRef, RebindError>;
    fn set_ready(&mut self, connection: ConnectionId, ready: bool);
    fn drain_disconnects(&mut self, out: &mut Vec<ConnectionId>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub name: Option<String>,
    pub authenticated: bool,
    pub avatar: Option<AvatarRef>,
    pub ready: bool,
    pub authority: AuthorityFlags,
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    connections: BTreeMap<ConnectionId, ConnectionRecord>,
    disconnects: Vec<ConnectionId>,
}

impl InMemoryRegistry {
    pub fn connect(&mut self, connection: ConnectionId) {
        self.connections.insert(
            connection,
            ConnectionRecord {
                name: None,
                authenticated: false,
                avatar: None,
                ready: false,
                authority: AuthorityFlags::default(),
            },
        );
        debug!(connection = %connection, "connection_registered");
    }

    pub fn authenticate(&mut self, connection: ConnectionId, name: &str) -> bool {
        let Some(record) = self.connections.get_mut(&connection) else {
            return false;
        };
        record.authenticated = true;
        record.name = Some(name.to_string());
        info!(connection = %connection, name, "connection_authenticated");
        true
    }

    pub fn bind_avatar(&mut self, connection: ConnectionId, avatar: AvatarRef) -> bool {
        let Some(record) = self.connections.get_mut(&connection) else {
            return false;
        };
        record.avatar = Some(avatar);
        true
    }

    /// Removes the connection and queues a disconnect notification. Returns
    /// the avatar it was bound to.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Option<AvatarRef> {
        let record = self.connections.remove(&connection)?;
        self.disconnects.push(connection);
        info!(connection = %connection, "connection_dropped");
        record.avatar
    }

    pub fn record(&self, connection: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&connection)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    fn is_connected(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    fn is_authenticated(&self, connection: ConnectionId) -> bool {
        self.connections
            .get(&connection)
            .is_some_and(|record| record.authenticated)
    }

    fn avatar(&self, connection: ConnectionId) -> Option<AvatarRef> {
        self.connections.get(&connection)?.avatar
    }

    fn authority(&self, connection: ConnectionId) -> Option<AuthorityFlags> {
        self.connections
            .get(&connection)
            .map(|record| record.authority)
    }

    fn rebind_avatar(
        &mut self,
        connection: ConnectionId,
        avatar: AvatarRef,
    ) -> Result<AvatarRef, RebindError> {
        let record = self
            .connections
            .get_mut(&connection)
            .ok_or(RebindError::NotConnected(connection))?;
        let previous = record.avatar.ok_or(RebindError::NoAvatar(connection))?;
        record.avatar = Some(avatar);
        Ok(previous)
    }

    fn set_ready(&mut self, connection: ConnectionId, ready: bool) {
        if let Some(record) = self.connections.get_mut(&connection) {
            record.ready = ready;
        }
    }

    fn drain_disconnects(&mut self, out: &mut Vec<ConnectionId>) {
        out.append(&mut self.disconnects);
    }
}
