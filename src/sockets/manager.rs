//! The socket table (C4): simpler than the session table since a socket
//! only needs two indexes, and its owning map (`by_connection`) is the only
//! one that ever mutates an entry's lifetime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{Socket, SocketRef};
use crate::scope::ScopeKey;
use crate::socket::{BrowserSocket, SocketId};

#[derive(Default)]
pub struct SocketTable {
    by_scope: HashMap<ScopeKey, SocketRef>,
    by_connection: HashMap<SocketId, SocketRef>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, scope: String, connection: Rc<dyn BrowserSocket>) -> SocketRef {
        let id = connection.id();
        let socket = Rc::new(RefCell::new(Socket {
            scope: scope.clone(),
            connection,
        }));
        self.by_scope.insert(ScopeKey(scope), socket.clone());
        self.by_connection.insert(id, socket.clone());
        socket
    }

    pub fn by_connection(&self, id: SocketId) -> Option<SocketRef> {
        self.by_connection.get(&id).cloned()
    }

    /// Look up the socket owning `global_channel` by comparing only the
    /// scope prefix, per spec §4.2.
    pub fn scope_lookup(&self, global_channel: &str) -> Option<SocketRef> {
        self.by_scope
            .get(&ScopeKey(global_channel.to_string()))
            .cloned()
    }

    /// Remove the socket's entries from both indexes. Only called from
    /// socket destruction (spec §3 lifecycle); does not itself close the
    /// underlying connection.
    pub fn destroy(&mut self, socket: &SocketRef) {
        let scope = socket.borrow().scope.clone();
        let id = socket.borrow().connection.id();
        self.by_scope.remove(&ScopeKey(scope));
        self.by_connection.remove(&id);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketRef> {
        self.by_connection.values()
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSocket;

    #[test]
    fn track_indexes_both_ways() {
        let mut table = SocketTable::new();
        let conn = MockSocket::new();
        let id = conn.id();
        let socket = table.track("7:".into(), conn as Rc<dyn BrowserSocket>);
        assert!(Rc::ptr_eq(&table.by_connection(id).unwrap(), &socket));
        assert!(table.scope_lookup("7:main").is_some());
        assert!(table.scope_lookup("8:main").is_none());
    }

    #[test]
    fn destroy_removes_both_entries() {
        let mut table = SocketTable::new();
        let conn = MockSocket::new();
        let id = conn.id();
        let socket = table.track("7:".into(), conn as Rc<dyn BrowserSocket>);
        table.destroy(&socket);
        assert!(table.by_connection(id).is_none());
        assert!(table.scope_lookup("7:main").is_none());
    }
}
