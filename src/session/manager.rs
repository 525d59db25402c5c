//! The session table (C3): the engine's three mutually consistent indexes
//! over [`Session`], grounded on `session::manager::SessionManager`'s single
//! `HashMap` but split three ways per spec §3's invariants, with
//! `by_transport` as the sole owner (invariant 3) and `by_host`/`by_channel`
//! as pure lookup indexes (invariant 1, 2).

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{Session, SessionRef};
use crate::creds::Credentials;
use crate::transport::{AgentTransport, TransportId};

#[derive(Default)]
pub struct SessionTable {
    by_host: HashMap<String, SessionRef>,
    by_channel: HashMap<String, SessionRef>,
    by_transport: HashMap<TransportId, SessionRef>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new session and insert it into `by_transport` (owning)
    /// and, unless private, into `by_host`.
    pub fn track(
        &mut self,
        host: String,
        primary: bool,
        private: bool,
        creds: Credentials,
        transport: Rc<dyn AgentTransport>,
    ) -> SessionRef {
        let id = transport.id();
        let session = Rc::new(std::cell::RefCell::new(Session::new(
            host.clone(),
            primary,
            private,
            creds,
            transport,
        )));
        self.by_transport.insert(id, session.clone());
        if !private {
            self.by_host.insert(host, session.clone());
        }
        session
    }

    pub fn by_host(&self, host: &str) -> Option<SessionRef> {
        self.by_host.get(host).cloned()
    }

    pub fn by_channel(&self, channel: &str) -> Option<SessionRef> {
        self.by_channel.get(channel).cloned()
    }

    pub fn by_transport(&self, id: TransportId) -> Option<SessionRef> {
        self.by_transport.get(&id).cloned()
    }

    /// Insert `channel` into both `by_channel` and the session's own
    /// `channels` set, and cancel any pending idle timer.
    pub fn add_channel(&mut self, session: &SessionRef, channel: String) {
        session.borrow_mut().channels.insert(channel.clone());
        self.by_channel.insert(channel, session.clone());
        session.borrow().idle_deadline.set(None);
    }

    /// Remove `channel` from both indexes. If the session now has no open
    /// channels, arm its idle timer for `idle_timeout` from `now`.
    pub fn remove_channel(
        &mut self,
        session: &SessionRef,
        channel: &str,
        idle_timeout: Duration,
        now: Instant,
    ) {
        session.borrow_mut().channels.remove(channel);
        self.by_channel.remove(channel);
        if session.borrow().channels.is_empty() {
            session.borrow().idle_deadline.set(Some(now + idle_timeout));
        }
    }

    /// Purge every entry the session owns from all three maps. This is the
    /// only function allowed to remove a session, per spec §9's "single
    /// `destroy(session)` routine" recommendation.
    pub fn destroy(&mut self, session: &SessionRef) {
        let (host, private, transport_id, channels) = {
            let s = session.borrow();
            (
                s.host.clone(),
                s.private,
                s.transport.id(),
                s.channels.iter().cloned().collect::<Vec<_>>(),
            )
        };
        for channel in channels {
            self.by_channel.remove(&channel);
        }
        if !private {
            if matches!(self.by_host.get(&host), Some(cur) if Rc::ptr_eq(cur, session)) {
                self.by_host.remove(&host);
            }
        }
        self.by_transport.remove(&transport_id);
    }

    /// The earliest pending idle-timer deadline across all sessions, used
    /// by the service's event loop to size its next `sleep_until`.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        self.by_transport
            .values()
            .filter_map(|s| s.borrow().idle_deadline.get())
            .min()
    }

    /// Sessions whose idle timer has fired (deadline <= `now`), disarming
    /// each one's timer so it fires exactly once per idle period.
    pub fn expire_idle(&self, now: Instant) -> Vec<SessionRef> {
        self.by_transport
            .values()
            .filter(|s| {
                let fired = matches!(s.borrow().idle_deadline.get(), Some(d) if d <= now);
                if fired {
                    s.borrow().idle_deadline.set(None);
                }
                fired
            })
            .cloned()
            .collect()
    }

    /// Snapshot every `(channel, session)` pair whose channel belongs to
    /// `scope` (the socket's `"N:"` prefix), for the closing socket's
    /// close-and-broadcast step (spec §4.6's `on_closing`).
    pub fn channels_in_scope(&self, scope: &str) -> Vec<(String, SessionRef)> {
        self.by_channel
            .iter()
            .filter(|(channel, _)| channel.starts_with(scope))
            .map(|(channel, session)| (channel.clone(), session.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRef> {
        self.by_transport.values()
    }

    pub fn primary(&self) -> Option<SessionRef> {
        self.by_transport
            .values()
            .find(|s| s.borrow().primary)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_transport.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_transport.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn creds() -> Credentials {
        Credentials::new("admin", None, "localhost")
    }

    #[test]
    fn track_indexes_by_host_and_transport() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        let session = table.track(
            "h1".into(),
            false,
            false,
            creds(),
            transport.clone() as Rc<dyn AgentTransport>,
        );
        assert!(table.by_host("h1").is_some());
        assert!(table.by_transport(transport.id()).is_some());
        assert!(Rc::ptr_eq(&table.by_host("h1").unwrap(), &session));
    }

    #[test]
    fn private_sessions_are_not_indexed_by_host() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        table.track("h1".into(), false, true, creds(), transport as Rc<dyn AgentTransport>);
        assert!(table.by_host("h1").is_none());
    }

    #[test]
    fn add_then_remove_channel_arms_idle_timer() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        let session = table.track("h1".into(), false, false, creds(), transport as Rc<dyn AgentTransport>);
        table.add_channel(&session, "1:a".into());
        assert_eq!(session.borrow().idle_deadline.get(), None);
        assert!(table.by_channel("1:a").is_some());

        let now = Instant::now();
        table.remove_channel(&session, "1:a", Duration::from_secs(30), now);
        assert!(table.by_channel("1:a").is_none());
        assert!(session.borrow().idle_deadline.get().unwrap() > now);
    }

    #[test]
    fn add_channel_cancels_pending_idle_timer() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        let session = table.track("h1".into(), false, false, creds(), transport as Rc<dyn AgentTransport>);
        table.add_channel(&session, "1:a".into());
        table.remove_channel(&session, "1:a", Duration::from_secs(30), Instant::now());
        assert!(session.borrow().idle_deadline.get().is_some());

        table.add_channel(&session, "1:b".into());
        assert_eq!(session.borrow().idle_deadline.get(), None);
    }

    #[test]
    fn expire_idle_disarms_so_it_fires_once() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        let session = table.track("h1".into(), false, false, creds(), transport as Rc<dyn AgentTransport>);
        table.add_channel(&session, "1:a".into());
        table.remove_channel(&session, "1:a", Duration::from_secs(0), Instant::now());

        let now = Instant::now();
        assert_eq!(table.expire_idle(now).len(), 1);
        assert_eq!(session.borrow().idle_deadline.get(), None);
        assert!(table.expire_idle(now).is_empty());
    }

    #[test]
    fn destroy_purges_every_index() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        let session = table.track("h1".into(), false, false, creds(), transport.clone() as Rc<dyn AgentTransport>);
        table.add_channel(&session, "1:a".into());
        table.add_channel(&session, "1:b".into());

        table.destroy(&session);
        assert!(table.by_host("h1").is_none());
        assert!(table.by_channel("1:a").is_none());
        assert!(table.by_channel("1:b").is_none());
        assert!(table.by_transport(transport.id()).is_none());
    }

    #[test]
    fn two_opens_for_same_host_share_one_session() {
        let mut table = SessionTable::new();
        let transport = MockTransport::new();
        if table.by_host("h1").is_none() {
            table.track("h1".into(), false, false, creds(), transport as Rc<dyn AgentTransport>);
        }
        let again = table.by_host("h1");
        assert!(again.is_some());
        assert_eq!(table.len(), 1);
    }
}
