#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::server::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection registry is shut down")]
pub struct RegistryClosed;

/// Live sessions: one per non-anonymous user id, plus an unkeyed set of
/// anonymous sessions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	by_user: HashMap<String, Arc<Connection>>,
	anonymous: HashMap<u64, Arc<Connection>>,
	shut_down: bool,
}

impl ConnectionRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Insert `conn`. For a keyed user, the session it replaces is returned;
	/// the caller closes it after this returns, outside the registry lock.
	pub fn register(&self, conn: Arc<Connection>) -> Result<Option<Arc<Connection>>, RegistryClosed> {
		let mut inner = self.inner.lock();
		if inner.shut_down {
			return Err(RegistryClosed);
		}

		let previous = if conn.is_anonymous() {
			inner.anonymous.insert(conn.id(), conn);
			None
		} else {
			inner.by_user.insert(conn.user().to_string(), conn)
		};

		metrics::gauge!("lipwig_registered_sessions").set((inner.by_user.len() + inner.anonymous.len()) as f64);
		Ok(previous)
	}

	/// Remove `conn`, but only if the registry still points at this exact
	/// session. A superseded session must not evict its successor.
	pub fn deregister(&self, conn: &Connection) -> bool {
		let mut inner = self.inner.lock();
		let removed = if conn.is_anonymous() {
			inner.anonymous.remove(&conn.id()).is_some()
		} else if inner.by_user.get(conn.user()).is_some_and(|c| c.id() == conn.id()) {
			inner.by_user.remove(conn.user()).is_some()
		} else {
			false
		};

		if removed {
			metrics::gauge!("lipwig_registered_sessions").set((inner.by_user.len() + inner.anonymous.len()) as f64);
		}
		removed
	}

	pub fn lookup(&self, user: &str) -> Option<Arc<Connection>> {
		self.inner.lock().by_user.get(user).cloned()
	}

	pub fn len(&self) -> usize {
		let inner = self.inner.lock();
		inner.by_user.len() + inner.anonymous.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn anonymous_len(&self) -> usize {
		self.inner.lock().anonymous.len()
	}

	pub fn is_shut_down(&self) -> bool {
		self.inner.lock().shut_down
	}

	/// Refuse further registrations and hand back every tracked session so
	/// the caller can close them without holding the lock.
	pub fn shutdown(&self) -> Vec<Arc<Connection>> {
		let mut inner = self.inner.lock();
		inner.shut_down = true;
		let mut all = inner.by_user.drain().map(|(_, c)| c).collect::<Vec<_>>();
		all.extend(inner.anonymous.drain().map(|(_, c)| c));
		all
	}
}
