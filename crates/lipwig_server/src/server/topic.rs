#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::server::connection::{Connection, ConnectionClosed};

/// Name -> topic map. Topics remove themselves once their last member leaves.
#[derive(Debug, Default)]
pub struct TopicRegistry {
	topics: Mutex<HashMap<String, Arc<Topic>>>,
}

/// A named multicast group.
#[derive(Debug)]
pub struct Topic {
	name: String,
	registry: Weak<TopicRegistry>,
	members: RwLock<Members>,
}

#[derive(Debug, Default)]
struct Members {
	by_conn: HashMap<u64, Member>,
	/// Set once the member map drained to empty. A harvested topic never
	/// accepts members again; callers retry against the registry.
	harvested: bool,
}

#[derive(Debug)]
struct Member {
	conn: Weak<Connection>,
	presence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscribeError {
	#[error("topic was harvested")]
	Harvested,

	#[error(transparent)]
	Closed(#[from] ConnectionClosed),
}

impl TopicRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Lookup only. Harvested topics are reported as absent.
	pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
		let topics = self.topics.lock();
		topics.get(name).filter(|t| !t.is_harvested()).cloned()
	}

	pub fn get_or_create_topic(self: &Arc<Self>, name: &str) -> Arc<Topic> {
		let mut topics = self.topics.lock();
		if let Some(topic) = topics.get(name)
			&& !topic.is_harvested()
		{
			return Arc::clone(topic);
		}

		let topic = Arc::new(Topic {
			name: name.to_string(),
			registry: Arc::downgrade(self),
			members: RwLock::new(Members::default()),
		});
		topics.insert(name.to_string(), Arc::clone(&topic));
		metrics::gauge!("lipwig_topics").set(topics.len() as f64);
		topic
	}

	/// Get-or-create `name` and add `conn` to it. Returns the topic and
	/// whether a new membership was created.
	pub fn subscribe(
		self: &Arc<Self>,
		name: &str,
		conn: &Arc<Connection>,
		presence: bool,
	) -> Result<(Arc<Topic>, bool), ConnectionClosed> {
		loop {
			let topic = self.get_or_create_topic(name);
			match topic.subscribe(conn, presence) {
				Ok(created) => return Ok((topic, created)),
				Err(SubscribeError::Closed(e)) => {
					topic.harvest_if_empty();
					return Err(e);
				}
				Err(SubscribeError::Harvested) => {
					// Lost the race with the last member leaving.
					self.remove(&topic);
				}
			}
		}
	}

	pub fn len(&self) -> usize {
		self.topics.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn names(&self) -> Vec<String> {
		self.topics.lock().keys().cloned().collect()
	}

	/// Remove `topic` if the registry still maps its name to this instance.
	fn remove(&self, topic: &Arc<Topic>) {
		let mut topics = self.topics.lock();
		if topics.get(&topic.name).is_some_and(|t| Arc::ptr_eq(t, topic)) {
			topics.remove(&topic.name);
			metrics::gauge!("lipwig_topics").set(topics.len() as f64);
			debug!(topic = %topic.name, "topic harvested");
		}
	}
}

impl Topic {
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn is_harvested(&self) -> bool {
		self.members.read().harvested
	}

	pub fn len(&self) -> usize {
		self.members.read().by_conn.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, conn: &Connection) -> bool {
		self.members.read().by_conn.contains_key(&conn.id())
	}

	/// Idempotent; returns `false` when `conn` already was a member.
	pub fn subscribe(self: &Arc<Self>, conn: &Arc<Connection>, presence: bool) -> Result<bool, SubscribeError> {
		let mut members = self.members.write();
		if members.harvested {
			return Err(SubscribeError::Harvested);
		}
		if members.by_conn.contains_key(&conn.id()) {
			return Ok(false);
		}

		// Topic lock, then the connection's own topic set. Nothing takes them
		// in the opposite order.
		conn.attach_topic(self)?;
		members.by_conn.insert(
			conn.id(),
			Member {
				conn: Arc::downgrade(conn),
				presence,
			},
		);
		Ok(true)
	}

	/// Remove `conn`. Returns `false` if it was not a member. Removing the
	/// last member harvests the topic from its registry before returning.
	pub fn unsubscribe(self: &Arc<Self>, conn: &Connection) -> bool {
		let harvest = {
			let mut members = self.members.write();
			if members.by_conn.remove(&conn.id()).is_none() {
				return false;
			}
			conn.detach_topic(self);

			if members.by_conn.is_empty() {
				members.harvested = true;
				true
			} else {
				false
			}
		};

		if harvest && let Some(registry) = self.registry.upgrade() {
			registry.remove(self);
		}

		true
	}

	/// Harvest a topic that never gained a member.
	fn harvest_if_empty(self: &Arc<Self>) {
		{
			let mut members = self.members.write();
			if members.harvested || !members.by_conn.is_empty() {
				return;
			}
			members.harvested = true;
		}

		if let Some(registry) = self.registry.upgrade() {
			registry.remove(self);
		}
	}

	/// Visit every live member with its presence flag under the read lock.
	/// The visitor must not subscribe or unsubscribe.
	pub fn for_all(&self, mut visitor: impl FnMut(&Arc<Connection>, bool)) {
		let members = self.members.read();
		for member in members.by_conn.values() {
			if let Some(conn) = member.conn.upgrade() {
				visitor(&conn, member.presence);
			}
		}
	}
}
