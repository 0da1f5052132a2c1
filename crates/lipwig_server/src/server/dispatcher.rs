#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use lipwig_protocol::{ANONYMOUS, Code, Command, Fields, Lexer, PRESENCE, ParseError, Verb, event};
use tracing::debug;

use crate::server::connection::Connection;
use crate::server::registry::ConnectionRegistry;
use crate::server::topic::{Topic, TopicRegistry};

/// What a handler asks the caller to write back. `None` means the handler
/// already wrote whatever reply the verb calls for.
type Handler = fn(&Dispatcher, &Arc<Connection>, &Command<'_>) -> Option<Code>;

struct Route {
	verb: Verb,
	fields: Fields,
	handler: Handler,
}

const ROUTES: &[Route] = &[
	Route {
		verb: Verb::Login,
		fields: Fields::NONE,
		handler: Dispatcher::handle_login,
	},
	Route {
		verb: Verb::Subscribe,
		fields: Fields::TO_OPTION,
		handler: Dispatcher::handle_subscribe,
	},
	Route {
		verb: Verb::Unsubscribe,
		fields: Fields::TO,
		handler: Dispatcher::handle_unsubscribe,
	},
	Route {
		verb: Verb::Ucast,
		fields: Fields::TO_PAYLOAD,
		handler: Dispatcher::handle_ucast,
	},
	Route {
		verb: Verb::Mcast,
		fields: Fields::TO_PAYLOAD,
		handler: Dispatcher::handle_mcast,
	},
	Route {
		verb: Verb::Bcast,
		fields: Fields::PAYLOAD,
		handler: Dispatcher::handle_bcast,
	},
	Route {
		verb: Verb::Ping,
		fields: Fields::NONE,
		handler: Dispatcher::handle_ping,
	},
	Route {
		verb: Verb::Pong,
		fields: Fields::NONE,
		handler: Dispatcher::handle_pong,
	},
	Route {
		verb: Verb::Close,
		fields: Fields::NONE,
		handler: Dispatcher::handle_close,
	},
];

fn route(verb: Verb) -> Option<&'static Route> {
	ROUTES.iter().find(|r| r.verb == verb)
}

/// Turns one command line from one connection into registry mutations, an
/// ack, and event fan-out.
#[derive(Debug, Clone)]
pub struct Dispatcher {
	topics: Arc<TopicRegistry>,
	connections: Arc<ConnectionRegistry>,
}

impl Dispatcher {
	pub fn new(topics: Arc<TopicRegistry>, connections: Arc<ConnectionRegistry>) -> Self {
		Self { topics, connections }
	}

	pub fn topics(&self) -> &Arc<TopicRegistry> {
		&self.topics
	}

	pub fn connections(&self) -> &Arc<ConnectionRegistry> {
		&self.connections
	}

	/// Handle one line (terminator stripped). Protocol errors become `400`;
	/// nothing here fails the connection.
	pub fn dispatch(&self, conn: &Arc<Connection>, line: &[u8]) {
		let reply = match self.execute(conn, line) {
			Ok(reply) => reply,
			Err(e) => {
				debug!(conn_id = conn.id(), error = %e, "bad command");
				metrics::counter!("lipwig_bad_commands_total").increment(1);
				Some(Code::BadRequest)
			}
		};

		if let Some(code) = reply {
			let _ = conn.write(Bytes::from_static(code.line()));
		}
	}

	fn execute(&self, conn: &Arc<Connection>, line: &[u8]) -> Result<Option<Code>, ParseError> {
		let mut lexer = Lexer::new(line);
		let verb = lexer.parse_verb()?;
		let route = route(verb).ok_or(ParseError::UnknownVerb)?;
		let cmd = Command::parse_fields(verb, &mut lexer, route.fields)?;

		metrics::counter!("lipwig_commands_total", "verb" => verb.as_str()).increment(1);
		Ok((route.handler)(self, conn, &cmd))
	}

	fn handle_login(&self, conn: &Arc<Connection>, _cmd: &Command<'_>) -> Option<Code> {
		debug!(conn_id = conn.id(), "LOGIN on an authenticated session");
		Some(Code::BadRequest)
	}

	fn handle_subscribe(&self, conn: &Arc<Connection>, cmd: &Command<'_>) -> Option<Code> {
		if conn.is_anonymous() {
			return Some(Code::NotAllowed);
		}
		let presence = match cmd.option {
			None => false,
			Some(PRESENCE) => true,
			Some(_) => return Some(Code::BadRequest),
		};
		let Some(name) = cmd.to else {
			return Some(Code::BadRequest);
		};

		let Ok((topic, created)) = self.topics.subscribe(name, conn, presence) else {
			return None;
		};
		if !created {
			return Some(Code::Ok);
		}

		let joined = event(conn.user(), Verb::Subscribe, Some(name), None);
		let mut delivered = 0u64;
		topic.for_all(|member, member_presence| {
			if member.id() == conn.id() {
				return;
			}
			if member_presence && member.write(joined.clone()).is_ok() {
				delivered += 1;
			}
			if presence {
				let _ = conn.write(event(member.user(), Verb::Subscribe, Some(name), None));
			}
		});
		metrics::counter!("lipwig_events_out_total").increment(delivered);

		Some(Code::Ok)
	}

	fn handle_unsubscribe(&self, conn: &Arc<Connection>, cmd: &Command<'_>) -> Option<Code> {
		if conn.is_anonymous() {
			return Some(Code::NotAllowed);
		}
		let Some(topic) = cmd.to.and_then(|name| self.topics.get_topic(name)) else {
			return Some(Code::NotFound);
		};

		if topic.unsubscribe(conn) {
			announce_leave(&topic, conn);
		}
		Some(Code::Ok)
	}

	fn handle_ucast(&self, conn: &Arc<Connection>, cmd: &Command<'_>) -> Option<Code> {
		let Some(to) = cmd.to else {
			return Some(Code::BadRequest);
		};
		if to == ANONYMOUS {
			return Some(Code::NotFound);
		}
		let Some(target) = self.connections.lookup(to) else {
			return Some(Code::NotFound);
		};

		match target.write(event(conn.user(), Verb::Ucast, Some(to), cmd.payload)) {
			Ok(()) => {
				metrics::counter!("lipwig_events_out_total").increment(1);
				Some(Code::Ok)
			}
			Err(_) => Some(Code::NotFound),
		}
	}

	fn handle_mcast(&self, conn: &Arc<Connection>, cmd: &Command<'_>) -> Option<Code> {
		let Some(topic) = cmd.to.and_then(|name| self.topics.get_topic(name)) else {
			return Some(Code::NotFound);
		};

		let ev = event(conn.user(), Verb::Mcast, Some(topic.name()), cmd.payload);
		let mut delivered = 0u64;
		topic.for_all(|member, _| {
			if member.id() != conn.id() && member.write(ev.clone()).is_ok() {
				delivered += 1;
			}
		});
		metrics::counter!("lipwig_events_out_total").increment(delivered);

		Some(Code::Ok)
	}

	fn handle_bcast(&self, conn: &Arc<Connection>, cmd: &Command<'_>) -> Option<Code> {
		if conn.is_anonymous() {
			return Some(Code::NotAllowed);
		}

		let mut recipients: HashMap<u64, Arc<Connection>> = HashMap::new();
		for topic in conn.topics() {
			topic.for_all(|member, _| {
				if member.id() != conn.id() {
					recipients.entry(member.id()).or_insert_with(|| Arc::clone(member));
				}
			});
		}

		let ev = event(conn.user(), Verb::Bcast, None, cmd.payload);
		let mut delivered = 0u64;
		for member in recipients.values() {
			if member.write(ev.clone()).is_ok() {
				delivered += 1;
			}
		}
		metrics::counter!("lipwig_events_out_total").increment(delivered);

		Some(Code::Ok)
	}

	fn handle_ping(&self, conn: &Arc<Connection>, _cmd: &Command<'_>) -> Option<Code> {
		let _ = conn.write(event(ANONYMOUS, Verb::Pong, None, None));
		None
	}

	fn handle_pong(&self, _conn: &Arc<Connection>, _cmd: &Command<'_>) -> Option<Code> {
		None
	}

	fn handle_close(&self, conn: &Arc<Connection>, _cmd: &Command<'_>) -> Option<Code> {
		let _ = conn.write(Bytes::from_static(Code::Ok.line()));
		conn.close();
		None
	}
}

/// Tell the remaining presence members of `topic` that `conn` left.
pub(crate) fn announce_leave(topic: &Topic, conn: &Connection) {
	let left = event(conn.user(), Verb::Unsubscribe, Some(topic.name()), None);
	let mut delivered = 0u64;
	topic.for_all(|member, presence| {
		if presence && member.id() != conn.id() && member.write(left.clone()).is_ok() {
			delivered += 1;
		}
	});
	metrics::counter!("lipwig_events_out_total").increment(delivered);
}
