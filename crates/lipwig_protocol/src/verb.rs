#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
	Login,
	Subscribe,
	Unsubscribe,
	Ucast,
	Mcast,
	Bcast,
	Ping,
	Pong,
	Close,
}

impl Verb {
	pub const ALL: [Verb; 9] = [
		Verb::Login,
		Verb::Subscribe,
		Verb::Unsubscribe,
		Verb::Ucast,
		Verb::Mcast,
		Verb::Bcast,
		Verb::Ping,
		Verb::Pong,
		Verb::Close,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Verb::Login => "LOGIN",
			Verb::Subscribe => "SUBSCRIBE",
			Verb::Unsubscribe => "UNSUBSCRIBE",
			Verb::Ucast => "UCAST",
			Verb::Mcast => "MCAST",
			Verb::Bcast => "BCAST",
			Verb::Ping => "PING",
			Verb::Pong => "PONG",
			Verb::Close => "CLOSE",
		}
	}

	/// Match a token against the verb allow-list. Case-sensitive.
	pub fn from_bytes(token: &[u8]) -> Option<Verb> {
		Verb::ALL.into_iter().find(|v| v.as_str().as_bytes() == token)
	}
}

impl fmt::Display for Verb {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
