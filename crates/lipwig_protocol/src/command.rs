#![forbid(unsafe_code)]

use crate::lexer::{Lexer, ParseError};
use crate::verb::Verb;

/// How the trailing field of a command is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadField {
	/// No trailing field.
	None,
	/// Free text up to the end of the line, at least one byte.
	Required,
	/// At most one identifier-shaped token.
	Option,
}

/// Field mask for a verb: whether a `to` identifier follows the verb, and
/// how the trailing field is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fields {
	pub to: bool,
	pub payload: PayloadField,
}

impl Fields {
	pub const NONE: Fields = Fields {
		to: false,
		payload: PayloadField::None,
	};
	pub const TO: Fields = Fields {
		to: true,
		payload: PayloadField::None,
	};
	pub const PAYLOAD: Fields = Fields {
		to: false,
		payload: PayloadField::Required,
	};
	pub const TO_PAYLOAD: Fields = Fields {
		to: true,
		payload: PayloadField::Required,
	};
	pub const TO_OPTION: Fields = Fields {
		to: true,
		payload: PayloadField::Option,
	};

	/// Shape of a command line issued by a client after login.
	pub fn for_command(verb: Verb) -> Fields {
		match verb {
			Verb::Subscribe => Fields::TO_OPTION,
			Verb::Unsubscribe => Fields::TO,
			Verb::Ucast | Verb::Mcast => Fields::TO_PAYLOAD,
			Verb::Bcast => Fields::PAYLOAD,
			Verb::Login | Verb::Ping | Verb::Pong | Verb::Close => Fields::NONE,
		}
	}

	/// Shape of the tail of a server event (after `000 <from> <VERB>`).
	pub fn for_event(verb: Verb) -> Fields {
		match verb {
			Verb::Subscribe | Verb::Unsubscribe => Fields::TO,
			other => Fields::for_command(other),
		}
	}
}

/// One parsed command line. Borrows from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
	pub verb: Verb,
	pub to: Option<&'a str>,
	pub payload: Option<&'a [u8]>,
	pub option: Option<&'a str>,
}

impl<'a> Command<'a> {
	/// Parse a full line using the default command shapes.
	pub fn parse(line: &'a [u8]) -> Result<Self, ParseError> {
		let mut lexer = Lexer::new(line);
		let verb = lexer.parse_verb()?;
		Self::parse_fields(verb, &mut lexer, Fields::for_command(verb))
	}

	/// Parse the rest of a line whose verb has already been consumed.
	pub fn parse_fields(verb: Verb, lexer: &mut Lexer<'a>, fields: Fields) -> Result<Self, ParseError> {
		let to = if fields.to { Some(lexer.parse_id()?) } else { None };

		let (payload, option) = match fields.payload {
			PayloadField::None => (None, None),
			PayloadField::Required => (Some(lexer.parse_payload()?), None),
			PayloadField::Option => (None, lexer.parse_option()?),
		};

		lexer.finish()?;

		Ok(Self {
			verb,
			to,
			payload,
			option,
		})
	}
}

/// The handshake line: `LOGIN <user> <scheme>[ <credential>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login<'a> {
	pub user: &'a str,
	pub scheme: &'a str,
	pub credential: &'a [u8],
}

/// Parse the first line of a session. Any verb other than LOGIN is rejected
/// before its fields are looked at.
pub fn parse_login(line: &[u8]) -> Result<Login<'_>, ParseError> {
	let mut lexer = Lexer::new(line);
	let verb = lexer.parse_verb()?;
	if verb != Verb::Login {
		return Err(ParseError::ExpectedLogin(verb));
	}

	let user = lexer.parse_id()?;
	let scheme = lexer.parse_id()?;
	let credential = lexer.parse_optional_payload()?.unwrap_or_default();
	lexer.finish()?;

	Ok(Login {
		user,
		scheme,
		credential,
	})
}
