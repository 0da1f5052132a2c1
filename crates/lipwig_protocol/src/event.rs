#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};

use crate::code::Code;
use crate::command::{Command, Fields};
use crate::lexer::{Lexer, ParseError, validate_id};
use crate::verb::Verb;

/// Leading sentinel of every server-pushed event.
pub const EVENT_PREFIX: &[u8] = b"000 ";

/// Append `000 <from> <VERB>[ <to>][ <payload>]\n` into `buf`.
pub fn encode_event(buf: &mut BytesMut, from: &str, verb: Verb, to: Option<&str>, payload: Option<&[u8]>) {
	let verb = verb.as_str().as_bytes();
	let len = EVENT_PREFIX.len()
		+ from.len()
		+ 1 + verb.len()
		+ to.map_or(0, |t| t.len() + 1)
		+ payload.map_or(0, |p| p.len() + 1)
		+ 1;
	buf.reserve(len);

	buf.put_slice(EVENT_PREFIX);
	buf.put_slice(from.as_bytes());
	buf.put_u8(b' ');
	buf.put_slice(verb);
	if let Some(to) = to {
		buf.put_u8(b' ');
		buf.put_slice(to.as_bytes());
	}
	if let Some(payload) = payload {
		buf.put_u8(b' ');
		buf.put_slice(payload);
	}
	buf.put_u8(b'\n');
}

/// Encode a single event into an immutable, cheaply clonable buffer.
pub fn event(from: &str, verb: Verb, to: Option<&str>, payload: Option<&[u8]>) -> Bytes {
	let mut buf = BytesMut::new();
	encode_event(&mut buf, from, verb, to, payload);
	buf.freeze()
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<'a> {
	pub from: &'a str,
	pub verb: Verb,
	pub to: Option<&'a str>,
	pub payload: Option<&'a [u8]>,
}

impl<'a> Event<'a> {
	/// Parse one event line (terminator stripped).
	pub fn parse(line: &'a [u8]) -> Result<Self, ParseError> {
		let rest = line.strip_prefix(EVENT_PREFIX).ok_or(ParseError::InvalidEvent)?;
		let (from, tail) = match rest.iter().position(|&b| b == b' ') {
			Some(idx) => (&rest[..idx], &rest[idx + 1..]),
			None => return Err(ParseError::InvalidEvent),
		};
		let from = validate_id(from)?;

		let mut lexer = Lexer::new(tail);
		let verb = lexer.parse_verb()?;
		let cmd = Command::parse_fields(verb, &mut lexer, Fields::for_event(verb))?;

		Ok(Self {
			from,
			verb,
			to: cmd.to,
			payload: cmd.payload,
		})
	}
}

/// Anything the server writes: a status line or an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<'a> {
	Code(Code),
	Event(Event<'a>),
}

impl<'a> Reply<'a> {
	pub fn parse(line: &'a [u8]) -> Result<Self, ParseError> {
		if line.starts_with(EVENT_PREFIX) {
			return Event::parse(line).map(Reply::Event);
		}
		Code::from_bytes(line).map(Reply::Code).ok_or(ParseError::InvalidEvent)
	}
}
