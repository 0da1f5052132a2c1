#![forbid(unsafe_code)]

use thiserror::Error;

use crate::MAX_ID_LEN;
use crate::verb::Verb;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("empty line")]
	Empty,

	#[error("unknown verb")]
	UnknownVerb,

	#[error("expected LOGIN, got {0}")]
	ExpectedLogin(Verb),

	#[error("missing field")]
	MissingField,

	#[error("empty field")]
	EmptyField,

	#[error("invalid identifier")]
	InvalidIdentifier,

	#[error("identifier too long: len={len} max={max}")]
	IdentifierTooLong {
		len: usize,
		max: usize,
	},

	#[error("unexpected trailing bytes at offset {0}")]
	TrailingBytes(usize),

	#[error("invalid event")]
	InvalidEvent,
}

/// Bytes allowed in identifier fields: ASCII alphanumerics and `.:@/_-+=~`.
#[inline]
pub fn is_id_byte(b: u8) -> bool {
	b.is_ascii_alphanumeric() || matches!(b, b'.' | b':' | b'@' | b'/' | b'_' | b'-' | b'+' | b'=' | b'~')
}

pub fn validate_id(token: &[u8]) -> Result<&str, ParseError> {
	if token.is_empty() {
		return Err(ParseError::EmptyField);
	}
	if token.len() > MAX_ID_LEN {
		return Err(ParseError::IdentifierTooLong {
			len: token.len(),
			max: MAX_ID_LEN,
		});
	}
	if !token.iter().all(|&b| is_id_byte(b)) {
		return Err(ParseError::InvalidIdentifier);
	}
	// All bytes are ASCII at this point.
	std::str::from_utf8(token).map_err(|_| ParseError::InvalidIdentifier)
}

/// Progressive cursor over a single line (terminator already stripped).
///
/// Fields are separated by exactly one space. The verb is read first; every
/// later field consumes its leading separator.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
	line: &'a [u8],
	pos: usize,
}

impl<'a> Lexer<'a> {
	pub fn new(line: &'a [u8]) -> Self {
		Self { line, pos: 0 }
	}

	pub fn remaining(&self) -> &'a [u8] {
		&self.line[self.pos..]
	}

	pub fn is_at_end(&self) -> bool {
		self.pos >= self.line.len()
	}

	pub fn parse_verb(&mut self) -> Result<Verb, ParseError> {
		if self.line.is_empty() {
			return Err(ParseError::Empty);
		}
		let token = self.take_token();
		Verb::from_bytes(token).ok_or(ParseError::UnknownVerb)
	}

	/// Required identifier field.
	pub fn parse_id(&mut self) -> Result<&'a str, ParseError> {
		self.separator()?;
		let token = self.take_token();
		validate_id(token)
	}

	/// Optional single-token field. Absent when the line is exhausted.
	pub fn parse_option(&mut self) -> Result<Option<&'a str>, ParseError> {
		if self.is_at_end() {
			return Ok(None);
		}
		self.parse_id().map(Some)
	}

	/// Required free-text payload: everything up to the end of the line.
	pub fn parse_payload(&mut self) -> Result<&'a [u8], ParseError> {
		self.separator()?;
		let payload = self.remaining();
		if payload.is_empty() {
			return Err(ParseError::EmptyField);
		}
		self.pos = self.line.len();
		Ok(payload)
	}

	/// Optional free-text payload.
	pub fn parse_optional_payload(&mut self) -> Result<Option<&'a [u8]>, ParseError> {
		if self.is_at_end() {
			return Ok(None);
		}
		self.parse_payload().map(Some)
	}

	/// Fails if any byte is left unconsumed.
	pub fn finish(&self) -> Result<(), ParseError> {
		if self.is_at_end() {
			Ok(())
		} else {
			Err(ParseError::TrailingBytes(self.pos))
		}
	}

	fn separator(&mut self) -> Result<(), ParseError> {
		match self.line.get(self.pos) {
			None => Err(ParseError::MissingField),
			Some(b' ') => {
				self.pos += 1;
				Ok(())
			}
			Some(_) => Err(ParseError::InvalidIdentifier),
		}
	}

	fn take_token(&mut self) -> &'a [u8] {
		let rest = &self.line[self.pos..];
		let len = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
		self.pos += len;
		&rest[..len]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_verb_then_fields_in_order() {
		let mut lx = Lexer::new(b"MCAST chat hello there");
		assert_eq!(lx.parse_verb(), Ok(Verb::Mcast));
		assert_eq!(lx.parse_id(), Ok("chat"));
		assert_eq!(lx.parse_payload(), Ok(&b"hello there"[..]));
		assert_eq!(lx.finish(), Ok(()));
	}

	#[test]
	fn missing_and_empty_fields_are_distinct() {
		let mut lx = Lexer::new(b"UCAST");
		lx.parse_verb().unwrap();
		assert_eq!(lx.parse_id(), Err(ParseError::MissingField));

		let mut lx = Lexer::new(b"UCAST  foo");
		lx.parse_verb().unwrap();
		assert_eq!(lx.parse_id(), Err(ParseError::EmptyField));
	}

	#[test]
	fn trailing_separator_is_not_a_payload() {
		let mut lx = Lexer::new(b"BCAST ");
		lx.parse_verb().unwrap();
		assert_eq!(lx.parse_payload(), Err(ParseError::EmptyField));
	}

	#[test]
	fn finish_reports_unconsumed_bytes() {
		let mut lx = Lexer::new(b"PING extra");
		lx.parse_verb().unwrap();
		assert_eq!(lx.finish(), Err(ParseError::TrailingBytes(4)));
	}

	#[test]
	fn option_absent_at_end_of_line() {
		let mut lx = Lexer::new(b"SUBSCRIBE t");
		lx.parse_verb().unwrap();
		lx.parse_id().unwrap();
		assert_eq!(lx.parse_option(), Ok(None));
	}

	#[test]
	fn identifier_rules() {
		assert!(validate_id(b"alice@example.com/phone").is_ok());
		assert!(validate_id(b"a:b_c-d+e=f~g").is_ok());
		assert_eq!(validate_id(b"caf\xc3\xa9"), Err(ParseError::InvalidIdentifier));
		assert_eq!(validate_id(b"a\tb"), Err(ParseError::InvalidIdentifier));
		assert!(validate_id(&[b'x'; MAX_ID_LEN]).is_ok());
		assert!(matches!(
			validate_id(&[b'x'; MAX_ID_LEN + 1]),
			Err(ParseError::IdentifierTooLong { .. })
		));
	}

	#[test]
	fn unknown_and_empty_verbs() {
		assert_eq!(Lexer::new(b"").parse_verb(), Err(ParseError::Empty));
		assert_eq!(Lexer::new(b"FROB x").parse_verb(), Err(ParseError::UnknownVerb));
		assert_eq!(Lexer::new(b" PING").parse_verb(), Err(ParseError::UnknownVerb));
	}
}
