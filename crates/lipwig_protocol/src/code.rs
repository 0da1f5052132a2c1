#![forbid(unsafe_code)]

use std::fmt;

/// Status codes written in reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
	Ok,
	BadRequest,
	Unauthorized,
	NotFound,
	NotAllowed,
}

impl Code {
	pub fn as_u16(self) -> u16 {
		match self {
			Code::Ok => 200,
			Code::BadRequest => 400,
			Code::Unauthorized => 401,
			Code::NotFound => 404,
			Code::NotAllowed => 405,
		}
	}

	/// Full response line, terminator included.
	pub fn line(self) -> &'static [u8] {
		match self {
			Code::Ok => b"200\n",
			Code::BadRequest => b"400\n",
			Code::Unauthorized => b"401\n",
			Code::NotFound => b"404\n",
			Code::NotAllowed => b"405\n",
		}
	}

	pub fn from_bytes(token: &[u8]) -> Option<Code> {
		match token {
			b"200" => Some(Code::Ok),
			b"400" => Some(Code::BadRequest),
			b"401" => Some(Code::Unauthorized),
			b"404" => Some(Code::NotFound),
			b"405" => Some(Code::NotAllowed),
			_ => None,
		}
	}
}

impl fmt::Display for Code {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_u16())
	}
}
