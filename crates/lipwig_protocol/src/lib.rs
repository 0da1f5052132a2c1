#![forbid(unsafe_code)]

//! SSMP wire codec.
//!
//! Commands are single `\n`-terminated ASCII lines of the form
//! `VERB[ field]...[ payload]`. The server answers each command with a
//! three-digit status line and pushes events prefixed with `000 `.

pub mod code;
pub mod command;
pub mod event;
pub mod lexer;
pub mod verb;

pub use code::Code;
pub use command::{Command, Fields, Login, PayloadField, parse_login};
pub use event::{EVENT_PREFIX, Event, Reply, encode_event, event};
pub use lexer::{Lexer, ParseError, is_id_byte, validate_id};
pub use verb::Verb;

/// Reserved user id for anonymous sessions and for the server itself.
pub const ANONYMOUS: &str = ".";

/// SUBSCRIBE option token requesting join/leave notifications.
pub const PRESENCE: &str = "PRESENCE";

/// Maximum identifier length (user ids, topics, schemes).
pub const MAX_ID_LEN: usize = 64;

/// Maximum line length, terminator included.
pub const MAX_LINE_LEN: usize = 1024;
