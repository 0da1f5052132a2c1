#![forbid(unsafe_code)]

//! lipwig: an in-memory pub/sub broker speaking SSMP, a line-based protocol
//! for presence, unicast, multicast and broadcast messaging.

pub mod config;
pub mod server;
pub mod tls;

pub use server::auth::{Authenticator, Authenticators, ConnectionMeta};
pub use server::connection::ConnectionSettings;
pub use server::{Server, ServerOptions};
