#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod health;
pub mod listener;
pub mod registry;
pub mod topic;

pub use listener::{Server, ServerOptions};
