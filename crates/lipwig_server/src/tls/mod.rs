#![forbid(unsafe_code)]

pub mod config;

pub use config::{build_dev_server_config, build_server_config};
