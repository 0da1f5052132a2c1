#![forbid(unsafe_code)]

pub mod endpoint;
pub mod secret;

pub use endpoint::{BindEndpoint, EndpointError, Transport};
pub use secret::SecretString;
