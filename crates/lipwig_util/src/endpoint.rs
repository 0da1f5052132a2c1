#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Transport a broker listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
	Tcp,
	Tls,
}

impl Transport {
	pub fn scheme(self) -> &'static str {
		match self {
			Transport::Tcp => "tcp",
			Transport::Tls => "tls",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected tcp://host:port or tls://host:port)")]
	Empty,

	#[error("invalid endpoint scheme (expected tcp:// or tls://): {0}")]
	Scheme(String),

	#[error("invalid endpoint (expected scheme://host:port without path/query/fragment): {0}")]
	Trailing(String),

	#[error("invalid endpoint (missing :port): {0}")]
	MissingPort(String),

	#[error("invalid endpoint host: {0}")]
	Host(String),

	#[error("invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:8787): {0}")]
	UnbracketedIpv6(String),

	#[error("invalid endpoint port (expected 1..=65535): {0}")]
	Port(String),

	#[error("host must be an IP literal (DNS names not supported here): {0}")]
	NotIpLiteral(String),
}

/// Parsed `tcp://host:port` or `tls://host:port` listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindEndpoint {
	pub transport: Transport,
	pub host: String,
	pub port: u16,
}

impl BindEndpoint {
	/// Returns `host:port` (host preserved, IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	pub fn is_tls(&self) -> bool {
		self.transport == Transport::Tls
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
		self.hostport()
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}

	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let (transport, rest) = if let Some(rest) = s.strip_prefix("tcp://") {
			(Transport::Tcp, rest)
		} else if let Some(rest) = s.strip_prefix("tls://") {
			(Transport::Tls, rest)
		} else {
			return Err(EndpointError::Scheme(s.to_string()));
		};

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(EndpointError::Trailing(s.to_string()));
		}

		let (host, port_str) = rest
			.rsplit_once(':')
			.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(EndpointError::Host(s.to_string()));
		}

		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(EndpointError::UnbracketedIpv6(s.to_string()));
		}

		let port: u16 = port_str.trim().parse().map_err(|_| EndpointError::Port(s.to_string()))?;
		if port == 0 {
			return Err(EndpointError::Port(s.to_string()));
		}

		Ok(Self {
			transport,
			host: host.to_string(),
			port,
		})
	}
}

impl fmt::Display for BindEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}", self.transport.scheme(), self.host, self.port)
	}
}
