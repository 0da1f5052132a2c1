#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use lipwig_protocol::ANONYMOUS;
use lipwig_util::SecretString;
use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Scheme that admits `LOGIN . anonymous` without a credential.
pub const ANONYMOUS_SCHEME: &str = "anonymous";

pub const SECRET_SCHEME: &str = "secret";
pub const CERT_SCHEME: &str = "cert";
pub const OPEN_SCHEME: &str = "none";
pub const TOKEN_SCHEME: &str = "token";

/// Transport facts an authenticator may inspect.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
	pub conn_id: u64,
	pub remote: Option<SocketAddr>,
	/// Verified client chain, leaf first. `None` on plain TCP or when the
	/// client presented no certificate.
	pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
}

impl ConnectionMeta {
	pub fn plain(conn_id: u64, remote: Option<SocketAddr>) -> Self {
		Self {
			conn_id,
			remote,
			peer_certificates: None,
		}
	}

	pub fn is_tls_authenticated(&self) -> bool {
		self.peer_certificates.as_ref().is_some_and(|c| !c.is_empty())
	}
}

/// A credential verifier for one LOGIN scheme.
pub trait Authenticator: Send + Sync {
	fn authenticate(&self, meta: &ConnectionMeta, user: &str, credential: &[u8]) -> bool;
}

/// Scheme name -> verifier map consulted during the LOGIN handshake.
#[derive(Clone, Default)]
pub struct Authenticators {
	schemes: HashMap<String, Arc<dyn Authenticator>>,
	allow_anonymous: bool,
}

impl fmt::Debug for Authenticators {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut schemes = self.schemes.keys().collect::<Vec<_>>();
		schemes.sort();
		f.debug_struct("Authenticators")
			.field("schemes", &schemes)
			.field("allow_anonymous", &self.allow_anonymous)
			.finish()
	}
}

impl Authenticators {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_scheme(mut self, scheme: impl Into<String>, auth: impl Authenticator + 'static) -> Self {
		self.insert(scheme, Arc::new(auth));
		self
	}

	pub fn with_anonymous(mut self, allow: bool) -> Self {
		self.allow_anonymous = allow;
		self
	}

	pub fn insert(&mut self, scheme: impl Into<String>, auth: Arc<dyn Authenticator>) {
		self.schemes.insert(scheme.into(), auth);
	}

	pub fn allows_anonymous(&self) -> bool {
		self.allow_anonymous
	}

	pub fn schemes(&self) -> impl Iterator<Item = &str> {
		self.schemes.keys().map(String::as_str)
	}

	/// Returns `true` only if the scheme exists and accepts the credential.
	/// Callers must not reveal which part of the check failed.
	pub fn authenticate(&self, meta: &ConnectionMeta, user: &str, scheme: &str, credential: &[u8]) -> bool {
		if scheme == ANONYMOUS_SCHEME {
			return self.allow_anonymous && user == ANONYMOUS && credential.is_empty();
		}

		match self.schemes.get(scheme) {
			Some(auth) => auth.authenticate(meta, user, credential),
			None => {
				debug!(conn_id = meta.conn_id, scheme, "unknown auth scheme");
				false
			}
		}
	}
}

/// Shared-secret scheme. Ignores the user id and transport.
pub struct SharedSecret {
	secret: SecretString,
}

impl SharedSecret {
	pub fn new(secret: SecretString) -> anyhow::Result<Self> {
		if secret.is_empty() {
			return Err(anyhow!("shared secret must be non-empty"));
		}
		Ok(Self { secret })
	}

	/// Read the secret from a file; one trailing line break is dropped.
	pub fn from_file(path: &Path) -> anyhow::Result<Self> {
		let raw = std::fs::read_to_string(path).with_context(|| format!("read secret file: {}", path.display()))?;
		let trimmed = raw.strip_suffix('\n').unwrap_or(&raw);
		let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
		Self::new(SecretString::new(trimmed)).with_context(|| format!("secret file {} is empty", path.display()))
	}
}

impl Authenticator for SharedSecret {
	fn authenticate(&self, _meta: &ConnectionMeta, _user: &str, credential: &[u8]) -> bool {
		constant_time_eq(self.secret.expose_bytes(), credential)
	}
}

/// Client-certificate scheme. The claimed user id, minus any `/suffix`, must
/// equal the leaf's subject CN or one of its DNS/email SANs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CertificateAuth;

impl Authenticator for CertificateAuth {
	fn authenticate(&self, meta: &ConnectionMeta, user: &str, _credential: &[u8]) -> bool {
		let Some(leaf) = meta.peer_certificates.as_ref().and_then(|chain| chain.first()) else {
			return false;
		};

		let identity = user.split_once('/').map_or(user, |(id, _)| id);
		if identity.is_empty() {
			return false;
		}

		match X509Certificate::from_der(leaf.as_ref()) {
			Ok((_, cert)) => certificate_matches(&cert, identity),
			Err(e) => {
				debug!(conn_id = meta.conn_id, error = %e, "failed to parse peer certificate");
				false
			}
		}
	}
}

fn certificate_matches(cert: &X509Certificate<'_>, identity: &str) -> bool {
	let cn_match = cert
		.subject()
		.iter_common_name()
		.filter_map(|cn| cn.as_str().ok())
		.any(|cn| cn == identity);
	if cn_match {
		return true;
	}

	let Ok(Some(san)) = cert.subject_alternative_name() else {
		return false;
	};

	san.value.general_names.iter().any(|name| match name {
		GeneralName::DNSName(dns) => dns.eq_ignore_ascii_case(identity),
		GeneralName::RFC822Name(email) => *email == identity,
		_ => false,
	})
}

/// Accepts everything. Dev and test setups only.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAuth;

impl Authenticator for OpenAuth {
	fn authenticate(&self, _meta: &ConnectionMeta, _user: &str, _credential: &[u8]) -> bool {
		true
	}
}

/// Stateless access tokens: `v1.<b64url(claims)>.<b64url(hmac-sha256)>`.
/// The token subject must equal the claimed user id.
pub struct HmacTokenAuth {
	secret: SecretString,
}

impl HmacTokenAuth {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

impl Authenticator for HmacTokenAuth {
	fn authenticate(&self, meta: &ConnectionMeta, user: &str, credential: &[u8]) -> bool {
		let Ok(token) = std::str::from_utf8(credential) else {
			return false;
		};

		match verify_hmac_token(token, self.secret.expose()) {
			Ok(claims) if claims.sub == user => true,
			Ok(claims) => {
				debug!(conn_id = meta.conn_id, sub = %claims.sub, user, "token subject mismatch");
				false
			}
			Err(e) => {
				debug!(conn_id = meta.conn_id, error = %e, "auth token rejected");
				false
			}
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let mut parts = token.split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(anyhow!("invalid token format"));
	};

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;
	let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64.as_bytes());
	mac.verify_slice(&provided_sig).map_err(|_| anyhow!("invalid token signature"))?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
