#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use lipwig_protocol::MAX_LINE_LEN;
use lipwig_util::{BindEndpoint, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::auth::{
	Authenticators, CERT_SCHEME, CertificateAuth, HmacTokenAuth, OPEN_SCHEME, OpenAuth, SECRET_SCHEME, SharedSecret,
	TOKEN_SCHEME,
};
use crate::server::connection::ConnectionSettings;

pub const DEFAULT_BIND: &str = "tcp://127.0.0.1:8787";

/// Smallest line limit that still fits a LOGIN with a full-length id and scheme.
const MIN_LINE_BYTES: usize = 160;

/// Default config path: `~/.lipwig/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".lipwig").join("config.toml"))
}

/// Load the config from TOML (missing file means defaults) and apply
/// `LIPWIG_*` environment overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub session: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `tcp://host:port` or `tls://host:port`.
	pub bind: String,
	/// PEM-encoded certificate chain.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key.
	pub tls_key_path: Option<PathBuf>,
	/// PEM bundle of CAs trusted for client certificates.
	pub tls_client_ca_path: Option<PathBuf>,
	/// Serve a generated self-signed certificate when no cert/key is set.
	/// Dev only; without it a `tls://` bind needs real TLS material.
	pub tls_self_signed: bool,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			tls_cert_path: None,
			tls_key_path: None,
			tls_client_ca_path: None,
			tls_self_signed: false,
			metrics_bind: None,
			health_bind: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// File holding the shared secret; enables the `secret` scheme.
	pub secret_path: Option<PathBuf>,
	/// Enables the `token` scheme.
	pub hmac_secret: Option<SecretString>,
	/// Enables the `none` scheme. Dev only.
	pub allow_open: bool,
	/// Admit `LOGIN . anonymous`.
	pub allow_anonymous: bool,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			secret_path: None,
			hmac_secret: None,
			allow_open: false,
			allow_anonymous: true,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub login_timeout: Duration,
	pub idle_timeout: Duration,
	pub tls_handshake_timeout: Duration,
	pub max_line_bytes: usize,
	pub write_timeout: Duration,
	pub outbound_queue_frames: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		let d = ConnectionSettings::default();
		Self {
			login_timeout: d.login_timeout,
			idle_timeout: d.idle_timeout,
			tls_handshake_timeout: d.tls_handshake_timeout,
			max_line_bytes: d.max_line_bytes,
			write_timeout: d.write_timeout,
			outbound_queue_frames: d.outbound_queue_frames,
		}
	}
}

impl SessionSettings {
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			login_timeout: self.login_timeout,
			idle_timeout: self.idle_timeout,
			tls_handshake_timeout: self.tls_handshake_timeout,
			max_line_bytes: self.max_line_bytes,
			write_timeout: self.write_timeout,
			outbound_queue_frames: self.outbound_queue_frames,
		}
	}
}

/// Where the TLS server identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource<'a> {
	Files { cert: &'a Path, key: &'a Path },
	SelfSigned,
}

impl ServerConfig {
	/// Pick the TLS identity for a `tls://` bind. Missing material is a
	/// startup error unless the self-signed fallback is switched on.
	pub fn tls_source(&self) -> anyhow::Result<TlsSource<'_>> {
		match (self.server.tls_cert_path.as_deref(), self.server.tls_key_path.as_deref()) {
			(Some(cert), Some(key)) => Ok(TlsSource::Files { cert, key }),
			(None, None) if self.server.tls_self_signed => Ok(TlsSource::SelfSigned),
			(None, None) => Err(anyhow!(
				"tls bind needs tls_cert_path and tls_key_path (or tls_self_signed = true for development)"
			)),
			_ => Err(anyhow!("tls_cert_path and tls_key_path must be set together")),
		}
	}

	pub fn bind_endpoint(&self) -> anyhow::Result<BindEndpoint> {
		BindEndpoint::parse(&self.server.bind).with_context(|| format!("invalid bind endpoint {:?}", self.server.bind))
	}

	/// Build the scheme map. Reading the secret file happens here, so a bad
	/// or empty file is a startup error.
	pub fn authenticators(&self) -> anyhow::Result<Authenticators> {
		let mut auth = Authenticators::new()
			.with_anonymous(self.auth.allow_anonymous)
			.with_scheme(CERT_SCHEME, CertificateAuth);

		if let Some(path) = self.auth.secret_path.as_deref() {
			auth = auth.with_scheme(SECRET_SCHEME, SharedSecret::from_file(path)?);
		}

		if let Some(secret) = self.auth.hmac_secret.clone() {
			auth = auth.with_scheme(TOKEN_SCHEME, HmacTokenAuth::new(secret));
		}

		if self.auth.allow_open {
			warn!("open auth scheme enabled: any LOGIN using scheme `none` is accepted");
			auth = auth.with_scheme(OPEN_SCHEME, OpenAuth);
		}

		Ok(auth)
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = SessionSettings::default();

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_client_ca_path: file
					.server
					.tls_client_ca_path
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from),
				tls_self_signed: file.server.tls_self_signed.unwrap_or(false),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				secret_path: file.auth.secret_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				hmac_secret: file
					.auth
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				allow_open: file.auth.allow_open.unwrap_or(false),
				allow_anonymous: file.auth.allow_anonymous.unwrap_or(true),
			},
			session: SessionSettings {
				login_timeout: file
					.session
					.login_timeout_secs
					.filter(|v| *v > 0)
					.map_or(defaults.login_timeout, Duration::from_secs),
				idle_timeout: file
					.session
					.idle_timeout_secs
					.filter(|v| *v > 0)
					.map_or(defaults.idle_timeout, Duration::from_secs),
				tls_handshake_timeout: file
					.session
					.tls_handshake_timeout_secs
					.filter(|v| *v > 0)
					.map_or(defaults.tls_handshake_timeout, Duration::from_secs),
				max_line_bytes: file
					.session
					.max_line_bytes
					.map_or(defaults.max_line_bytes, clamp_line_bytes),
				write_timeout: file
					.session
					.write_timeout_secs
					.filter(|v| *v > 0)
					.map_or(defaults.write_timeout, Duration::from_secs),
				outbound_queue_frames: file
					.session
					.outbound_queue_frames
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_frames),
			},
		}
	}
}

fn clamp_line_bytes(v: usize) -> usize {
	if v < MIN_LINE_BYTES {
		warn!(
			max_line_bytes = v,
			min = MIN_LINE_BYTES,
			"session config: max_line_bytes too small; raising"
		);
		MIN_LINE_BYTES
	} else {
		v
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	session: FileSessionSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	tls_client_ca_path: Option<String>,
	tls_self_signed: Option<bool>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	secret_path: Option<String>,
	hmac_secret: Option<String>,
	allow_open: Option<bool>,
	allow_anonymous: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	login_timeout_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	tls_handshake_timeout_secs: Option<u64>,
	max_line_bytes: Option<usize>,
	write_timeout_secs: Option<u64>,
	outbound_queue_frames: Option<usize>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("LIPWIG_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("LIPWIG_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = var("LIPWIG_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = var("LIPWIG_TLS_CLIENT_CA") {
		cfg.server.tls_client_ca_path = Some(PathBuf::from(v));
		info!("server config: tls_client_ca_path overridden by env");
	}

	if let Some(enabled) = var("LIPWIG_TLS_SELF_SIGNED").as_deref().and_then(parse_env_bool) {
		cfg.server.tls_self_signed = enabled;
		info!(enabled, "server config: tls_self_signed overridden by env");
	}

	if let Some(v) = var("LIPWIG_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("LIPWIG_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("LIPWIG_SECRET_FILE") {
		cfg.auth.secret_path = Some(PathBuf::from(v));
		info!("server auth: secret_path overridden by env");
	}

	if let Some(v) = var("LIPWIG_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(enabled) = var("LIPWIG_ALLOW_OPEN_AUTH").as_deref().and_then(parse_env_bool) {
		cfg.auth.allow_open = enabled;
		info!(enabled, "server auth: allow_open overridden by env");
	}

	if let Some(enabled) = var("LIPWIG_ALLOW_ANONYMOUS").as_deref().and_then(parse_env_bool) {
		cfg.auth.allow_anonymous = enabled;
		info!(enabled, "server auth: allow_anonymous overridden by env");
	}

	if let Some(secs) = var("LIPWIG_LOGIN_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.session.login_timeout = Duration::from_secs(secs);
		info!(secs, "session config: login_timeout overridden by env");
	}

	if let Some(secs) = var("LIPWIG_IDLE_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.session.idle_timeout = Duration::from_secs(secs);
		info!(secs, "session config: idle_timeout overridden by env");
	}

	if let Some(secs) = var("LIPWIG_WRITE_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.session.write_timeout = Duration::from_secs(secs);
		info!(secs, "session config: write_timeout overridden by env");
	}

	if let Some(frames) = var("LIPWIG_OUTBOUND_QUEUE_FRAMES").and_then(|v| v.parse::<usize>().ok())
		&& frames > 0
	{
		cfg.session.outbound_queue_frames = frames;
		info!(frames, "session config: outbound_queue_frames overridden by env");
	}

	if let Some(bytes) = var("LIPWIG_MAX_LINE_BYTES").and_then(|v| v.parse::<usize>().ok()) {
		cfg.session.max_line_bytes = clamp_line_bytes(bytes);
		info!(bytes, "session config: max_line_bytes overridden by env");
	}

	if cfg.session.max_line_bytes > 64 * MAX_LINE_LEN {
		warn!(
			max_line_bytes = cfg.session.max_line_bytes,
			"session config: unusually large max_line_bytes"
		);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn scratch_file(name: &str, contents: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("lipwig-config-{}", std::process::id()));
		fs::create_dir_all(&dir).expect("create scratch dir");
		let path = dir.join(name);
		fs::write(&path, contents).expect("write scratch file");
		path
	}

	#[test]
	fn missing_file_yields_defaults() {
		let cfg = load_server_config_from_path(Path::new("/nonexistent/lipwig/config.toml")).expect("defaults");
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert!(cfg.auth.allow_anonymous);
		assert!(!cfg.auth.allow_open);
		assert_eq!(cfg.session.idle_timeout, Duration::from_secs(30));
		assert_eq!(cfg.session.login_timeout, Duration::from_secs(10));
		assert_eq!(cfg.session.max_line_bytes, MAX_LINE_LEN);
	}

	#[test]
	fn toml_sections_are_read() {
		let path = scratch_file(
			"full.toml",
			r#"
[server]
bind = "tls://0.0.0.0:9443"
tls_cert_path = "/etc/lipwig/cert.pem"
tls_key_path = "/etc/lipwig/key.pem"
health_bind = "  "

[auth]
hmac_secret = "s3cret"
allow_open = true
allow_anonymous = false

[session]
idle_timeout_secs = 5
max_line_bytes = 10
write_timeout_secs = 3
outbound_queue_frames = 64
"#,
		);

		let file = read_toml_if_exists(&path).expect("read").expect("present");
		let cfg = ServerConfig::from_file(file);
		assert!(cfg.bind_endpoint().expect("endpoint").is_tls());
		assert_eq!(cfg.server.tls_cert_path.as_deref(), Some(Path::new("/etc/lipwig/cert.pem")));
		assert!(cfg.server.health_bind.is_none());
		assert_eq!(cfg.auth.hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert!(cfg.auth.allow_open);
		assert!(!cfg.auth.allow_anonymous);
		assert_eq!(cfg.session.idle_timeout, Duration::from_secs(5));
		assert_eq!(cfg.session.max_line_bytes, MIN_LINE_BYTES);
		assert_eq!(cfg.session.write_timeout, Duration::from_secs(3));
		assert_eq!(cfg.session.connection_settings().outbound_queue_frames, 64);
	}

	#[test]
	fn tls_material_is_required_unless_self_signed_is_enabled() {
		let mut cfg = ServerConfig::default();
		assert!(cfg.tls_source().is_err());

		cfg.server.tls_self_signed = true;
		assert_eq!(cfg.tls_source().expect("self-signed"), TlsSource::SelfSigned);

		cfg.server.tls_cert_path = Some(PathBuf::from("/etc/lipwig/cert.pem"));
		assert!(cfg.tls_source().is_err(), "cert without key");

		cfg.server.tls_key_path = Some(PathBuf::from("/etc/lipwig/key.pem"));
		assert_eq!(
			cfg.tls_source().expect("files"),
			TlsSource::Files {
				cert: Path::new("/etc/lipwig/cert.pem"),
				key: Path::new("/etc/lipwig/key.pem"),
			}
		);
	}

	#[test]
	fn malformed_toml_is_an_error() {
		let path = scratch_file("broken.toml", "[server\nbind = ");
		assert!(load_server_config_from_path(&path).is_err());
	}

	#[test]
	fn env_overrides_win_over_file_values() {
		let env = HashMap::from([
			("LIPWIG_BIND", "tcp://127.0.0.1:9000"),
			("LIPWIG_ALLOW_OPEN_AUTH", "yes"),
			("LIPWIG_ALLOW_ANONYMOUS", "off"),
			("LIPWIG_IDLE_TIMEOUT_SECS", "7"),
			("LIPWIG_LOGIN_TIMEOUT_SECS", "0"),
			("LIPWIG_HEALTH_BIND", "   "),
			("LIPWIG_TLS_SELF_SIGNED", "true"),
			("LIPWIG_OUTBOUND_QUEUE_FRAMES", "0"),
		]);

		let mut cfg = ServerConfig::default();
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.server.bind, "tcp://127.0.0.1:9000");
		assert!(cfg.auth.allow_open);
		assert!(!cfg.auth.allow_anonymous);
		assert_eq!(cfg.session.idle_timeout, Duration::from_secs(7));
		assert_eq!(cfg.session.login_timeout, Duration::from_secs(10));
		assert!(cfg.server.health_bind.is_none());
		assert!(cfg.server.tls_self_signed);
		assert_eq!(cfg.session.outbound_queue_frames, ConnectionSettings::default().outbound_queue_frames);
	}

	#[test]
	fn empty_secret_file_is_a_startup_error() {
		let path = scratch_file("empty.secret", "\n");
		let mut cfg = ServerConfig::default();
		cfg.auth.secret_path = Some(path);
		assert!(cfg.authenticators().is_err());
	}

	#[test]
	fn authenticators_follow_auth_settings() {
		let path = scratch_file("good.secret", "hunter2\n");
		let mut cfg = ServerConfig::default();
		cfg.auth.secret_path = Some(path);
		cfg.auth.allow_open = true;

		let auth = cfg.authenticators().expect("authenticators");
		let mut schemes = auth.schemes().collect::<Vec<_>>();
		schemes.sort();
		assert_eq!(schemes, vec![CERT_SCHEME, OPEN_SCHEME, SECRET_SCHEME]);
	}
}
