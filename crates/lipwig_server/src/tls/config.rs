#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls_pemfile::{certs, private_key};
use tracing::info;

/// Build a rustls server config from PEM files. With `client_ca`, clients
/// may present a certificate signed by one of those roots; clients without
/// one are still admitted so that non-certificate schemes keep working.
pub fn build_server_config(
	cert_path: &Path,
	key_path: &Path,
	client_ca: Option<&Path>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
	let cert_chain = load_cert_chain(cert_path)?;
	let key = load_private_key(key_path)?;
	assemble(cert_chain, key, client_ca)
}

/// Dev-only config with a generated self-signed `localhost` certificate.
/// Returns the DER certificate so clients can pin it.
pub fn build_dev_server_config(
	client_ca: Option<&Path>,
) -> anyhow::Result<(Arc<rustls::ServerConfig>, CertificateDer<'static>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
		.context("generate self-signed cert")?;

	let cert_der = CertificateDer::from(ck.cert.der().to_vec());
	let key_der = ck.signing_key.serialize_der();
	let key = PrivateKeyDer::try_from(key_der).map_err(|e| anyhow!("parse private key der: {e}"))?;

	let config = assemble(vec![cert_der.clone()], key, client_ca)?;
	Ok((config, cert_der))
}

fn assemble(
	cert_chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	client_ca: Option<&Path>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
	let builder = rustls::ServerConfig::builder();
	let builder = match client_ca {
		Some(ca_path) => {
			let mut roots = RootCertStore::empty();
			for cert in load_cert_chain(ca_path)? {
				roots.add(cert).context("add client CA certificate")?;
			}
			info!(ca = %ca_path.display(), roots = roots.len(), "client certificate verification enabled");

			let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
				.allow_unauthenticated()
				.build()
				.context("build client certificate verifier")?;
			builder.with_client_cert_verifier(verifier)
		}
		None => builder.with_no_client_auth(),
	};

	let config = builder
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	Ok(Arc::new(config))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if certs.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn install_provider() {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	}

	fn scratch_dir(name: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("lipwig-tls-{name}-{}", std::process::id()));
		fs::create_dir_all(&dir).expect("create scratch dir");
		dir
	}

	#[test]
	fn loads_pem_cert_and_key_from_files() {
		install_provider();
		let dir = scratch_dir("files");
		let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("cert");
		fs::write(dir.join("cert.pem"), ck.cert.pem()).expect("write cert");
		fs::write(dir.join("key.pem"), ck.signing_key.serialize_pem()).expect("write key");

		build_server_config(&dir.join("cert.pem"), &dir.join("key.pem"), None).expect("server config");
		build_server_config(&dir.join("cert.pem"), &dir.join("key.pem"), Some(&dir.join("cert.pem")))
			.expect("server config with client CA");
	}

	#[test]
	fn rejects_missing_or_empty_material() {
		install_provider();
		let dir = scratch_dir("empty");
		fs::write(dir.join("empty.pem"), "").expect("write empty");

		assert!(build_server_config(&dir.join("nope.pem"), &dir.join("nope.pem"), None).is_err());
		let err = build_server_config(&dir.join("empty.pem"), &dir.join("empty.pem"), None).unwrap_err();
		assert!(err.to_string().contains("no certificates"), "{err:#}");
	}

	#[test]
	fn dev_config_returns_pinnable_certificate() {
		install_provider();
		let (_config, der) = build_dev_server_config(None).expect("dev config");
		assert!(!der.as_ref().is_empty());
	}
}
