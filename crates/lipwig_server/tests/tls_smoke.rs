#![forbid(unsafe_code)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{LineClient, init_test_logging, test_authenticators};
use lipwig_server::server::auth::{CERT_SCHEME, CertificateAuth};
use lipwig_server::tls::{build_dev_server_config, build_server_config};
use lipwig_server::{Server, ServerOptions};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

fn install_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

struct ClientIdentity {
	chain: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	pem: String,
}

fn client_identity(cn: &str) -> ClientIdentity {
	let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).expect("cert params");
	params.distinguished_name.push(rcgen::DnType::CommonName, cn);
	params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
	let key = rcgen::KeyPair::generate().expect("key pair");
	let cert = params.self_signed(&key).expect("client cert");

	ClientIdentity {
		chain: vec![CertificateDer::from(cert.der().to_vec())],
		key: PrivateKeyDer::try_from(key.serialize_der()).expect("client key der"),
		pem: cert.pem(),
	}
}

async fn start_tls_server(tls: Arc<rustls::ServerConfig>) -> Server {
	init_test_logging();

	let mut opts = ServerOptions::new(
		"127.0.0.1:0".parse().expect("loopback addr"),
		test_authenticators().with_scheme(CERT_SCHEME, CertificateAuth),
	);
	opts.tls = Some(tls);
	Server::bind(opts).await.expect("bind tls server")
}

async fn tls_connect(
	addr: SocketAddr,
	server_cert: &CertificateDer<'static>,
	identity: Option<&ClientIdentity>,
) -> LineClient<TlsStream<TcpStream>> {
	let mut roots = RootCertStore::empty();
	roots.add(server_cert.clone()).expect("pin server cert");

	let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
	let config = match identity {
		Some(id) => builder
			.with_client_auth_cert(id.chain.clone(), id.key.clone_key())
			.expect("client auth cert"),
		None => builder.with_no_client_auth(),
	};

	let tcp = TcpStream::connect(addr).await.expect("connect");
	let name = ServerName::try_from("localhost").expect("server name");
	let stream = TlsConnector::from(Arc::new(config))
		.connect(name, tcp)
		.await
		.expect("tls handshake");
	LineClient::new(stream)
}

#[tokio::test]
async fn dev_certificate_serves_ssmp_over_tls() {
	install_provider();
	let (tls, server_cert) = build_dev_server_config(None).expect("dev tls config");
	let server = start_tls_server(tls).await;

	let mut client = tls_connect(server.local_addr(), &server_cert, None).await;
	client.send("LOGIN . anonymous").await.expect("send");
	client.expect("200").await;
	client.send("PING").await.expect("send");
	client.expect("000 . PONG").await;

	// Without a client certificate the cert scheme has nothing to match.
	let mut client = tls_connect(server.local_addr(), &server_cert, None).await;
	client.send("LOGIN alice cert").await.expect("send");
	client.expect("401").await;

	server.stop().await;
}

#[tokio::test]
async fn client_certificate_identifies_the_user() {
	install_provider();

	let alice = client_identity("alice");
	let dir = std::env::temp_dir().join(format!("lipwig-tls-smoke-{}", std::process::id()));
	std::fs::create_dir_all(&dir).expect("scratch dir");

	let server_ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("server cert");
	let server_cert = CertificateDer::from(server_ck.cert.der().to_vec());
	std::fs::write(dir.join("server.pem"), server_ck.cert.pem()).expect("write server cert");
	std::fs::write(dir.join("server.key"), server_ck.signing_key.serialize_pem()).expect("write server key");
	std::fs::write(dir.join("clients.pem"), &alice.pem).expect("write client CA");

	let tls = build_server_config(
		&dir.join("server.pem"),
		&dir.join("server.key"),
		Some(&dir.join("clients.pem")),
	)
	.expect("tls config");
	let server = start_tls_server(tls).await;
	let addr = server.local_addr();

	let mut client = tls_connect(addr, &server_cert, Some(&alice)).await;
	client.send("LOGIN alice/laptop cert").await.expect("send");
	client.expect("200").await;

	let mut impostor = tls_connect(addr, &server_cert, Some(&alice)).await;
	impostor.send("LOGIN bob cert").await.expect("send");
	impostor.expect("401").await;
	impostor.expect_closed().await;

	// Certificate-less clients may still use other schemes.
	let mut plain = tls_connect(addr, &server_cert, None).await;
	plain.send("LOGIN bob none").await.expect("send");
	plain.expect("200").await;
	plain.send("UCAST alice/laptop hello alice").await.expect("send");
	plain.expect("200").await;
	client.expect("000 bob UCAST alice/laptop hello alice").await;

	server.stop().await;
}
