#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use lipwig_server::server::auth::{OPEN_SCHEME, OpenAuth, SECRET_SCHEME, SharedSecret};
use lipwig_server::{Authenticators, ConnectionSettings, Server, ServerOptions};
use lipwig_util::SecretString;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const SECRET: &str = "hunter2";

/// Upper bound for any single read in these tests.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("LIPWIG_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

/// `none`, `secret` and anonymous logins enabled.
pub fn test_authenticators() -> Authenticators {
	Authenticators::new()
		.with_anonymous(true)
		.with_scheme(OPEN_SCHEME, OpenAuth)
		.with_scheme(
			SECRET_SCHEME,
			SharedSecret::new(SecretString::new(SECRET)).expect("shared secret"),
		)
}

pub async fn start_server(settings: ConnectionSettings) -> Server {
	init_test_logging();

	let mut opts = ServerOptions::new(
		"127.0.0.1:0".parse().expect("loopback addr"),
		test_authenticators(),
	);
	opts.settings = settings;
	Server::bind(opts).await.expect("bind server")
}

/// A line-oriented SSMP client over any byte stream.
pub struct LineClient<S> {
	reader: BufReader<ReadHalf<S>>,
	writer: WriteHalf<S>,
}

impl<S> LineClient<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	pub fn new(stream: S) -> Self {
		let (read_half, writer) = tokio::io::split(stream);
		Self {
			reader: BufReader::new(read_half),
			writer,
		}
	}

	/// Send `line` plus the terminator.
	pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
		self.send_raw(format!("{line}\n").as_bytes()).await
	}

	pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
		self.writer.write_all(bytes).await.context("write")?;
		self.writer.flush().await.context("flush")
	}

	/// Next line without its terminator. EOF is an error.
	pub async fn recv(&mut self) -> anyhow::Result<String> {
		match self.recv_or_eof().await? {
			Some(line) => Ok(line),
			None => Err(anyhow!("unexpected EOF")),
		}
	}

	async fn recv_or_eof(&mut self) -> anyhow::Result<Option<String>> {
		let mut line = String::new();
		let n = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
			.await
			.context("read timed out")?
			.context("read")?;
		if n == 0 {
			return Ok(None);
		}
		if line.pop() != Some('\n') {
			return Err(anyhow!("partial line before EOF: {line:?}"));
		}
		Ok(Some(line))
	}

	pub async fn expect(&mut self, expected: &str) {
		let got = self.recv().await.unwrap_or_else(|e| panic!("waiting for {expected:?}: {e:#}"));
		assert_eq!(got, expected);
	}

	/// The server closed the stream, possibly after some lines. Read errors
	/// such as a reset also count as closed.
	pub async fn expect_closed(&mut self) {
		loop {
			match self.recv_or_eof().await {
				Ok(Some(_)) => continue,
				Ok(None) => return,
				Err(e) if e.to_string().contains("timed out") => panic!("connection stayed open"),
				Err(_) => return,
			}
		}
	}

	/// Nothing arrives for `wait`.
	pub async fn expect_silence(&mut self, wait: Duration) {
		let mut line = String::new();
		if let Ok(read) = timeout(wait, self.reader.read_line(&mut line)).await {
			panic!("expected silence, got {read:?} / {line:?}");
		}
	}
}

pub async fn connect(addr: SocketAddr) -> LineClient<TcpStream> {
	let stream = TcpStream::connect(addr).await.expect("connect");
	LineClient::new(stream)
}

/// Connect and complete `LOGIN <user> none`.
pub async fn login(addr: SocketAddr, user: &str) -> LineClient<TcpStream> {
	let mut client = connect(addr).await;
	client.send(&format!("LOGIN {user} {OPEN_SCHEME}")).await.expect("send login");
	client.expect("200").await;
	client
}
