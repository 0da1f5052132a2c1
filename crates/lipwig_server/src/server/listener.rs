#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::server::auth::{Authenticators, ConnectionMeta};
use crate::server::connection::{ConnectionSettings, SessionContext, handle_connection};
use crate::server::dispatcher::Dispatcher;
use crate::server::registry::ConnectionRegistry;
use crate::server::topic::TopicRegistry;

/// Everything needed to start a broker.
#[derive(Debug, Clone)]
pub struct ServerOptions {
	pub bind: SocketAddr,

	/// Wrap every accepted socket in a TLS handshake when set.
	pub tls: Option<Arc<rustls::ServerConfig>>,

	pub authenticators: Authenticators,

	pub settings: ConnectionSettings,
}

impl ServerOptions {
	pub fn new(bind: SocketAddr, authenticators: Authenticators) -> Self {
		Self {
			bind,
			tls: None,
			authenticators,
			settings: ConnectionSettings::default(),
		}
	}
}

/// A running broker: one accept task plus one task per client.
pub struct Server {
	local_addr: SocketAddr,
	ctx: Arc<SessionContext>,
	shutdown: watch::Sender<bool>,
	accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
	/// Bind the listener and start accepting. Bind failures are returned to
	/// the caller.
	pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(opts.bind)
			.await
			.with_context(|| format!("bind listener on {}", opts.bind))?;
		let local_addr = listener.local_addr().context("listener local address")?;

		let connections = ConnectionRegistry::new();
		let topics = TopicRegistry::new();
		let ctx = Arc::new(SessionContext {
			authenticators: Arc::new(opts.authenticators),
			connections: Arc::clone(&connections),
			dispatcher: Dispatcher::new(topics, connections),
			settings: opts.settings,
		});

		let acceptor = opts.tls.map(TlsAcceptor::from);
		let (shutdown, shutdown_rx) = watch::channel(false);

		info!(
			%local_addr,
			tls = acceptor.is_some(),
			"lipwig_server: listening"
		);

		let accept_task = tokio::spawn(accept_loop(listener, acceptor, Arc::clone(&ctx), shutdown_rx));

		Ok(Self {
			local_addr,
			ctx,
			shutdown,
			accept_task: Mutex::new(Some(accept_task)),
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn connections(&self) -> &Arc<ConnectionRegistry> {
		&self.ctx.connections
	}

	pub fn topics(&self) -> &Arc<TopicRegistry> {
		self.ctx.dispatcher.topics()
	}

	/// Stop accepting, close every session, and wait for all connection tasks
	/// to finish. Safe to call more than once.
	pub async fn stop(&self) {
		let _ = self.shutdown.send(true);

		let sessions = self.ctx.connections.shutdown();
		let closing = sessions.len();
		for conn in sessions {
			conn.close();
		}

		let task = self.accept_task.lock().take();
		if let Some(task) = task
			&& let Err(e) = task.await
		{
			warn!(error = %e, "accept task failed");
		}

		info!(closed_sessions = closing, "lipwig_server: stopped");
	}
}

async fn accept_loop(
	listener: TcpListener,
	acceptor: Option<TlsAcceptor>,
	ctx: Arc<SessionContext>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut tasks = JoinSet::new();
	let mut next_conn_id: u64 = 1;

	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
				if let Err(e) = joined {
					warn!(error = %e, "connection task panicked");
				}
			}
			accepted = listener.accept() => {
				let (stream, remote) = match accepted {
					Ok(v) => v,
					Err(e) => {
						warn!(error = %e, "accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
						continue;
					}
				};

				let conn_id = next_conn_id;
				next_conn_id += 1;
				metrics::counter!("lipwig_connections_total").increment(1);
				debug!(conn_id, %remote, "accepted connection");

				tasks.spawn(serve_socket(
					stream,
					remote,
					conn_id,
					acceptor.clone(),
					Arc::clone(&ctx),
					shutdown.clone(),
				));
			}
		}
	}

	drop(listener);

	while let Some(joined) = tasks.join_next().await {
		if let Err(e) = joined {
			warn!(error = %e, "connection task panicked");
		}
	}
}

async fn serve_socket(
	stream: TcpStream,
	remote: SocketAddr,
	conn_id: u64,
	acceptor: Option<TlsAcceptor>,
	ctx: Arc<SessionContext>,
	mut shutdown: watch::Receiver<bool>,
) {
	if let Err(e) = stream.set_nodelay(true) {
		debug!(conn_id, error = %e, "set_nodelay failed");
	}

	let result = match acceptor {
		None => handle_connection(stream, ConnectionMeta::plain(conn_id, Some(remote)), ctx, shutdown).await,
		Some(acceptor) => {
			let handshake = tokio::select! {
				_ = shutdown.changed() => return,
				r = timeout(ctx.settings.tls_handshake_timeout, acceptor.accept(stream)) => r,
			};

			let tls = match handshake {
				Ok(Ok(tls)) => tls,
				Ok(Err(e)) => {
					debug!(conn_id, %remote, error = %e, "tls handshake failed");
					metrics::counter!("lipwig_tls_handshake_failures_total").increment(1);
					return;
				}
				Err(_) => {
					debug!(conn_id, %remote, "tls handshake timed out");
					metrics::counter!("lipwig_tls_handshake_failures_total").increment(1);
					return;
				}
			};

			let peer_certificates = tls
				.get_ref()
				.1
				.peer_certificates()
				.map(|chain| chain.iter().map(|c| c.clone().into_owned()).collect::<Vec<_>>());
			let meta = ConnectionMeta {
				conn_id,
				remote: Some(remote),
				peer_certificates,
			};

			handle_connection(tls, meta, ctx, shutdown).await
		}
	};

	if let Err(e) = result {
		debug!(conn_id, error = %e, "connection handler exited with error");
	}
}
