#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use lipwig_protocol::{ANONYMOUS, Code, MAX_LINE_LEN, Verb, event, parse_login};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::server::auth::{Authenticators, ConnectionMeta};
use crate::server::dispatcher::{Dispatcher, announce_leave};
use crate::server::registry::ConnectionRegistry;
use crate::server::topic::Topic;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Deadline for the LOGIN line.
	pub login_timeout: Duration,

	/// Rolling read deadline once authenticated. The first expiry sends a
	/// PING, the second consecutive one closes the session.
	pub idle_timeout: Duration,

	pub tls_handshake_timeout: Duration,

	/// Longest accepted line, terminator included.
	pub max_line_bytes: usize,

	/// Bound on one flush to the socket, and on the drain after close. A
	/// peer that stops reading is dropped once it elapses.
	pub write_timeout: Duration,

	/// Frames a session may have queued but not yet written. A write that
	/// finds the queue full ends the session.
	pub outbound_queue_frames: usize,
}

pub const DEFAULT_OUTBOUND_QUEUE_FRAMES: usize = 1024;

/// How long queued frames may still flush once the server is stopping.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(250);

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			login_timeout: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(30),
			tls_handshake_timeout: Duration::from_secs(10),
			max_line_bytes: MAX_LINE_LEN,
			write_timeout: Duration::from_secs(10),
			outbound_queue_frames: DEFAULT_OUTBOUND_QUEUE_FRAMES,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// One authenticated client session.
///
/// Frames written here are queued for a writer task that owns the socket
/// write half, so `write` never blocks the caller. The queue is bounded: a
/// consumer that falls too far behind is marked stalled and its session ends.
#[derive(Debug)]
pub struct Connection {
	id: u64,
	user: String,
	remote: Option<SocketAddr>,
	closed: AtomicBool,
	stalled: AtomicBool,
	outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
	topics: Mutex<HashMap<String, Weak<Topic>>>,
	closed_notify: Notify,
	stalled_notify: Notify,
	registry: Weak<ConnectionRegistry>,
}

impl Connection {
	/// Create a session bound to `registry`. The receiver yields every frame
	/// written to the connection, in order.
	pub fn new(
		id: u64,
		user: impl Into<String>,
		remote: Option<SocketAddr>,
		registry: &Arc<ConnectionRegistry>,
	) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		Self::with_queue_capacity(id, user, remote, registry, DEFAULT_OUTBOUND_QUEUE_FRAMES)
	}

	/// Like [`Connection::new`] with room for `capacity` unwritten frames.
	pub fn with_queue_capacity(
		id: u64,
		user: impl Into<String>,
		remote: Option<SocketAddr>,
		registry: &Arc<ConnectionRegistry>,
		capacity: usize,
	) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		Self::build(id, user.into(), remote, Arc::downgrade(registry), capacity)
	}

	/// A session that belongs to no registry. Used by tests and tools that
	/// drive the dispatcher without sockets.
	pub fn detached(id: u64, user: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		Self::build(id, user.into(), None, Weak::new(), DEFAULT_OUTBOUND_QUEUE_FRAMES)
	}

	fn build(
		id: u64,
		user: String,
		remote: Option<SocketAddr>,
		registry: Weak<ConnectionRegistry>,
		capacity: usize,
	) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let conn = Arc::new(Self {
			id,
			user,
			remote,
			closed: AtomicBool::new(false),
			stalled: AtomicBool::new(false),
			outbound: Mutex::new(Some(tx)),
			topics: Mutex::new(HashMap::new()),
			closed_notify: Notify::new(),
			stalled_notify: Notify::new(),
			registry,
		});
		(conn, rx)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn user(&self) -> &str {
		&self.user
	}

	pub fn remote(&self) -> Option<SocketAddr> {
		self.remote
	}

	pub fn is_anonymous(&self) -> bool {
		self.user == ANONYMOUS
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// The outbound queue overflowed. The session task closes a stalled
	/// connection; until then every write fails.
	pub fn is_stalled(&self) -> bool {
		self.stalled.load(Ordering::Acquire)
	}

	/// Queue one frame. Fails fast once the connection is closed or stalled.
	///
	/// Never closes inline: callers may hold topic locks that `close` needs.
	pub fn write(&self, frame: Bytes) -> Result<(), ConnectionClosed> {
		if self.is_closed() || self.is_stalled() {
			return Err(ConnectionClosed);
		}

		let outbound = self.outbound.lock();
		let Some(tx) = outbound.as_ref() else {
			return Err(ConnectionClosed);
		};

		match tx.try_send(frame) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => {
				if !self.stalled.swap(true, Ordering::AcqRel) {
					warn!(conn_id = self.id, user = %self.user, "outbound queue full, dropping slow consumer");
					metrics::counter!("lipwig_slow_consumers_total").increment(1);
					self.stalled_notify.notify_one();
				}
				Err(ConnectionClosed)
			}
			Err(TrySendError::Closed(_)) => Err(ConnectionClosed),
		}
	}

	/// Tear the session down. Only the first call does anything; it returns
	/// `true`.
	pub fn close(&self) -> bool {
		if self
			.closed
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return false;
		}

		if let Some(registry) = self.registry.upgrade() {
			registry.deregister(self);
		}

		let topics = {
			let mut topics = self.topics.lock();
			topics.drain().filter_map(|(_, t)| t.upgrade()).collect::<Vec<_>>()
		};
		for topic in topics {
			if topic.unsubscribe(self) {
				announce_leave(&topic, self);
			}
		}

		// The writer drains what is already queued, then shuts the socket.
		self.outbound.lock().take();
		self.closed_notify.notify_one();

		debug!(conn_id = self.id, user = %self.user, remote = ?self.remote(), "connection closed");
		true
	}

	/// Resolves once `close` has run.
	pub async fn closed(&self) {
		if self.is_closed() {
			return;
		}
		self.closed_notify.notified().await;
	}

	/// Resolves once a write has found the outbound queue full.
	pub async fn stalled(&self) {
		if self.is_stalled() {
			return;
		}
		self.stalled_notify.notified().await;
	}

	/// Live topics this connection is subscribed to.
	pub fn topics(&self) -> Vec<Arc<Topic>> {
		self.topics.lock().values().filter_map(Weak::upgrade).collect()
	}

	pub fn topic_names(&self) -> Vec<String> {
		let mut names = self.topics.lock().keys().cloned().collect::<Vec<_>>();
		names.sort();
		names
	}

	/// Record membership. Called with the topic's member lock held.
	pub(crate) fn attach_topic(&self, topic: &Arc<Topic>) -> Result<(), ConnectionClosed> {
		let mut topics = self.topics.lock();
		// Checked under the topic-set lock: `close` flips the flag before it
		// drains this map, so a concurrent close never misses an entry.
		if self.is_closed() {
			return Err(ConnectionClosed);
		}
		topics.insert(topic.name().to_string(), Arc::downgrade(topic));
		Ok(())
	}

	pub(crate) fn detach_topic(&self, topic: &Arc<Topic>) {
		let mut topics = self.topics.lock();
		if topics
			.get(topic.name())
			.is_some_and(|t| std::ptr::eq(t.as_ptr(), Arc::as_ptr(topic)))
		{
			topics.remove(topic.name());
		}
	}
}

/// Shared state every session needs.
#[derive(Debug)]
pub struct SessionContext {
	pub authenticators: Arc<Authenticators>,
	pub connections: Arc<ConnectionRegistry>,
	pub dispatcher: Dispatcher,
	pub settings: ConnectionSettings,
}

/// Run one client from the LOGIN handshake until the session ends.
pub async fn handle_connection<S>(
	stream: S,
	meta: ConnectionMeta,
	ctx: Arc<SessionContext>,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let conn_id = meta.conn_id;
	let max_line = ctx.settings.max_line_bytes;

	let (read_half, mut write_half) = tokio::io::split(stream);
	let mut reader = BufReader::new(read_half);
	let mut line = Vec::with_capacity(max_line);

	if *shutdown.borrow_and_update() {
		return Ok(());
	}

	let first = tokio::select! {
		_ = shutdown.changed() => return Ok(()),
		r = timeout(ctx.settings.login_timeout, read_line(&mut reader, &mut line, max_line)) => r,
	};

	match first {
		Err(_) => {
			debug!(conn_id, "login timed out");
			metrics::counter!("lipwig_logins_rejected_total", "reason" => "timeout").increment(1);
			return Ok(());
		}
		Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
			debug!(conn_id, error = %e, "oversized login line");
			metrics::counter!("lipwig_logins_rejected_total", "reason" => "malformed").increment(1);
			reject(&mut write_half, Code::BadRequest, ctx.settings.write_timeout).await;
			return Ok(());
		}
		Ok(Err(e)) => {
			metrics::counter!("lipwig_logins_rejected_total", "reason" => "io").increment(1);
			return Err(anyhow!(e).context("read login line"));
		}
		Ok(Ok(LineRead::Eof)) => return Ok(()),
		Ok(Ok(LineRead::Line)) => {}
	}

	let login = match parse_login(&line) {
		Ok(login) => login,
		Err(e) => {
			debug!(conn_id, error = %e, "malformed login");
			metrics::counter!("lipwig_logins_rejected_total", "reason" => "malformed").increment(1);
			reject(&mut write_half, Code::BadRequest, ctx.settings.write_timeout).await;
			return Ok(());
		}
	};

	if !ctx
		.authenticators
		.authenticate(&meta, login.user, login.scheme, login.credential)
	{
		warn!(conn_id, user = login.user, scheme = login.scheme, "login rejected");
		metrics::counter!("lipwig_logins_rejected_total", "reason" => "unauthorized").increment(1);
		reject(&mut write_half, Code::Unauthorized, ctx.settings.write_timeout).await;
		return Ok(());
	}

	let (conn, outbound) = Connection::with_queue_capacity(
		conn_id,
		login.user,
		meta.remote,
		&ctx.connections,
		ctx.settings.outbound_queue_frames,
	);
	line.clear();

	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("lipwig_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("lipwig_active_connections").increment(1.0);
	metrics::counter!("lipwig_logins_total").increment(1);
	let _conn_guard = ConnectionGaugeGuard;

	// The ack is queued before the session becomes reachable, so it always
	// precedes any event.
	let _ = conn.write(Bytes::from_static(Code::Ok.line()));
	let mut writer = tokio::spawn(write_loop(
		Arc::clone(&conn),
		write_half,
		outbound,
		ctx.settings.write_timeout,
	));

	match ctx.connections.register(Arc::clone(&conn)) {
		Ok(Some(previous)) => {
			info!(
				conn_id,
				user = %conn.user(),
				previous_conn_id = previous.id(),
				"superseding previous session"
			);
			previous.close();
		}
		Ok(None) => {}
		Err(e) => {
			debug!(conn_id, error = %e, "registry closed, dropping session");
			conn.close();
		}
	}

	info!(conn_id, user = %conn.user(), remote = ?meta.remote, "session established");

	read_loop(&conn, &mut reader, &mut line, &ctx).await;
	conn.close();

	// The writer owns the write half. Bound its drain so a peer that stopped
	// reading cannot keep the socket, or a server stop, waiting.
	let drained = if conn.is_stalled() {
		None
	} else {
		tokio::select! {
			r = &mut writer => Some(r),
			_ = stopping(&mut shutdown) => timeout(SHUTDOWN_DRAIN, &mut writer).await.ok(),
		}
	};
	match drained {
		Some(Ok(())) => {}
		Some(Err(e)) => warn!(conn_id, error = %e, "writer task failed"),
		None => {
			debug!(conn_id, "abandoning queued frames, dropping socket");
			writer.abort();
		}
	}

	info!(conn_id, user = %conn.user(), "session ended");
	Ok(())
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, code: Code, limit: Duration) {
	let _ = timeout(limit, async {
		let _ = writer.write_all(code.line()).await;
		let _ = writer.shutdown().await;
	})
	.await;
}

/// Resolves once the server signals shutdown. A dropped sender never does.
async fn stopping(shutdown: &mut watch::Receiver<bool>) {
	if shutdown.wait_for(|stop| *stop).await.is_err() {
		std::future::pending::<()>().await;
	}
}

async fn read_loop<R: AsyncBufRead + Unpin>(
	conn: &Arc<Connection>,
	reader: &mut R,
	line: &mut Vec<u8>,
	ctx: &SessionContext,
) {
	let conn_id = conn.id();
	let ping = event(ANONYMOUS, Verb::Ping, None, None);
	let mut ping_pending = false;

	while !conn.is_closed() {
		let read = tokio::select! {
			_ = conn.closed() => break,
			_ = conn.stalled() => {
				info!(conn_id, "slow consumer, closing");
				break;
			}
			r = timeout(ctx.settings.idle_timeout, read_line(reader, line, ctx.settings.max_line_bytes)) => r,
		};

		match read {
			Err(_) => {
				if ping_pending {
					info!(conn_id, "idle timeout, closing");
					metrics::counter!("lipwig_idle_timeouts_total").increment(1);
					break;
				}
				ping_pending = true;
				debug!(conn_id, "idle, sending ping");
				if conn.write(ping.clone()).is_err() {
					break;
				}
			}
			Ok(Ok(LineRead::Line)) => {
				ping_pending = false;
				ctx.dispatcher.dispatch(conn, line);
				line.clear();
			}
			Ok(Ok(LineRead::Eof)) => {
				debug!(conn_id, "peer closed");
				break;
			}
			Ok(Err(e)) => {
				debug!(conn_id, error = %e, "read failed");
				break;
			}
		}
	}
}

async fn write_loop<W: AsyncWrite + Unpin>(
	conn: Arc<Connection>,
	writer: W,
	mut outbound: mpsc::Receiver<Bytes>,
	write_timeout: Duration,
) {
	let mut writer = BufWriter::new(writer);

	while let Some(frame) = outbound.recv().await {
		match timeout(write_timeout, write_batch(&mut writer, frame, &mut outbound)).await {
			Ok(Ok(frames)) => metrics::counter!("lipwig_frames_out_total").increment(frames),
			Ok(Err(e)) => {
				debug!(conn_id = conn.id(), error = %e, "write failed");
				conn.close();
				return;
			}
			Err(_) => {
				info!(conn_id = conn.id(), "write timed out, closing");
				metrics::counter!("lipwig_write_timeouts_total").increment(1);
				conn.close();
				return;
			}
		}
	}

	let _ = timeout(write_timeout, writer.shutdown()).await;
}

/// Write `first` plus whatever else is already queued, then flush once.
async fn write_batch<W: AsyncWrite + Unpin>(
	writer: &mut BufWriter<W>,
	first: Bytes,
	outbound: &mut mpsc::Receiver<Bytes>,
) -> io::Result<u64> {
	let mut frames = 1u64;
	writer.write_all(&first).await?;
	while let Ok(next) = outbound.try_recv() {
		frames += 1;
		writer.write_all(&next).await?;
	}
	writer.flush().await?;
	Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineRead {
	/// A full line is in the buffer, terminator stripped.
	Line,
	Eof,
}

/// Read up to and including `\n`, never buffering more than `max` bytes.
///
/// Cancel safe: bytes of a partial line stay in `buf`, so a timed out read
/// resumes where it left off.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(
	reader: &mut R,
	buf: &mut Vec<u8>,
	max: usize,
) -> io::Result<LineRead> {
	let limit = max.saturating_sub(buf.len()) as u64;
	if limit == 0 {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
	}

	let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
	if buf.last() == Some(&b'\n') {
		buf.pop();
		return Ok(LineRead::Line);
	}
	if n as u64 == limit {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
	}
	Ok(LineRead::Eof)
}
