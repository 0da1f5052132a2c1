#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{LineClient, SECRET, connect, login, start_server};
use lipwig_server::ConnectionSettings;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

#[tokio::test]
async fn two_users_chat_through_a_topic() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut foo = login(addr, "foo").await;
	let mut bar = login(addr, "bar").await;

	foo.send("SUBSCRIBE lobby PRESENCE").await.expect("send");
	foo.expect("200").await;
	bar.send("SUBSCRIBE lobby").await.expect("send");
	bar.expect("200").await;
	foo.expect("000 bar SUBSCRIBE lobby").await;

	foo.send("MCAST lobby hello, bar").await.expect("send");
	foo.expect("200").await;
	bar.expect("000 foo MCAST lobby hello, bar").await;

	bar.send("UCAST foo hi foo").await.expect("send");
	bar.expect("200").await;
	foo.expect("000 bar UCAST foo hi foo").await;

	drop(bar);
	foo.expect("000 bar UNSUBSCRIBE lobby").await;

	server.stop().await;
}

#[tokio::test]
async fn first_line_must_be_a_valid_login() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut client = connect(addr).await;
	client.send("PING").await.expect("send");
	client.expect("400").await;
	client.expect_closed().await;

	let mut client = connect(addr).await;
	client.send("LOGIN foo").await.expect("send");
	client.expect("400").await;
	client.expect_closed().await;

	let mut client = connect(addr).await;
	client.send("LOGIN foo secret wrong").await.expect("send");
	client.expect("401").await;
	client.expect_closed().await;

	let mut client = connect(addr).await;
	client.send("LOGIN foo kerberos ticket").await.expect("send");
	client.expect("401").await;
	client.expect_closed().await;

	let mut client = connect(addr).await;
	client.send(&format!("LOGIN foo secret {SECRET}")).await.expect("send");
	client.expect("200").await;
	client.send("PING").await.expect("send");
	client.expect("000 . PONG").await;

	server.stop().await;
}

#[tokio::test]
async fn oversized_login_line_is_a_bad_request() {
	let server = start_server(ConnectionSettings {
		max_line_bytes: 256,
		..ConnectionSettings::default()
	})
	.await;

	let mut client = connect(server.local_addr()).await;
	client
		.send(&format!("LOGIN {} none", "x".repeat(300)))
		.await
		.expect("send");
	client.expect("400").await;
	client.expect_closed().await;

	server.stop().await;
}

#[tokio::test]
async fn login_deadline_closes_silent_clients() {
	let server = start_server(ConnectionSettings {
		login_timeout: Duration::from_millis(200),
		..ConnectionSettings::default()
	})
	.await;

	let mut client = connect(server.local_addr()).await;
	client.expect_closed().await;

	server.stop().await;
}

#[tokio::test]
async fn second_login_replaces_the_first_session() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut first = login(addr, "foo").await;
	let mut second = login(addr, "foo").await;
	first.expect_closed().await;
	assert_eq!(server.connections().len(), 1);

	let mut bar = login(addr, "bar").await;
	bar.send("UCAST foo ping?").await.expect("send");
	bar.expect("200").await;
	second.expect("000 bar UCAST foo ping?").await;

	server.stop().await;
}

#[tokio::test]
async fn ucast_to_self_and_to_nobody() {
	let server = start_server(ConnectionSettings::default()).await;
	let mut foo = login(server.local_addr(), "foo").await;

	foo.send("UCAST foo memo").await.expect("send");
	foo.expect("000 foo UCAST foo memo").await;
	foo.expect("200").await;

	foo.send("UCAST nobody hello").await.expect("send");
	foo.expect("404").await;
	foo.send("UCAST . hello").await.expect("send");
	foo.expect("404").await;

	server.stop().await;
}

#[tokio::test]
async fn anonymous_sessions_can_send_but_not_join() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut foo = login(addr, "foo").await;
	foo.send("SUBSCRIBE lobby").await.expect("send");
	foo.expect("200").await;

	let mut a = connect(addr).await;
	a.send("LOGIN . anonymous").await.expect("send");
	a.expect("200").await;
	let mut b = connect(addr).await;
	b.send("LOGIN . anonymous").await.expect("send");
	b.expect("200").await;

	a.send("SUBSCRIBE lobby").await.expect("send");
	a.expect("405").await;
	a.send("BCAST hi").await.expect("send");
	a.expect("405").await;

	a.send("MCAST lobby from the void").await.expect("send");
	a.expect("200").await;
	foo.expect("000 . MCAST lobby from the void").await;

	// Both anonymous sessions stay up side by side.
	b.send("UCAST foo also me").await.expect("send");
	b.expect("200").await;
	foo.expect("000 . UCAST foo also me").await;
	assert_eq!(server.connections().anonymous_len(), 2);

	server.stop().await;
}

#[tokio::test]
async fn bcast_reaches_each_peer_once() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut foo = login(addr, "foo").await;
	let mut bar = login(addr, "bar").await;

	// Pipelined: several commands in a single write.
	foo.send_raw(b"SUBSCRIBE a\nSUBSCRIBE b\n").await.expect("send");
	foo.expect("200").await;
	foo.expect("200").await;
	bar.send_raw(b"SUBSCRIBE a\nSUBSCRIBE b\n").await.expect("send");
	bar.expect("200").await;
	bar.expect("200").await;

	foo.send("BCAST once only").await.expect("send");
	foo.expect("200").await;
	bar.expect("000 foo BCAST once only").await;

	bar.send("PING").await.expect("send");
	bar.expect("000 . PONG").await;

	server.stop().await;
}

#[tokio::test]
async fn mcast_to_a_harvested_topic_is_not_found() {
	let server = start_server(ConnectionSettings::default()).await;
	let mut foo = login(server.local_addr(), "foo").await;

	foo.send("SUBSCRIBE temp").await.expect("send");
	foo.expect("200").await;
	foo.send("UNSUBSCRIBE temp").await.expect("send");
	foo.expect("200").await;
	assert!(server.topics().is_empty());

	foo.send("MCAST temp anyone?").await.expect("send");
	foo.expect("404").await;

	server.stop().await;
}

#[tokio::test]
async fn idle_sessions_are_pinged_then_closed() {
	let server = start_server(ConnectionSettings {
		idle_timeout: Duration::from_millis(200),
		..ConnectionSettings::default()
	})
	.await;
	let mut foo = login(server.local_addr(), "foo").await;

	foo.expect("000 . PING").await;
	foo.send("PONG").await.expect("send");

	// Answering resets the cycle: another ping, then silence closes.
	foo.expect("000 . PING").await;
	foo.expect_closed().await;

	server.stop().await;
}

#[tokio::test]
async fn close_and_oversized_lines_end_the_session() {
	let server = start_server(ConnectionSettings {
		max_line_bytes: 256,
		..ConnectionSettings::default()
	})
	.await;
	let addr = server.local_addr();

	let mut foo = login(addr, "foo").await;
	foo.send("CLOSE").await.expect("send");
	foo.expect("200").await;
	foo.expect_closed().await;

	let mut bar = login(addr, "bar").await;
	let long = format!("BCAST {}", "x".repeat(512));
	let _ = bar.send(&long).await;
	bar.expect_closed().await;

	server.stop().await;
}

#[tokio::test]
async fn stop_disconnects_everyone() {
	let server = start_server(ConnectionSettings::default()).await;
	let addr = server.local_addr();

	let mut foo = login(addr, "foo").await;
	let mut bar = login(addr, "bar").await;
	foo.send("SUBSCRIBE lobby").await.expect("send");
	foo.expect("200").await;

	server.stop().await;

	foo.expect_closed().await;
	bar.expect_closed().await;
	assert!(server.connections().is_empty());
	assert!(server.connections().is_shut_down());
	assert!(tokio::net::TcpStream::connect(addr).await.is_err());

	// Idempotent.
	server.stop().await;
}

/// Flood `target` with 1000-byte UCASTs from a client that never reads.
fn flood(mut sender: LineClient<TcpStream>, target: &'static str) -> JoinHandle<()> {
	tokio::spawn(async move {
		let line = format!("UCAST {target} {}\n", "x".repeat(1000));
		for _ in 0..20_000 {
			if sender.send_raw(line.as_bytes()).await.is_err() {
				break;
			}
		}
	})
}

#[tokio::test]
async fn slow_consumers_are_disconnected() {
	let server = start_server(ConnectionSettings {
		outbound_queue_frames: 16,
		..ConnectionSettings::default()
	})
	.await;
	let addr = server.local_addr();

	let mut slow = login(addr, "slow").await;
	let fast = login(addr, "fast").await;
	let flooding = flood(fast, "slow");

	let deadline = Instant::now() + Duration::from_secs(10);
	while server.connections().lookup("slow").is_some() {
		assert!(Instant::now() < deadline, "slow consumer was never dropped");
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	slow.expect_closed().await;
	flooding.abort();
	server.stop().await;
}

#[tokio::test]
async fn stop_returns_while_clients_are_not_reading() {
	// Nothing but the shutdown itself may release the blocked writers.
	let server = start_server(ConnectionSettings {
		write_timeout: Duration::from_secs(600),
		outbound_queue_frames: 1 << 20,
		..ConnectionSettings::default()
	})
	.await;
	let addr = server.local_addr();

	let mut slow = login(addr, "slow").await;
	slow.send("SUBSCRIBE lobby").await.expect("send");
	slow.expect("200").await;
	let fast = login(addr, "fast").await;
	let flooding = flood(fast, "slow");

	tokio::time::sleep(Duration::from_millis(500)).await;
	timeout(Duration::from_secs(5), server.stop())
		.await
		.expect("stop returns with a client that does not read");

	assert!(server.connections().is_empty());
	assert!(server.topics().is_empty());
	slow.expect_closed().await;
	flooding.abort();
}
