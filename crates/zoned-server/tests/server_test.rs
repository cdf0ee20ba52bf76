//! End-to-end tests for the dual-transport listener.
//!
//! Each case stands up a full service stack on a free local port and
//! talks to it over real sockets.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _},
	net::{TcpStream, UdpSocket},
	time::timeout,
};
use tokio_util::codec::Decoder as _;
use zoned_core::AppContext;
use zoned_proto::{FrameCodec, PacketFlags, RequestKind, open_frame, seal_frame};
use zoned_server::{
	events::EventSink,
	geo::{Geolocator, StaticRecord},
	inbound::{Inbound, InboundOpts},
	linkcode::LinkCodes,
	services::Services,
};
use zoned_store::{ApiKey, ApiPermissions, DataStore, KeyVault, StatsDb};

const AEAD_KEY: [u8; 32] = [0x42; 32];
const VAULT_KEY: [u8; 32] = [0x17; 32];

fn free_port() -> u16 {
	loop {
		let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = tcp.local_addr().unwrap().port();
		if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
			return port;
		}
	}
}

struct TestServer {
	ctx:      Arc<AppContext>,
	services: Services,
	addr:     SocketAddr,
	_stats:   tempfile::TempDir,
}

async fn spawn_server(geo: Geolocator) -> eyre::Result<TestServer> {
	let ctx = Arc::new(AppContext::new());
	let stats_dir = tempfile::tempdir()?;

	let services = Services {
		ctx:      ctx.clone(),
		store:    DataStore::open_in_memory().await?,
		vault:    KeyVault::open_in_memory(VAULT_KEY).await?,
		codes:    LinkCodes::new(),
		geo,
		events:   EventSink::start(&ctx),
		stats:    StatsDb::open(stats_dir.path()).await?,
		aead_key: AEAD_KEY,
	};

	let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse()?;
	let opts = InboundOpts { listen_addr: addr, read_timeout: Duration::from_secs(5) };
	let inbound = Inbound::new(ctx.clone(), opts, services.clone());
	tokio::spawn(async move {
		let _ = inbound.listen().await;
	});
	tokio::time::sleep(Duration::from_millis(200)).await;

	Ok(TestServer { ctx, services, addr, _stats: stats_dir })
}

fn parse_response(raw: &[u8]) -> serde_json::Value {
	let mut buf = BytesMut::from(raw);
	let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
	open_frame(&frame, &AEAD_KEY).unwrap()
}

async fn udp_roundtrip(addr: SocketAddr, packet: &[u8]) -> eyre::Result<serde_json::Value> {
	let socket = UdpSocket::bind("127.0.0.1:0").await?;
	socket.send_to(packet, addr).await?;
	let mut buf = vec![0u8; 65536];
	let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await??;
	Ok(parse_response(&buf[..len]))
}

fn request_packet(kind: RequestKind, flags: PacketFlags, body: serde_json::Value) -> Vec<u8> {
	seal_frame(kind, flags, &body, &AEAD_KEY).unwrap().to_vec()
}

async fn provision_key(services: &Services, perms: ApiPermissions) -> eyre::Result<String> {
	let sealed = services.vault.seal(&ApiKey::new(1, perms))?;
	services.vault.add_pending(&sealed, 1).await?;
	services.vault.promote(&sealed).await?;
	Ok(sealed)
}

#[test_log::test(tokio::test)]
async fn udp_ping_pong() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;

	// Literal wire bytes: "tz", headerLen 7, type 0, no flags, "{}".
	let response = udp_roundtrip(server.addr, b"tz\x07\x00\x00\x00\x02{}").await?;
	assert_eq!(response, serde_json::json!({ "code": 200, "message": "Pong" }));

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn tcp_ping_pong_closes_the_connection() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;

	let mut stream = TcpStream::connect(server.addr).await?;
	stream.write_all(b"tz\x07\x00\x00\x00\x02{}").await?;
	let mut raw = Vec::new();
	timeout(Duration::from_secs(3), stream.read_to_end(&mut raw)).await??;

	let response = parse_response(&raw);
	assert_eq!(response["code"], 200);
	assert_eq!(response["message"], "Pong");

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_api_key_is_forbidden() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;

	let packet = request_packet(
		RequestKind::TimezoneByUserId,
		PacketFlags::empty(),
		serde_json::json!({ "userId": 1 }),
	);
	let response = udp_roundtrip(server.addr, &packet).await?;
	assert_eq!(response, serde_json::json!({ "code": 403, "message": "Forbidden" }));

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn insufficient_permissions_are_forbidden() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	// DISCORD_ID alone cannot post UUID links.
	let key = provision_key(&server.services, ApiPermissions::DISCORD_ID).await?;

	let packet = request_packet(
		RequestKind::LinkPost,
		PacketFlags::empty(),
		serde_json::json!({
			"apiKey": key,
			"uuid": "11111111-2222-3333-4444-555555555555",
			"timezone": "Europe/Prague",
		}),
	);
	let response = udp_roundtrip(server.addr, &packet).await?;
	assert_eq!(response["code"], 403);

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn link_post_issues_a_code_once() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let key = provision_key(&server.services, ApiPermissions::UUID_POST).await?;

	let body = serde_json::json!({
		"apiKey": key,
		"uuid": "11111111-2222-3333-4444-555555555555",
		"timezone": "Europe/Prague",
	});

	let packet = request_packet(RequestKind::LinkPost, PacketFlags::empty(), body.clone());
	let response = udp_roundtrip(server.addr, &packet).await?;
	assert_eq!(response["code"], 200);
	let code = response["message"].as_str().unwrap();
	assert_eq!(code.len(), 6);
	assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));

	let entry = server.services.codes.claim(code).unwrap();
	assert_eq!(entry.uuid, "11111111-2222-3333-4444-555555555555");
	assert_eq!(entry.timezone, "Europe/Prague");

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn link_post_rejects_a_pending_uuid() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let key = provision_key(&server.services, ApiPermissions::UUID_POST).await?;

	let body = serde_json::json!({
		"apiKey": key,
		"uuid": "11111111-2222-3333-4444-555555555555",
		"timezone": "Europe/Prague",
	});

	let first = udp_roundtrip(
		server.addr,
		&request_packet(RequestKind::LinkPost, PacketFlags::empty(), body.clone()),
	)
	.await?;
	assert_eq!(first["code"], 200);

	let second = udp_roundtrip(
		server.addr,
		&request_packet(RequestKind::LinkPost, PacketFlags::empty(), body),
	)
	.await?;
	assert_eq!(second, serde_json::json!({ "code": 409, "message": "UUID already registered" }));

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn link_post_rejects_a_bound_uuid() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let key = provision_key(&server.services, ApiPermissions::UUID_POST).await?;
	server
		.services
		.store
		.assign_uuid(9, "11111111-2222-3333-4444-555555555555", "Europe/Prague", "eva")
		.await?;

	let packet = request_packet(
		RequestKind::LinkPost,
		PacketFlags::empty(),
		serde_json::json!({
			"apiKey": key,
			"uuid": "11111111-2222-3333-4444-555555555555",
			"timezone": "Europe/Prague",
		}),
	);
	let response = udp_roundtrip(server.addr, &packet).await?;
	assert_eq!(response["code"], 409);

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn malformed_uuid_is_rejected() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let key = provision_key(&server.services, ApiPermissions::MINECRAFT_UUID).await?;

	let packet = request_packet(
		RequestKind::TimezoneByUuid,
		PacketFlags::empty(),
		serde_json::json!({ "apiKey": key, "uuid": "not-a-uuid" }),
	);
	let response = udp_roundtrip(server.addr, &packet).await?;
	assert_eq!(response, serde_json::json!({ "code": 400, "message": "Invalid UUID" }));

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn lookups_resolve_bound_identities() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let key = provision_key(
		&server.services,
		ApiPermissions::MINECRAFT_UUID | ApiPermissions::DISCORD_ID,
	)
	.await?;
	let uuid = "11111111-2222-3333-4444-555555555555";
	server.services.store.assign_uuid(77, uuid, "Europe/Prague", "eva").await?;

	let tz = udp_roundtrip(
		server.addr,
		&request_packet(
			RequestKind::TimezoneByUuid,
			PacketFlags::empty(),
			serde_json::json!({ "apiKey": key, "uuid": uuid }),
		),
	)
	.await?;
	assert_eq!(tz["message"], "Europe/Prague");

	let user = udp_roundtrip(
		server.addr,
		&request_packet(
			RequestKind::UserIdByUuid,
			PacketFlags::empty(),
			serde_json::json!({ "apiKey": key, "uuid": uuid }),
		),
	)
	.await?;
	assert_eq!(user["message"], 77);

	let back = udp_roundtrip(
		server.addr,
		&request_packet(
			RequestKind::UuidByUserId,
			PacketFlags::empty(),
			serde_json::json!({ "apiKey": key, "userId": 77 }),
		),
	)
	.await?;
	assert_eq!(back["message"], uuid);

	let linked = udp_roundtrip(
		server.addr,
		&request_packet(
			RequestKind::IsLinked,
			PacketFlags::empty(),
			serde_json::json!({ "apiKey": key, "uuid": uuid }),
		),
	)
	.await?;
	assert_eq!(linked["code"], 200);
	assert_eq!(linked["message"], "eva");

	let missing = udp_roundtrip(
		server.addr,
		&request_packet(
			RequestKind::TimezoneByUuid,
			PacketFlags::empty(),
			serde_json::json!({ "apiKey": key, "uuid": "99999999-2222-3333-4444-555555555555" }),
		),
	)
	.await?;
	assert_eq!(missing["code"], 404);

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn encrypted_requests_roundtrip() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;
	let flags = PacketFlags::CHACHA_POLY | PacketFlags::GUNZIP | PacketFlags::MSGPACK;

	let socket = UdpSocket::bind("127.0.0.1:0").await?;
	let packet = request_packet(RequestKind::Ping, flags, serde_json::json!({}));
	socket.send_to(&packet, server.addr).await?;

	let mut buf = vec![0u8; 65536];
	let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await??;

	// The reply reuses the ingress flag set.
	let mut raw = BytesMut::from(&buf[..len]);
	let frame = FrameCodec.decode(&mut raw)?.unwrap();
	assert_eq!(frame.flags, flags);
	assert_eq!(frame.kind, RequestKind::Ping);
	let response = open_frame(&frame, &AEAD_KEY)?;
	assert_eq!(response["message"], "Pong");

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_request_type_is_invalid() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;

	let response = udp_roundtrip(server.addr, b"tz\x07\x09\x00\x00\x02{}").await?;
	assert_eq!(response["code"], 400);

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn bad_magic_over_tcp_gets_an_invalid_reply() -> eyre::Result<()> {
	let server = spawn_server(Geolocator::fixed(HashMap::new())).await?;

	let mut stream = TcpStream::connect(server.addr).await?;
	stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
	let mut raw = Vec::new();
	timeout(Duration::from_secs(8), stream.read_to_end(&mut raw)).await??;

	let response = parse_response(&raw);
	assert_eq!(response["code"], 400);

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}

#[test_log::test(tokio::test)]
async fn blocklisted_peers_get_no_bytes_back() -> eyre::Result<()> {
	let mut records = HashMap::new();
	records.insert(
		"127.0.0.1".parse().unwrap(),
		StaticRecord { country: Some("CN".into()), timezone: None },
	);
	let server = spawn_server(Geolocator::fixed(records)).await?;

	let socket = UdpSocket::bind("127.0.0.1:0").await?;
	socket.send_to(b"tz\x07\x00\x00\x00\x02{}", server.addr).await?;

	let mut buf = vec![0u8; 1024];
	let reply = timeout(Duration::from_millis(800), socket.recv_from(&mut buf)).await;
	assert!(reply.is_err(), "geo-dropped request must not produce a response");

	server.ctx.shutdown(Duration::from_secs(3)).await;
	Ok(())
}
