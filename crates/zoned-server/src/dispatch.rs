//! Packet-to-response pipeline.
//!
//! Runs once per enqueued packet: framing, transforms, the guard
//! chain, the handler body, then the egress write plus event and
//! statistics fan-out. A response set by an earlier guard is final;
//! later stages never overwrite it.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::Decoder as _;
use zoned_core::{debug, error, warn};
use zoned_proto::{Frame, FrameCodec, Response, open_frame};

use crate::{
	client::Client,
	events::{RequestEvent, redact_response},
	geo::{BLOCKED_COUNTRIES, is_private_subnet},
	handlers::{CryptoPolicy, HandlerEntry, PayloadGate, Request, is_uuid, lookup},
	services::Services,
};

/// Entry point for one raw packet from either transport.
pub async fn handle_packet(services: Services, mut client: Client, raw: BytesMut) {
	services.stats.add_received_bandwidth(raw.len()).await;
	services.stats.add_protocol(client.protocol()).await;

	let mut buf = raw;
	let frame = match FrameCodec.decode(&mut buf) {
		Ok(Some(frame)) => frame,
		Ok(None) | Err(_) => {
			debug!(target: "[DISPATCH]", "unparseable {} packet from {}", client.protocol(), client.peer());
			respond_invalid(&services, client).await;
			return;
		}
	};
	client.set_context(frame.kind, frame.flags);

	let Some(entry) = lookup(frame.kind) else {
		warn!(target: "[DISPATCH]", "unknown request type {} from {}", u8::from(frame.kind), client.peer());
		respond_invalid(&services, client).await;
		return;
	};

	let request = match decode_request(&frame, &services, &client) {
		Ok(request) => request,
		Err(_) => {
			respond_invalid(&services, client).await;
			return;
		}
	};

	services.stats.add_known_request_type(entry.name).await;
	debug!(
		target: "[DISPATCH]",
		"{} request over {} [{}]",
		entry.name, client.protocol(), frame.flags.describe().join(", "),
	);

	let response = match gate(entry, &services, &request).await {
		Some(rejection) => rejection,
		None => match (entry.run)(&services, &request).await {
			Ok(response) => response,
			Err(err) => {
				error!(target: "[DISPATCH]", "{} handler failed: {err:?}", entry.name);
				Response::internal_error()
			}
		},
	};

	finish(&services, client, entry.name, &request, response).await;
}

/// 400 for packets that never made it to a handler.
pub async fn respond_invalid(services: &Services, mut client: Client) {
	let response = Response::bad_request();
	let sent = client.send(&response, &services.aead_key).await;
	client.close().await;
	match sent {
		Ok(bytes) => services.stats.add_sent_bandwidth(bytes).await,
		Err(err) => debug!(target: "[DISPATCH]", "invalid-request response not delivered: {err}"),
	}
	services.stats.add_failed_request().await;

	services.events.emit(RequestEvent {
		request:    "INVALID",
		protocol:   client.protocol(),
		source:     source_label(services, &client),
		transforms: Vec::new(),
		data:       Value::Null,
		response:   response.to_value(),
		success:    false,
	});
}

fn decode_request(frame: &Frame, services: &Services, client: &Client) -> eyre::Result<Request> {
	let decoded = open_frame(frame, &services.aead_key)?;
	let Value::Object(mut root) = decoded else {
		eyre::bail!("request body is not an object");
	};
	// Payload fields either nest under "data" or sit at the root next
	// to the headers; both shapes are on the wire in the wild.
	let data = match root.remove("data") {
		Some(nested) => nested,
		None => Value::Object(root.clone()),
	};

	Ok(Request {
		headers: root,
		data,
		peer: client.peer(),
		flags: frame.flags,
		country: services.geo.country(client.peer().ip()),
	})
}

/// The ordered guard chain; the first rejection is the response.
async fn gate(entry: &HandlerEntry, services: &Services, request: &Request) -> Option<Response> {
	// Blocklisted geolocation suppresses the response entirely.
	if request
		.country
		.as_deref()
		.is_some_and(|code| BLOCKED_COUNTRIES.contains(&code))
	{
		return Some(Response::geo_drop());
	}

	match entry.crypto {
		CryptoPolicy::Open => {}
		CryptoPolicy::RequireUnlessPrivate => {
			if !request.flags.is_encrypted() && !is_private_subnet(request.peer.ip()) {
				return Some(Response::bad_request().with_message("Bad Request, Unencrypted"));
			}
		}
		CryptoPolicy::Require => {
			if !request.flags.is_encrypted() {
				return Some(Response::bad_request().with_message("Bad Request, Unencrypted"));
			}
		}
	}

	if !entry.perms.is_empty() {
		let Some(raw_key) = request.api_key() else {
			return Some(Response::forbidden());
		};
		match services.vault.is_valid(raw_key).await {
			Ok(true) => {}
			Ok(false) => {
				warn!(target: "[DISPATCH]", "api key is not in the vault");
				return Some(Response::forbidden());
			}
			Err(err) => {
				error!(target: "[DISPATCH]", "vault lookup failed: {err:?}");
				return Some(Response::forbidden());
			}
		}
		let api_key = match services.vault.open_key(raw_key) {
			Ok(key) => key,
			Err(err) => {
				warn!(target: "[DISPATCH]", "approved api key failed to decrypt: {err}");
				return Some(Response::forbidden());
			}
		};
		if !api_key.has_permissions(entry.perms) {
			warn!(target: "[DISPATCH]", "api key of owner {} lacks permissions", api_key.owner);
			return Some(Response::forbidden());
		}
	}

	match entry.payload {
		PayloadGate::None => {}
		PayloadGate::UserId => {
			if request.user_id().is_none() {
				return Some(Response::bad_request());
			}
		}
		PayloadGate::Uuid => {
			if !request.uuid().is_some_and(is_uuid) {
				return Some(Response::bad_request().with_message("Invalid UUID"));
			}
		}
	}

	None
}

async fn finish(
	services: &Services,
	mut client: Client,
	name: &'static str,
	request: &Request,
	response: Response,
) {
	let source = source_label(services, &client);
	services.stats.add_request_country(&source).await;

	if response.is_geo_drop() {
		// No bytes leave the host; only the event sink sees the drop.
		client.close().await;
		services.stats.add_failed_request().await;
	} else {
		match client.send(&response, &services.aead_key).await {
			Ok(bytes) => services.stats.add_sent_bandwidth(bytes).await,
			Err(err) => warn!(target: "[DISPATCH]", "response to {} not delivered: {err}", client.peer()),
		}
		client.close().await;
		if response.is_success() {
			services.stats.add_successful_request().await;
		} else {
			services.stats.add_failed_request().await;
		}
	}

	services.events.emit(RequestEvent {
		request:    name,
		protocol:   client.protocol(),
		source,
		transforms: request.flags.describe(),
		data:       request.data.clone(),
		response:   redact_response(name, response.to_value()),
		success:    response.is_success(),
	});
}

fn source_label(services: &Services, client: &Client) -> String {
	if is_private_subnet(client.peer().ip()) {
		return "Local".to_owned();
	}
	services
		.geo
		.country(client.peer().ip())
		.unwrap_or_else(|| "Unknown".to_owned())
}
