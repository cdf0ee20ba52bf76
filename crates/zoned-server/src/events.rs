//! Structured per-request event stream.
//!
//! Handlers publish fire-and-forget onto an unbounded queue; a single
//! drain task turns events into the success or error log stream.
//! Ping traffic is suppressed, sensitive fields are redacted before
//! anything is written.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use zoned_core::{AppContext, error, info, types::Protocol, warn};
use zoned_proto::GEO_DROP;

#[derive(Debug, Clone)]
pub struct RequestEvent {
	pub request:    &'static str,
	pub protocol:   Protocol,
	/// Country code, or "Local" for private subnets.
	pub source:     String,
	pub transforms: Vec<&'static str>,
	pub data:       Value,
	pub response:   Value,
	pub success:    bool,
}

#[derive(Clone)]
pub struct EventSink {
	tx: mpsc::UnboundedSender<RequestEvent>,
}

impl EventSink {
	pub fn start(ctx: &Arc<AppContext>) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<RequestEvent>();
		let token = ctx.token.clone();
		ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = token.cancelled() => {
						while let Ok(event) = rx.try_recv() {
							write_event(event);
						}
						break;
					}
					event = rx.recv() => match event {
						Some(event) => write_event(event),
						None => break,
					}
				}
			}
		});
		Self { tx }
	}

	pub fn emit(&self, event: RequestEvent) {
		if event.request == "Ping" {
			return;
		}
		if self.tx.send(event).is_err() {
			warn!(target: "[EVENTS]", "event sink is gone, dropping event");
		}
	}
}

fn write_event(event: RequestEvent) {
	let data = redact(&event);
	let transforms = event.transforms.join(", ");
	if event.success {
		info!(
			target: "[PACKET]",
			"{} ({}, {}) [{}] data = {} response = {}",
			event.request, event.protocol, event.source, transforms, data, event.response,
		);
	} else {
		error!(
			target: "[PACKET]",
			"{} ({}, {}) [{}] data = {} response = {}",
			event.request, event.protocol, event.source, transforms, data, event.response,
		);
	}
}

fn redact(event: &RequestEvent) -> Value {
	// Geo-dropped requests never echo any part of their body.
	if event.response.get("code").and_then(Value::as_u64) == Some(GEO_DROP as u64) {
		return json!("<redacted>");
	}
	let mut data = event.data.clone();
	if event.request == "TimezoneByIP"
		&& let Some(map) = data.as_object_mut()
		&& map.contains_key("ip")
	{
		map.insert("ip".to_owned(), json!("<redacted>"));
	}
	data
}

/// Link codes stay out of the logs even though clients receive them.
pub fn redact_response(request: &'static str, response: Value) -> Value {
	if request == "LinkPost"
		&& let Some(code) = response.get("code").and_then(Value::as_u64)
		&& code == 200
	{
		return json!({ "code": code, "message": "<redacted>" });
	}
	response
}

#[cfg(test)]
mod test {
	use super::*;

	fn event(request: &'static str, data: Value, response: Value) -> RequestEvent {
		RequestEvent {
			request,
			protocol: Protocol::Udp,
			source: "CZ".into(),
			transforms: vec!["unencrypted", "JSON"],
			data,
			response,
			success: false,
		}
	}

	#[test]
	fn ip_lookups_redact_the_asked_address() {
		let ev = event(
			"TimezoneByIP",
			json!({ "ip": "198.51.100.7" }),
			json!({ "code": 200, "message": "Europe/Prague" }),
		);
		assert_eq!(redact(&ev), json!({ "ip": "<redacted>" }));
	}

	#[test]
	fn geo_drops_redact_the_whole_body() {
		let ev = event(
			"TimezoneByUserId",
			json!({ "userId": 1 }),
			json!({ "code": 498, "message": null }),
		);
		assert_eq!(redact(&ev), json!("<redacted>"));
	}

	#[test]
	fn link_codes_never_reach_the_stream() {
		let response = redact_response("LinkPost", json!({ "code": 200, "message": "ABC123" }));
		assert_eq!(response, json!({ "code": 200, "message": "<redacted>" }));

		let failure = redact_response("LinkPost", json!({ "code": 409, "message": "UUID already registered" }));
		assert_eq!(failure["message"], "UUID already registered");
	}
}
