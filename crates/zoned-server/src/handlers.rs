//! The request table.
//!
//! Each entry composes the pre-checks that used to be an inheritance
//! chain: an encryption policy, a permission mask and a payload gate,
//! followed by the handler body. The table is indexed directly by the
//! request-type byte and its order is part of the wire contract.

use std::{net::SocketAddr, sync::LazyLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use zoned_proto::{PacketFlags, RequestKind, Response};
use zoned_store::{ApiPermissions, normalize_timezone};

use crate::{
	geo::{is_private_subnet, local_timezone},
	linkcode::CODE_TTL,
	services::Services,
};

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new("^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
		.unwrap()
});

pub fn is_uuid(value: &str) -> bool {
	UUID_RE.is_match(value)
}

/// Handler-facing view of one decoded request.
#[derive(Debug, Clone)]
pub struct Request {
	pub headers: serde_json::Map<String, Value>,
	pub data:    Value,
	pub peer:    SocketAddr,
	pub flags:   PacketFlags,
	pub country: Option<String>,
}

impl Request {
	pub fn api_key(&self) -> Option<&str> {
		self.headers.get("apiKey").and_then(Value::as_str)
	}

	/// Numeric user id; numeric strings are accepted too.
	pub fn user_id(&self) -> Option<i64> {
		match self.data.get("userId")? {
			Value::Number(n) => n.as_i64(),
			Value::String(s) => s.parse().ok(),
			_ => None,
		}
	}

	pub fn uuid(&self) -> Option<&str> {
		self.data.get("uuid").and_then(Value::as_str)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoPolicy {
	/// No demands on the flag byte.
	Open,
	/// Plaintext is tolerated from private subnets only.
	RequireUnlessPrivate,
	/// An AEAD flag is required unconditionally.
	Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadGate {
	None,
	UserId,
	Uuid,
}

pub type RunFn = for<'a> fn(&'a Services, &'a Request) -> BoxFuture<'a, eyre::Result<Response>>;

pub struct HandlerEntry {
	pub kind:    RequestKind,
	pub name:    &'static str,
	pub crypto:  CryptoPolicy,
	pub perms:   ApiPermissions,
	pub payload: PayloadGate,
	pub run:     RunFn,
}

pub static REQUEST_TABLE: [HandlerEntry; 8] = [
	HandlerEntry {
		kind:    RequestKind::Ping,
		name:    "Ping",
		crypto:  CryptoPolicy::Open,
		perms:   ApiPermissions::empty(),
		payload: PayloadGate::None,
		run:     ping,
	},
	HandlerEntry {
		kind:    RequestKind::TimezoneByUserId,
		name:    "TimezoneByUserId",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::DISCORD_ID,
		payload: PayloadGate::UserId,
		run:     timezone_by_user_id,
	},
	HandlerEntry {
		kind:    RequestKind::TimezoneByIp,
		name:    "TimezoneByIP",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::IP_ADDRESS,
		payload: PayloadGate::None,
		run:     timezone_by_ip,
	},
	HandlerEntry {
		kind:    RequestKind::LinkPost,
		name:    "LinkPost",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::UUID_POST,
		payload: PayloadGate::Uuid,
		run:     link_post,
	},
	HandlerEntry {
		kind:    RequestKind::TimezoneByUuid,
		name:    "TimezoneByUUID",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::MINECRAFT_UUID,
		payload: PayloadGate::Uuid,
		run:     timezone_by_uuid,
	},
	HandlerEntry {
		kind:    RequestKind::IsLinked,
		name:    "IsLinked",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::MINECRAFT_UUID,
		payload: PayloadGate::Uuid,
		run:     is_linked,
	},
	HandlerEntry {
		kind:    RequestKind::UserIdByUuid,
		name:    "UserIdByUUID",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::MINECRAFT_UUID.union(ApiPermissions::DISCORD_ID),
		payload: PayloadGate::Uuid,
		run:     user_id_by_uuid,
	},
	HandlerEntry {
		kind:    RequestKind::UuidByUserId,
		name:    "UUIDByUserId",
		crypto:  CryptoPolicy::RequireUnlessPrivate,
		perms:   ApiPermissions::MINECRAFT_UUID.union(ApiPermissions::DISCORD_ID),
		payload: PayloadGate::UserId,
		run:     uuid_by_user_id,
	},
];

pub fn lookup(kind: RequestKind) -> Option<&'static HandlerEntry> {
	let index = u8::from(kind) as usize;
	let entry = REQUEST_TABLE.get(index)?;
	(entry.kind == kind).then_some(entry)
}

fn ping<'a>(_services: &'a Services, _req: &'a Request) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async { Ok(Response::ok("Pong")) })
}

fn timezone_by_user_id<'a>(
	services: &'a Services,
	req: &'a Request,
) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(user) = req.user_id() else {
			return Ok(Response::bad_request());
		};
		Ok(match services.store.get_timezone(user).await? {
			Some(tz) => Response::ok(tz),
			None => Response::not_found(),
		})
	})
}

fn timezone_by_ip<'a>(
	services: &'a Services,
	req: &'a Request,
) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let asked = req.data.get("ip").and_then(Value::as_str).unwrap_or_default();
		if asked.is_empty() {
			return Ok(Response::bad_request());
		}
		let Ok(ip) = asked.parse::<std::net::IpAddr>() else {
			return Ok(Response::bad_request());
		};

		// An address that never leaves the site resolves to the zone
		// this host lives in.
		let zone = if is_private_subnet(ip) {
			local_timezone()
		} else {
			services.geo.timezone(ip)
		};
		Ok(match zone {
			Some(tz) => Response::ok(tz),
			None => Response::not_found(),
		})
	})
}

fn link_post<'a>(services: &'a Services, req: &'a Request) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(uuid) = req.uuid() else {
			return Ok(Response::bad_request().with_message("Invalid UUID"));
		};

		let timezone = normalize_timezone(
			req.data.get("timezone").and_then(Value::as_str).unwrap_or_default(),
		);
		if timezone.parse::<chrono_tz::Tz>().is_err() {
			return Ok(Response::not_found());
		}

		if services.store.get_user_by_uuid(uuid).await?.is_some() || services.codes.pending_for(uuid) {
			return Ok(Response::conflict().with_message("UUID already registered"));
		}

		let code = services.codes.issue(&services.ctx, uuid, &timezone, CODE_TTL);
		Ok(Response::ok(code))
	})
}

fn timezone_by_uuid<'a>(
	services: &'a Services,
	req: &'a Request,
) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(uuid) = req.uuid() else {
			return Ok(Response::bad_request().with_message("Invalid UUID"));
		};
		Ok(match services.store.get_timezone_by_uuid(uuid).await? {
			Some(tz) => Response::ok(tz),
			None => Response::not_found(),
		})
	})
}

fn is_linked<'a>(services: &'a Services, req: &'a Request) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(uuid) = req.uuid() else {
			return Ok(Response::bad_request().with_message("Invalid UUID"));
		};
		Ok(match services.store.get_alias_by_uuid(uuid).await? {
			Some(alias) => Response::ok(alias),
			None => Response::not_found(),
		})
	})
}

fn user_id_by_uuid<'a>(
	services: &'a Services,
	req: &'a Request,
) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(uuid) = req.uuid() else {
			return Ok(Response::bad_request().with_message("Invalid UUID"));
		};
		Ok(match services.store.get_user_by_uuid(uuid).await? {
			Some(user) => Response::ok(user),
			None => Response::not_found(),
		})
	})
}

fn uuid_by_user_id<'a>(
	services: &'a Services,
	req: &'a Request,
) -> BoxFuture<'a, eyre::Result<Response>> {
	Box::pin(async move {
		let Some(user) = req.user_id() else {
			return Ok(Response::bad_request());
		};
		Ok(match services.store.get_uuid_by_user(user).await? {
			Some(uuid) => Response::ok(uuid),
			None => Response::not_found(),
		})
	})
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn table_order_matches_the_type_bytes() {
		for (index, entry) in REQUEST_TABLE.iter().enumerate() {
			assert_eq!(u8::from(entry.kind) as usize, index, "{} is misplaced", entry.name);
		}
	}

	#[test]
	fn out_of_range_bytes_do_not_resolve() {
		assert!(lookup(RequestKind::from(8u8)).is_none());
		assert!(lookup(RequestKind::from(0xffu8)).is_none());
		assert!(lookup(RequestKind::LinkPost).is_some());
	}

	#[test]
	fn uuid_pattern_requires_hyphenation() {
		assert!(is_uuid("11111111-2222-3333-4444-555555555555"));
		assert!(is_uuid("AbCdEf01-9999-8888-7777-0123456789ab"));
		assert!(!is_uuid("111111112222333344445555555555555"));
		assert!(!is_uuid("not-a-uuid"));
		assert!(!is_uuid("11111111-2222-3333-4444-55555555555"));
		assert!(!is_uuid("11111111-2222-3333-4444-5555555555556"));
	}

	#[test]
	fn user_id_accepts_numbers_and_numeric_strings() {
		let req = |data: Value| Request {
			headers: serde_json::Map::new(),
			data,
			peer:    "127.0.0.1:1".parse().unwrap(),
			flags:   PacketFlags::empty(),
			country: None,
		};
		assert_eq!(req(serde_json::json!({ "userId": 42 })).user_id(), Some(42));
		assert_eq!(req(serde_json::json!({ "userId": "42" })).user_id(), Some(42));
		assert_eq!(req(serde_json::json!({ "userId": "x" })).user_id(), None);
		assert_eq!(req(serde_json::json!({})).user_id(), None);
	}
}
