use num_enum::{FromPrimitive, IntoPrimitive};

/// Request-type byte of the packet header.
///
/// The order is part of the wire contract and indexes the handler
/// table directly; new request types append at the end.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
	Ping             = 0,
	TimezoneByUserId = 1,
	TimezoneByIp     = 2,
	LinkPost         = 3,
	TimezoneByUuid   = 4,
	IsLinked         = 5,
	UserIdByUuid     = 6,
	UuidByUserId     = 7,
	#[num_enum(catch_all)]
	Other(u8),
}

impl RequestKind {
	pub fn name(self) -> &'static str {
		match self {
			RequestKind::Ping => "Ping",
			RequestKind::TimezoneByUserId => "TimezoneByUserId",
			RequestKind::TimezoneByIp => "TimezoneByIP",
			RequestKind::LinkPost => "LinkPost",
			RequestKind::TimezoneByUuid => "TimezoneByUUID",
			RequestKind::IsLinked => "IsLinked",
			RequestKind::UserIdByUuid => "UserIdByUUID",
			RequestKind::UuidByUserId => "UUIDByUserId",
			RequestKind::Other(..) => "INVALID",
		}
	}
}
