use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Response code that never reaches the wire: the geo blocklist
/// suppresses the reply entirely and only the event sink sees it.
pub const GEO_DROP: u16 = 498;

/// The `{code, message}` object every handler resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub code:    u16,
	pub message: Value,
}

impl Response {
	pub fn ok(message: impl Into<Value>) -> Self {
		Self { code: 200, message: message.into() }
	}

	pub fn bad_request() -> Self {
		Self { code: 400, message: "Bad Request".into() }
	}

	pub fn forbidden() -> Self {
		Self { code: 403, message: "Forbidden".into() }
	}

	pub fn not_found() -> Self {
		Self { code: 404, message: "Not Found".into() }
	}

	pub fn bad_method() -> Self {
		Self { code: 405, message: "Bad Method".into() }
	}

	pub fn conflict() -> Self {
		Self { code: 409, message: "Conflict".into() }
	}

	pub fn internal_error() -> Self {
		Self { code: 500, message: "Internal Server Error".into() }
	}

	pub fn geo_drop() -> Self {
		Self { code: GEO_DROP, message: Value::Null }
	}

	/// Same code, different message. Used where a gate narrows a
	/// generic rejection ("Bad Request, Unencrypted", "Invalid UUID").
	pub fn with_message(mut self, message: impl Into<Value>) -> Self {
		self.message = message.into();
		self
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.code)
	}

	pub fn is_geo_drop(&self) -> bool {
		self.code == GEO_DROP
	}

	pub fn to_value(&self) -> Value {
		json!({ "code": self.code, "message": self.message })
	}
}
