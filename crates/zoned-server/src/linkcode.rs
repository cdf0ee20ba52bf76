//! Ephemeral link codes pairing a UUID+timezone to a pending binding.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use rand::Rng as _;
use zoned_core::AppContext;

pub const CODE_LEN: usize = 6;
pub const CODE_TTL: Duration = Duration::from_secs(15 * 60);

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
	pub uuid:     String,
	pub timezone: String,
}

/// In-memory `code -> (uuid, timezone)` registry. Each insert arms a
/// removal task; a claim races that task and the first removal wins.
#[derive(Clone, Default)]
pub struct LinkCodes {
	inner: Arc<Mutex<HashMap<String, LinkEntry>>>,
}

impl LinkCodes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn issue(&self, ctx: &AppContext, uuid: &str, timezone: &str, ttl: Duration) -> String {
		let code = generate_code();
		self.inner.lock().unwrap().insert(
			code.clone(),
			LinkEntry { uuid: uuid.to_owned(), timezone: timezone.to_owned() },
		);

		let registry = self.inner.clone();
		let token = ctx.token.clone();
		let expiring = code.clone();
		ctx.tasks.spawn(async move {
			tokio::select! {
				_ = token.cancelled() => {}
				_ = tokio::time::sleep(ttl) => {
					registry.lock().unwrap().remove(&expiring);
				}
			}
		});

		code
	}

	/// Consumes the entry; `None` when the code expired or was never
	/// issued.
	pub fn claim(&self, code: &str) -> Option<LinkEntry> {
		self.inner.lock().unwrap().remove(code)
	}

	pub fn contains(&self, code: &str) -> bool {
		self.inner.lock().unwrap().contains_key(code)
	}

	/// Whether some outstanding code already targets `uuid`.
	pub fn pending_for(&self, uuid: &str) -> bool {
		self.inner
			.lock()
			.unwrap()
			.values()
			.any(|entry| entry.uuid == uuid)
	}
}

fn generate_code() -> String {
	let mut rng = rand::rng();
	(0..CODE_LEN)
		.map(|_| CODE_CHARSET[rng.random_range(0..CODE_CHARSET.len())] as char)
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn codes_are_six_uppercase_alphanumerics() {
		for _ in 0..64 {
			let code = generate_code();
			assert_eq!(code.len(), CODE_LEN);
			assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
		}
	}

	#[tokio::test]
	async fn claim_consumes_the_entry() {
		let ctx = AppContext::new();
		let codes = LinkCodes::new();
		let code = codes.issue(&ctx, "some-uuid", "Europe/Prague", Duration::from_secs(60));

		assert!(codes.pending_for("some-uuid"));
		let entry = codes.claim(&code).unwrap();
		assert_eq!(entry.timezone, "Europe/Prague");
		assert!(codes.claim(&code).is_none());
		assert!(!codes.pending_for("some-uuid"));
	}

	#[tokio::test(start_paused = true)]
	async fn entries_expire_after_the_ttl() {
		let ctx = AppContext::new();
		let codes = LinkCodes::new();
		let code = codes.issue(&ctx, "some-uuid", "Europe/Prague", Duration::from_secs(30));

		tokio::time::sleep(Duration::from_secs(29)).await;
		assert!(codes.contains(&code));

		tokio::time::sleep(Duration::from_secs(2)).await;
		// Let the armed removal task run.
		tokio::task::yield_now().await;
		assert!(!codes.contains(&code));
	}
}
