use std::time::Duration;

use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Process-wide context shared by every subsystem.
///
/// `token` signals shutdown; `tasks` tracks every spawned request or
/// housekeeping task so the drain window at shutdown is enforceable.
#[derive(Debug, Default)]
pub struct AppContext {
	pub token: CancellationToken,
	pub tasks: TaskTracker,
}

impl AppContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Cancel everything, then wait up to `grace` for in-flight tasks.
	///
	/// Tasks still running after the grace window are abandoned; their
	/// clients see a closed connection or no datagram.
	pub async fn shutdown(&self, grace: Duration) -> bool {
		self.token.cancel();
		self.tasks.close();
		tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
	}
}
