use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Tcp => write!(f, "TCP"),
			Protocol::Udp => write!(f, "UDP"),
		}
	}
}
