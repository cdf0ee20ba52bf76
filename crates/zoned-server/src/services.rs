use std::sync::Arc;

use zoned_core::AppContext;
use zoned_store::{DataStore, KeyVault, StatsDb};

use crate::{events::EventSink, geo::Geolocator, linkcode::LinkCodes};

/// Everything a handler may touch, passed by value instead of living
/// in globals.
#[derive(Clone)]
pub struct Services {
	pub ctx:      Arc<AppContext>,
	pub store:    DataStore,
	pub vault:    KeyVault,
	pub codes:    LinkCodes,
	pub geo:      Geolocator,
	pub events:   EventSink,
	pub stats:    StatsDb,
	pub aead_key: [u8; 32],
}
