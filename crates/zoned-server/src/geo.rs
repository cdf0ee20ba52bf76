//! Peer geolocation and address policy.

use std::{
	collections::HashMap,
	net::{IpAddr, Ipv4Addr},
	path::Path,
	sync::Arc,
};

use eyre::WrapErr as _;
use maxminddb::geoip2;

/// Countries whose requests are dropped without a response.
pub const BLOCKED_COUNTRIES: [&str; 5] = ["CN", "HK", "MO", "SG", "TW"];

/// Static lookup record used when no real database is loaded.
#[derive(Debug, Clone, Default)]
pub struct StaticRecord {
	pub country:  Option<String>,
	pub timezone: Option<String>,
}

#[derive(Clone)]
enum Inner {
	MaxMind(Arc<maxminddb::Reader<Vec<u8>>>),
	Fixed(Arc<HashMap<IpAddr, StaticRecord>>),
}

/// City-level IP lookups over a MaxMind database, with a fixed-table
/// variant so tests can pin arbitrary peers to arbitrary countries.
#[derive(Clone)]
pub struct Geolocator {
	inner: Inner,
}

impl Geolocator {
	/// Startup is expected to abort when the database cannot be read.
	pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
		let reader = maxminddb::Reader::open_readfile(path.as_ref())
			.wrap_err_with(|| format!("failed to open geolocation database {}", path.as_ref().display()))?;
		Ok(Self { inner: Inner::MaxMind(Arc::new(reader)) })
	}

	pub fn fixed(records: HashMap<IpAddr, StaticRecord>) -> Self {
		Self { inner: Inner::Fixed(Arc::new(records)) }
	}

	/// ISO country code of the peer; silent on a lookup miss.
	pub fn country(&self, ip: IpAddr) -> Option<String> {
		match &self.inner {
			Inner::MaxMind(reader) => {
				let city: geoip2::City = reader.lookup(ip).ok()?;
				city.country.and_then(|c| c.iso_code).map(str::to_owned)
			}
			Inner::Fixed(records) => records.get(&ip)?.country.clone(),
		}
	}

	pub fn timezone(&self, ip: IpAddr) -> Option<String> {
		match &self.inner {
			Inner::MaxMind(reader) => {
				let city: geoip2::City = reader.lookup(ip).ok()?;
				city.location.and_then(|l| l.time_zone).map(str::to_owned)
			}
			Inner::Fixed(records) => records.get(&ip)?.timezone.clone(),
		}
	}

	pub fn is_blocked(&self, ip: IpAddr) -> bool {
		self.country(ip)
			.is_some_and(|code| BLOCKED_COUNTRIES.contains(&code.as_str()))
	}
}

/// The zone this host lives in, read off the `/etc/localtime` symlink.
pub fn local_timezone() -> Option<String> {
	let target = std::fs::read_link("/etc/localtime").ok()?;
	let mut parts = target
		.components()
		.filter_map(|c| c.as_os_str().to_str())
		.rev();
	let city = parts.next()?;
	let area = parts.next()?;
	Some(format!("{area}/{city}"))
}

/// Whether `ip` belongs to a subnet that never leaves the site:
/// RFC1918, loopback, link-local, CGNAT, documentation, benchmarking,
/// IETF assignments, 240/4 and broadcast.
pub fn is_private_subnet(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => is_private_v4(v4),
		IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(is_private_v4),
	}
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
	let octets = ip.octets();
	ip.is_private()
		|| ip.is_loopback()
		|| ip.is_link_local()
		|| ip.is_documentation()
		|| ip.is_broadcast()
		// CGNAT, 100.64.0.0/10
		|| (octets[0] == 100 && (octets[1] & 0xc0) == 64)
		// IETF protocol assignments, 192.0.0.0/24
		|| (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
		// Benchmarking, 198.18.0.0/15
		|| (octets[0] == 198 && (octets[1] == 18 || octets[1] == 19))
		// Reserved, 240.0.0.0/4
		|| octets[0] >= 240
}
