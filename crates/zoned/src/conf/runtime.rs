use std::{net::SocketAddr, path::PathBuf, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use eyre::{WrapErr as _, eyre};
use zoned_store::MariaDbOpts;

use super::persistent::PersistentConfig;

pub struct Config {
	pub listen_addr:   SocketAddr,
	pub read_timeout:  Duration,
	pub aead_key:      [u8; 32],
	pub vault_key:     [u8; 32],
	pub sqlite_path:   PathBuf,
	pub vault_path:    PathBuf,
	pub stats_dir:     PathBuf,
	pub geoip_path:    PathBuf,
	pub mariadb:       Option<MariaDbOpts>,
	pub sync_interval: Duration,
}

impl Config {
	pub fn from_persist(config: PersistentConfig) -> eyre::Result<Self> {
		Ok(Self {
			listen_addr:   SocketAddr::from(([0, 0, 0, 0], config.server.port)),
			read_timeout:  Duration::from_secs(config.server.read_timeout_secs),
			aead_key:      decode_key(&config.server.aead_key).wrap_err("server.aeadKey")?,
			vault_key:     decode_key(&config.server.vault_key).wrap_err("server.vaultKey")?,
			sqlite_path:   config.database.sqlite_path,
			vault_path:    config.database.vault_path,
			stats_dir:     config.stats.dir,
			geoip_path:    config.geoip.path,
			mariadb:       config.database.mariadb.map(|db| MariaDbOpts {
				host:      db.host,
				port:      db.port,
				user:      db.user,
				password:  db.password,
				database:  db.database,
				pool_size: db.pool_size,
			}),
			sync_interval: Duration::from_secs(config.database.sync_interval_minutes * 60),
		})
	}
}

fn decode_key(encoded: &str) -> eyre::Result<[u8; 32]> {
	let raw = BASE64
		.decode(encoded.trim())
		.wrap_err("key is not valid base64")?;
	raw.try_into()
		.map_err(|_| eyre!("key must decode to exactly 32 bytes"))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn short_keys_are_rejected() {
		let mut persist = PersistentConfig::generate();
		persist.server.aead_key = BASE64.encode([0u8; 16]);
		assert!(Config::from_persist(persist).is_err());
	}

	#[test]
	fn generated_configs_resolve() -> eyre::Result<()> {
		let config = Config::from_persist(PersistentConfig::generate())?;
		assert_eq!(config.listen_addr.port(), 4242);
		assert_eq!(config.sync_interval, Duration::from_secs(15 * 60));
		assert!(config.mariadb.is_none());
		Ok(())
	}
}
