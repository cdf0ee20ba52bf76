use std::path::PathBuf;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use educe::Educe;
use eyre::WrapErr as _;
use figment::{
	Figment,
	providers::{Env, Format, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentConfig {
	pub server:   ServerOpt,
	pub database: DatabaseOpt,
	pub geoip:    GeoIpOpt,
	pub stats:    StatsOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOpt {
	#[educe(Default = 4242)]
	pub port: u16,

	/// Base64 of the 32-byte shared AEAD key.
	#[educe(Default = "")]
	pub aead_key: String,

	/// Base64 of the 32-byte API-key vault key.
	#[educe(Default = "")]
	pub vault_key: String,

	#[educe(Default = 5)]
	pub read_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseOpt {
	#[educe(Default(expression = PathBuf::from("zoned.db")))]
	pub sqlite_path: PathBuf,

	#[educe(Default(expression = PathBuf::from("api_keys.db")))]
	pub vault_path: PathBuf,

	/// Secondary mirror; absent means primary-only operation.
	#[educe(Default = None)]
	pub mariadb: Option<MariaDbOpt>,

	#[educe(Default = 15)]
	pub sync_interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MariaDbOpt {
	#[educe(Default = "localhost")]
	pub host: String,

	#[educe(Default = 3306)]
	pub port: u16,

	#[educe(Default = "zoned")]
	pub user: String,

	#[educe(Default = "")]
	pub password: String,

	#[educe(Default = "zoned")]
	pub database: String,

	#[educe(Default = 8)]
	pub pool_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoIpOpt {
	#[educe(Default(expression = PathBuf::from("GeoLite2-City.mmdb")))]
	pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsOpt {
	#[educe(Default(expression = PathBuf::from("stats")))]
	pub dir: PathBuf,
}

impl PersistentConfig {
	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		// Load from the default configuration location
		if let Some(config_dir) = config_dir {
			let config_file = config_dir.join("config.json");
			if config_file.exists() {
				figment = figment.merge(Json::file(config_file));
			}
		} else {
			let config_json = std::path::Path::new("config.json");
			if config_json.exists() {
				figment = figment.merge(Json::file(config_json));
			}
		}

		// A specific config path wins over the defaults
		if let Some(config_path) = config_path {
			figment = figment.merge(Json::file(config_path));
		}

		// Environment variables can override config files
		figment = figment.merge(Env::prefixed("ZONED_"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}

	/// Default config with freshly generated key material, for `init`.
	pub fn generate() -> Self {
		let mut config = Self::default();
		config.server.aead_key = BASE64.encode(rand::random::<[u8; 32]>());
		config.server.vault_key = BASE64.encode(rand::random::<[u8; 32]>());
		config
	}

	pub fn export_to_file(&self, file_path: &PathBuf) -> eyre::Result<()> {
		let json = serde_json::to_string_pretty(self)?;
		std::fs::write(file_path, json)
			.wrap_err_with(|| format!("failed to write {}", file_path.display()))?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn generated_configs_roundtrip_through_json() -> eyre::Result<()> {
		let dir = tempfile::tempdir()?;
		let path = dir.path().join("config.json");
		PersistentConfig::generate().export_to_file(&path)?;

		let loaded = PersistentConfig::load(Some(path.to_string_lossy().into_owned()), None)?;
		assert_eq!(loaded.server.port, 4242);
		assert_eq!(BASE64.decode(&loaded.server.aead_key)?.len(), 32);
		assert_eq!(loaded.database.sync_interval_minutes, 15);
		assert!(loaded.database.mariadb.is_none());
		Ok(())
	}
}
