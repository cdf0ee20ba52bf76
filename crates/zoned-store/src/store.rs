//! Replicated timezone/identity store.
//!
//! Every mutation runs against the SQLite primary first and is then
//! mirrored to the MariaDB secondary within the same call, so a
//! response is never sent before both stores reflect the change.
//! Reads only ever hit the primary. A missing or failing secondary
//! degrades to primary-only operation; the reconciler converges the
//! mirror afterwards.

use std::{path::Path, time::Duration};

use eyre::WrapErr as _;
use mysql_async::{OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, prelude::Queryable as _};
use rusqlite::OptionalExtension as _;
use zoned_core::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS timezones
(
    user     INTEGER PRIMARY KEY NOT NULL,
    uuid     TEXT UNIQUE,
    timezone TEXT,
    alias    TEXT
);
CREATE TABLE IF NOT EXISTS tz_overrides
(
    uuid     TEXT PRIMARY KEY NOT NULL,
    timezone TEXT NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct MariaDbOpts {
	pub host:      String,
	pub port:      u16,
	pub user:      String,
	pub password:  String,
	pub database:  String,
	pub pool_size: usize,
}

#[derive(Clone)]
pub struct DataStore {
	primary:   tokio_rusqlite::Connection,
	secondary: Option<Pool>,
}

/// Tzdb names use underscores; user input may carry spaces.
pub fn normalize_timezone(tz: &str) -> String {
	tz.trim().replace(' ', "_")
}

impl DataStore {
	pub async fn open(path: impl AsRef<Path>, secondary: Option<MariaDbOpts>) -> eyre::Result<Self> {
		let primary = tokio_rusqlite::Connection::open(path.as_ref())
			.await
			.wrap_err_with(|| format!("failed to open primary store {}", path.as_ref().display()))?;
		Self::init(primary, secondary).await
	}

	pub async fn open_in_memory() -> eyre::Result<Self> {
		let primary = tokio_rusqlite::Connection::open_in_memory()
			.await
			.wrap_err("failed to open in-memory primary store")?;
		Self::init(primary, None).await
	}

	async fn init(primary: tokio_rusqlite::Connection, secondary: Option<MariaDbOpts>) -> eyre::Result<Self> {
		primary
			.call(|conn| Ok(conn.execute_batch(SCHEMA)?))
			.await
			.wrap_err("failed to create primary schema")?;

		let secondary = match secondary {
			Some(opts) => connect_secondary(opts).await,
			None => None,
		};

		Ok(Self { primary, secondary })
	}

	pub fn has_secondary(&self) -> bool {
		self.secondary.is_some()
	}

	/// Reconciler over the same connection pair, if a secondary exists.
	pub fn reconciler(&self, interval: Duration) -> Option<crate::Reconciler> {
		self.secondary
			.clone()
			.map(|pool| crate::Reconciler::new(self.primary.clone(), pool, interval))
	}

	pub async fn set_timezone(&self, user: i64, timezone: &str, alias: &str) -> eyre::Result<()> {
		let tz = normalize_timezone(timezone);
		let (tz2, alias2) = (tz.clone(), alias.to_owned());
		self.primary
			.call(move |conn| {
				Ok(conn.execute(
					"INSERT INTO timezones (user, timezone, alias) VALUES (?1, ?2, ?3) \
					 ON CONFLICT(user) DO UPDATE SET timezone = excluded.timezone, alias = excluded.alias",
					rusqlite::params![user, tz2, alias2],
				)?)
			})
			.await?;
		self.mirror(
			"INSERT INTO timezones (user, timezone, alias) VALUES (?, ?, ?) \
			 ON DUPLICATE KEY UPDATE timezone = VALUES(timezone), alias = VALUES(alias)",
			Params::from((user, tz, alias.to_owned())),
		)
		.await;
		Ok(())
	}

	pub async fn set_alias(&self, user: i64, alias: &str) -> eyre::Result<bool> {
		let alias2 = alias.to_owned();
		let affected = self
			.primary
			.call(move |conn| {
				Ok(conn.execute(
					"UPDATE timezones SET alias = ?1 WHERE user = ?2",
					rusqlite::params![alias2, user],
				)?)
			})
			.await?;
		if affected > 0 {
			self.mirror(
				"UPDATE timezones SET alias = ? WHERE user = ?",
				Params::from((alias.to_owned(), user)),
			)
			.await;
		}
		Ok(affected > 0)
	}

	pub async fn assign_uuid(&self, user: i64, uuid: &str, timezone: &str, alias: &str) -> eyre::Result<()> {
		let tz = normalize_timezone(timezone);
		let (uuid2, tz2, alias2) = (uuid.to_owned(), tz.clone(), alias.to_owned());
		self.primary
			.call(move |conn| {
				Ok(conn.execute(
					"INSERT INTO timezones (user, uuid, timezone, alias) VALUES (?1, ?2, ?3, ?4) \
					 ON CONFLICT(user) DO UPDATE SET uuid = excluded.uuid",
					rusqlite::params![user, uuid2, tz2, alias2],
				)?)
			})
			.await?;
		self.mirror(
			"INSERT INTO timezones (user, uuid, timezone, alias) VALUES (?, ?, ?, ?) \
			 ON DUPLICATE KEY UPDATE uuid = VALUES(uuid)",
			Params::from((user, uuid.to_owned(), tz, alias.to_owned())),
		)
		.await;
		Ok(())
	}

	pub async fn clear_uuid(&self, user: i64) -> eyre::Result<bool> {
		let affected = self
			.primary
			.call(move |conn| {
				Ok(conn.execute("UPDATE timezones SET uuid = NULL WHERE user = ?1", [user])?)
			})
			.await?;
		if affected > 0 {
			self.mirror("UPDATE timezones SET uuid = NULL WHERE user = ?", Params::from((user,)))
				.await;
		}
		Ok(affected > 0)
	}

	pub async fn get_timezone(&self, user: i64) -> eyre::Result<Option<String>> {
		let row = self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT timezone FROM timezones WHERE user = ?1", [user], |row| {
						row.get::<_, Option<String>>(0)
					})
					.optional()?)
			})
			.await?;
		Ok(row.flatten().filter(|tz| !tz.is_empty()))
	}

	pub async fn get_alias(&self, user: i64) -> eyre::Result<Option<String>> {
		let row = self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT alias FROM timezones WHERE user = ?1", [user], |row| {
						row.get::<_, Option<String>>(0)
					})
					.optional()?)
			})
			.await?;
		Ok(row.flatten().filter(|alias| !alias.is_empty()))
	}

	pub async fn get_uuid_by_user(&self, user: i64) -> eyre::Result<Option<String>> {
		let row = self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT uuid FROM timezones WHERE user = ?1", [user], |row| {
						row.get::<_, Option<String>>(0)
					})
					.optional()?)
			})
			.await?;
		Ok(row.flatten().filter(|uuid| !uuid.is_empty()))
	}

	pub async fn get_user_by_uuid(&self, uuid: &str) -> eyre::Result<Option<i64>> {
		let uuid = uuid.to_owned();
		Ok(self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT user FROM timezones WHERE uuid = ?1", [uuid], |row| {
						row.get::<_, i64>(0)
					})
					.optional()?)
			})
			.await?)
	}

	pub async fn get_alias_by_uuid(&self, uuid: &str) -> eyre::Result<Option<String>> {
		let uuid = uuid.to_owned();
		let row = self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT alias FROM timezones WHERE uuid = ?1", [uuid], |row| {
						row.get::<_, Option<String>>(0)
					})
					.optional()?)
			})
			.await?;
		Ok(row.map(Option::unwrap_or_default))
	}

	/// UUID-keyed timezone read; the overrides table shadows the
	/// timezones table when it has the key.
	pub async fn get_timezone_by_uuid(&self, uuid: &str) -> eyre::Result<Option<String>> {
		if let Some(tz) = self.get_override(uuid).await? {
			return Ok(Some(tz));
		}
		let uuid = uuid.to_owned();
		let row = self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT timezone FROM timezones WHERE uuid = ?1", [uuid], |row| {
						row.get::<_, Option<String>>(0)
					})
					.optional()?)
			})
			.await?;
		Ok(row.flatten().filter(|tz| !tz.is_empty()))
	}

	pub async fn set_override(&self, uuid: &str, timezone: &str) -> eyre::Result<()> {
		let tz = normalize_timezone(timezone);
		let (uuid2, tz2) = (uuid.to_owned(), tz.clone());
		self.primary
			.call(move |conn| {
				Ok(conn.execute(
					"INSERT INTO tz_overrides (uuid, timezone) VALUES (?1, ?2) \
					 ON CONFLICT(uuid) DO UPDATE SET timezone = excluded.timezone",
					rusqlite::params![uuid2, tz2],
				)?)
			})
			.await?;
		self.mirror(
			"INSERT INTO tz_overrides (uuid, timezone) VALUES (?, ?) \
			 ON DUPLICATE KEY UPDATE timezone = VALUES(timezone)",
			Params::from((uuid.to_owned(), tz)),
		)
		.await;
		Ok(())
	}

	pub async fn get_override(&self, uuid: &str) -> eyre::Result<Option<String>> {
		let uuid = uuid.to_owned();
		Ok(self
			.primary
			.call(move |conn| {
				Ok(conn
					.query_row("SELECT timezone FROM tz_overrides WHERE uuid = ?1", [uuid], |row| {
						row.get::<_, String>(0)
					})
					.optional()?)
			})
			.await?)
	}

	pub async fn all_overrides(&self) -> eyre::Result<Vec<(String, String)>> {
		Ok(self
			.primary
			.call(|conn| {
				let mut stmt = conn.prepare("SELECT uuid, timezone FROM tz_overrides")?;
				let rows = stmt
					.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(rows)
			})
			.await?)
	}

	pub async fn remove_override(&self, uuid: &str) -> eyre::Result<bool> {
		let uuid2 = uuid.to_owned();
		let affected = self
			.primary
			.call(move |conn| {
				Ok(conn.execute("DELETE FROM tz_overrides WHERE uuid = ?1", [uuid2])?)
			})
			.await?;
		// Deletions propagate through the ordinary dual write; the
		// reconciler never deletes.
		self.mirror("DELETE FROM tz_overrides WHERE uuid = ?", Params::from((uuid.to_owned(),)))
			.await;
		Ok(affected > 0)
	}

	async fn mirror(&self, stmt: &'static str, params: Params) {
		let Some(pool) = &self.secondary else { return };
		let outcome = async {
			let mut conn = pool.get_conn().await?;
			conn.exec_drop(stmt, params).await
		}
		.await;
		if let Err(err) = outcome {
			warn!(target: "[STORE]", "secondary write failed, leaving row for the reconciler: {err}");
		}
	}
}

async fn connect_secondary(opts: MariaDbOpts) -> Option<Pool> {
	let constraints = PoolConstraints::new(1, opts.pool_size.max(1))?;
	let builder = OptsBuilder::default()
		.ip_or_hostname(opts.host)
		.tcp_port(opts.port)
		.user(Some(opts.user))
		.pass(Some(opts.password))
		.db_name(Some(opts.database))
		.pool_opts(PoolOpts::default().with_constraints(constraints));
	let pool = Pool::new(builder);

	match tokio::time::timeout(Duration::from_secs(5), pool.get_conn()).await {
		Ok(Ok(conn)) => {
			drop(conn);
			Some(pool)
		}
		Ok(Err(err)) => {
			warn!(target: "[STORE]", "secondary unreachable at startup, running primary-only: {err}");
			None
		}
		Err(_) => {
			warn!(target: "[STORE]", "secondary connection timed out at startup, running primary-only");
			None
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn timezone_writes_normalize_spaces() -> eyre::Result<()> {
		let store = DataStore::open_in_memory().await?;
		store.set_timezone(1, "America/New York", "sam").await?;
		assert_eq!(store.get_timezone(1).await?.as_deref(), Some("America/New_York"));
		Ok(())
	}

	#[tokio::test]
	async fn uuid_binding_roundtrip() -> eyre::Result<()> {
		let store = DataStore::open_in_memory().await?;
		let uuid = "11111111-2222-3333-4444-555555555555";
		store.assign_uuid(42, uuid, "Europe/Prague", "eva").await?;

		assert_eq!(store.get_user_by_uuid(uuid).await?, Some(42));
		assert_eq!(store.get_uuid_by_user(42).await?.as_deref(), Some(uuid));
		assert_eq!(store.get_timezone_by_uuid(uuid).await?.as_deref(), Some("Europe/Prague"));
		assert_eq!(store.get_alias_by_uuid(uuid).await?.as_deref(), Some("eva"));

		assert!(store.clear_uuid(42).await?);
		assert_eq!(store.get_user_by_uuid(uuid).await?, None);
		assert_eq!(store.get_uuid_by_user(42).await?, None);
		Ok(())
	}

	#[tokio::test]
	async fn override_shadows_the_binding() -> eyre::Result<()> {
		let store = DataStore::open_in_memory().await?;
		let uuid = "11111111-2222-3333-4444-555555555555";
		store.assign_uuid(7, uuid, "Europe/Prague", "eva").await?;
		store.set_override(uuid, "Asia/Tokyo").await?;

		assert_eq!(store.get_timezone_by_uuid(uuid).await?.as_deref(), Some("Asia/Tokyo"));

		assert!(store.remove_override(uuid).await?);
		assert_eq!(store.get_timezone_by_uuid(uuid).await?.as_deref(), Some("Europe/Prague"));
		assert!(!store.remove_override(uuid).await?);
		Ok(())
	}

	#[tokio::test]
	async fn missing_rows_read_as_none() -> eyre::Result<()> {
		let store = DataStore::open_in_memory().await?;
		assert_eq!(store.get_timezone(999).await?, None);
		assert_eq!(store.get_alias(999).await?, None);
		assert_eq!(store.get_user_by_uuid("nope").await?, None);
		assert!(!store.set_alias(999, "ghost").await?);
		Ok(())
	}
}
