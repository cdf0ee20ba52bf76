//! Primary→secondary reconciliation.
//!
//! Wakes on a fixed interval, walks each primary table keyed by its
//! primary-key column and inserts or updates whatever the secondary is
//! missing. Rows are never deleted here: the primary is authoritative
//! for presence and deletions travel through the ordinary dual write.

use std::{collections::HashMap, sync::Arc, time::Duration};

use mysql_async::{Pool, prelude::Queryable as _};
use zoned_core::{AppContext, error, info};

#[derive(Debug, Clone, PartialEq)]
struct TimezoneRow {
	user:     i64,
	uuid:     Option<String>,
	timezone: Option<String>,
	alias:    Option<String>,
}

pub struct Reconciler {
	primary:   tokio_rusqlite::Connection,
	secondary: Pool,
	interval:  Duration,
}

impl Reconciler {
	pub fn new(primary: tokio_rusqlite::Connection, secondary: Pool, interval: Duration) -> Self {
		Self { primary, secondary, interval }
	}

	/// Runs until cancellation; a shutdown signalled mid-sync lets the
	/// current table finish before the loop exits.
	pub async fn run(self, ctx: Arc<AppContext>) {
		loop {
			tokio::select! {
				_ = ctx.token.cancelled() => {
					info!(target: "[SYNC]", "reconciler shutting down");
					break;
				}
				_ = tokio::time::sleep(self.interval) => {
					if let Err(err) = self.sync_all().await {
						error!(target: "[SYNC]", "reconciliation pass failed: {err:?}");
					}
				}
			}
		}
	}

	pub async fn sync_all(&self) -> eyre::Result<()> {
		self.sync_timezones().await?;
		self.sync_overrides().await?;
		Ok(())
	}

	async fn sync_timezones(&self) -> eyre::Result<()> {
		let primary_rows: Vec<TimezoneRow> = self
			.primary
			.call(|conn| {
				let mut stmt = conn.prepare("SELECT user, uuid, timezone, alias FROM timezones")?;
				let rows = stmt
					.query_map([], |row| {
						Ok(TimezoneRow {
							user:     row.get(0)?,
							uuid:     row.get(1)?,
							timezone: row.get(2)?,
							alias:    row.get(3)?,
						})
					})?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(rows)
			})
			.await?;

		let mut conn = self.secondary.get_conn().await?;
		let secondary_rows: Vec<(i64, Option<String>, Option<String>, Option<String>)> =
			conn.query("SELECT user, uuid, timezone, alias FROM timezones").await?;
		let mirrored: HashMap<i64, TimezoneRow> = secondary_rows
			.into_iter()
			.map(|(user, uuid, timezone, alias)| (user, TimezoneRow { user, uuid, timezone, alias }))
			.collect();

		let mut inserts = 0usize;
		let mut updates = 0usize;
		for row in primary_rows {
			match mirrored.get(&row.user) {
				None => {
					conn.exec_drop(
						"INSERT INTO timezones (user, uuid, timezone, alias) VALUES (?, ?, ?, ?)",
						(row.user, row.uuid, row.timezone, row.alias),
					)
					.await?;
					inserts += 1;
				}
				Some(existing) if *existing != row => {
					conn.exec_drop(
						"UPDATE timezones SET uuid = ?, timezone = ?, alias = ? WHERE user = ?",
						(row.uuid, row.timezone, row.alias, row.user),
					)
					.await?;
					updates += 1;
				}
				Some(_) => {}
			}
		}

		info!(target: "[SYNC]", "timezones: inserted = {inserts}, updated = {updates}");
		Ok(())
	}

	async fn sync_overrides(&self) -> eyre::Result<()> {
		let primary_rows: Vec<(String, String)> = self
			.primary
			.call(|conn| {
				let mut stmt = conn.prepare("SELECT uuid, timezone FROM tz_overrides")?;
				let rows = stmt
					.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
					.collect::<Result<Vec<_>, _>>()?;
				Ok(rows)
			})
			.await?;

		let mut conn = self.secondary.get_conn().await?;
		let secondary_rows: Vec<(String, String)> =
			conn.query("SELECT uuid, timezone FROM tz_overrides").await?;
		let mirrored: HashMap<String, String> = secondary_rows.into_iter().collect();

		let mut inserts = 0usize;
		let mut updates = 0usize;
		for (uuid, timezone) in primary_rows {
			match mirrored.get(&uuid) {
				None => {
					conn.exec_drop(
						"INSERT INTO tz_overrides (uuid, timezone) VALUES (?, ?)",
						(uuid, timezone),
					)
					.await?;
					inserts += 1;
				}
				Some(existing) if *existing != timezone => {
					conn.exec_drop(
						"UPDATE tz_overrides SET timezone = ? WHERE uuid = ?",
						(timezone, uuid),
					)
					.await?;
					updates += 1;
				}
				Some(_) => {}
			}
		}

		info!(target: "[SYNC]", "tz_overrides: inserted = {inserts}, updated = {updates}");
		Ok(())
	}
}
