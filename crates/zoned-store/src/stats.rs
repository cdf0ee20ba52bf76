//! Hourly request statistics.
//!
//! One JSON file per wall-clock hour under
//! `stats/stats-YYYY-MM-DD/stats-HH:00.json`. Counter updates rewrite
//! the whole struct while holding the lock, which is coarse but fine
//! at the write rates a bucket sees. The rotation task sleeps until
//! ten seconds past the next hour boundary and reopens the bucket.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use eyre::WrapErr as _;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tokio::sync::Mutex;
use zoned_core::{AppContext, error, info, types::Protocol};

const DAY_FMT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const HOUR_FMT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:00");

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsData {
	pub successful_request_count: u64,
	pub failed_request_count: u64,
	pub request_countries: BTreeMap<String, u64>,
	pub established_known_request_types: BTreeMap<String, u64>,
	pub protocols: BTreeMap<String, u64>,
	pub received_data_bandwidth: u64,
	pub sent_data_bandwidth: u64,

	pub successful_command_execution_count: u64,
	pub failed_command_execution_count: u64,
	pub ran_command_names: BTreeMap<String, u64>,
}

struct Bucket {
	data: StatsData,
	file: PathBuf,
}

#[derive(Clone)]
pub struct StatsDb {
	root:  PathBuf,
	inner: Arc<Mutex<Bucket>>,
}

pub fn bucket_path(root: &Path, at: OffsetDateTime) -> PathBuf {
	// The format descriptions hold no invalid components, formatting
	// an OffsetDateTime with them cannot fail.
	let day = at.format(DAY_FMT).unwrap();
	let hour = at.format(HOUR_FMT).unwrap();
	root.join(format!("stats-{day}")).join(format!("stats-{hour}.json"))
}

fn local_now() -> OffsetDateTime {
	OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

async fn load_bucket(root: &Path, at: OffsetDateTime) -> eyre::Result<Bucket> {
	let file = bucket_path(root, at);
	if let Some(parent) = file.parent() {
		tokio::fs::create_dir_all(parent)
			.await
			.wrap_err_with(|| format!("failed to create stats directory {}", parent.display()))?;
	}

	if let Ok(content) = tokio::fs::read_to_string(&file).await
		&& let Ok(data) = serde_json::from_str::<StatsData>(&content)
	{
		return Ok(Bucket { data, file });
	}

	let bucket = Bucket { data: StatsData::default(), file };
	tokio::fs::write(&bucket.file, serde_json::to_vec(&bucket.data)?)
		.await
		.wrap_err_with(|| format!("failed to create stats bucket {}", bucket.file.display()))?;
	Ok(bucket)
}

impl StatsDb {
	pub async fn open(root: impl Into<PathBuf>) -> eyre::Result<Self> {
		let root = root.into();
		let bucket = load_bucket(&root, local_now()).await?;
		Ok(Self { root, inner: Arc::new(Mutex::new(bucket)) })
	}

	/// Hourly rotation; runs until cancellation.
	pub async fn rotate(self, ctx: Arc<AppContext>) {
		loop {
			let now = local_now();
			let pause = sleep_until_next_bucket(now);
			tokio::select! {
				_ = ctx.token.cancelled() => {
					info!(target: "[STATS]", "rotation task shutting down");
					break;
				}
				_ = tokio::time::sleep(pause) => {
					match load_bucket(&self.root, local_now()).await {
						Ok(bucket) => *self.inner.lock().await = bucket,
						Err(err) => error!(target: "[STATS]", "failed to rotate stats bucket: {err:?}"),
					}
				}
			}
		}
	}

	pub async fn add_successful_request(&self) {
		self.update(|data| data.successful_request_count += 1).await;
	}

	pub async fn add_failed_request(&self) {
		self.update(|data| data.failed_request_count += 1).await;
	}

	pub async fn add_request_country(&self, country: &str) {
		let country = country.to_owned();
		self.update(move |data| *data.request_countries.entry(country).or_default() += 1)
			.await;
	}

	pub async fn add_known_request_type(&self, name: &str) {
		let name = name.to_owned();
		self.update(move |data| {
			*data.established_known_request_types.entry(name).or_default() += 1;
		})
		.await;
	}

	pub async fn add_protocol(&self, protocol: Protocol) {
		self.update(move |data| *data.protocols.entry(protocol.to_string()).or_default() += 1)
			.await;
	}

	pub async fn add_received_bandwidth(&self, bytes: usize) {
		self.update(move |data| data.received_data_bandwidth += bytes as u64).await;
	}

	pub async fn add_sent_bandwidth(&self, bytes: usize) {
		self.update(move |data| data.sent_data_bandwidth += bytes as u64).await;
	}

	pub async fn add_successful_command(&self) {
		self.update(|data| data.successful_command_execution_count += 1).await;
	}

	pub async fn add_failed_command(&self) {
		self.update(|data| data.failed_command_execution_count += 1).await;
	}

	pub async fn add_ran_command(&self, name: &str) {
		let name = name.to_owned();
		self.update(move |data| *data.ran_command_names.entry(name).or_default() += 1)
			.await;
	}

	pub async fn snapshot(&self) -> StatsData {
		self.inner.lock().await.data.clone()
	}

	async fn update(&self, mutate: impl FnOnce(&mut StatsData)) {
		let mut bucket = self.inner.lock().await;
		mutate(&mut bucket.data);
		match serde_json::to_vec(&bucket.data) {
			Ok(json) => {
				if let Err(err) = tokio::fs::write(&bucket.file, json).await {
					error!(target: "[STATS]", "failed to dump stats bucket: {err}");
				}
			}
			Err(err) => error!(target: "[STATS]", "stats bucket did not serialize: {err}"),
		}
	}
}

fn sleep_until_next_bucket(now: OffsetDateTime) -> Duration {
	// Top of the current hour; the replaced components are in range.
	let top = now
		.replace_minute(0)
		.unwrap()
		.replace_second(0)
		.unwrap()
		.replace_nanosecond(0)
		.unwrap();
	let until_boundary: Duration = (top + time::Duration::HOUR - now)
		.try_into()
		.unwrap_or(Duration::from_secs(3600));
	until_boundary + Duration::from_secs(10)
}

#[cfg(test)]
mod test {
	use time::macros::datetime;

	use super::*;

	#[test]
	fn bucket_paths_follow_the_layout() {
		let path = bucket_path(Path::new("stats"), datetime!(2024-03-05 07:12:44 UTC));
		assert_eq!(path, Path::new("stats/stats-2024-03-05/stats-07:00.json"));
	}

	#[test]
	fn rotation_sleeps_past_the_boundary() {
		let pause = sleep_until_next_bucket(datetime!(2024-03-05 07:59:00 UTC));
		assert_eq!(pause, Duration::from_secs(70));
	}

	#[tokio::test]
	async fn counters_persist_as_schema_json() -> eyre::Result<()> {
		let dir = tempfile::tempdir()?;
		let stats = StatsDb::open(dir.path()).await?;

		stats.add_successful_request().await;
		stats.add_protocol(Protocol::Udp).await;
		stats.add_protocol(Protocol::Udp).await;
		stats.add_request_country("CZ").await;
		stats.add_known_request_type("Ping").await;
		stats.add_received_bandwidth(9).await;
		stats.add_sent_bandwidth(30).await;

		let file = bucket_path(dir.path(), local_now());
		let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(file)?)?;
		assert_eq!(written["successfulRequestCount"], 1);
		assert_eq!(written["failedRequestCount"], 0);
		assert_eq!(written["protocols"]["UDP"], 2);
		assert_eq!(written["requestCountries"]["CZ"], 1);
		assert_eq!(written["establishedKnownRequestTypes"]["Ping"], 1);
		assert_eq!(written["receivedDataBandwidth"], 9);
		assert_eq!(written["sentDataBandwidth"], 30);
		assert_eq!(written["ranCommandNames"], serde_json::json!({}));
		Ok(())
	}

	#[tokio::test]
	async fn reopening_a_bucket_keeps_existing_counters() -> eyre::Result<()> {
		let dir = tempfile::tempdir()?;
		{
			let stats = StatsDb::open(dir.path()).await?;
			stats.add_failed_request().await;
		}
		let stats = StatsDb::open(dir.path()).await?;
		assert_eq!(stats.snapshot().await.failed_request_count, 1);
		Ok(())
	}
}
