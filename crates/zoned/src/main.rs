use std::{sync::Arc, time::Duration};

use clap::Parser as _;
use tokio::task::JoinSet;
use tracing::Level;
use zoned_core::{AppContext, info, warn};
use zoned_server::{
	events::EventSink,
	geo::Geolocator,
	inbound::{Inbound, InboundOpts},
	linkcode::LinkCodes,
	services::Services,
};
use zoned_store::{DataStore, KeyVault, StatsDb};

use crate::{
	cli::{Cli, Commands},
	conf::{persistent::PersistentConfig, runtime::Config},
};

mod cli;
mod conf;
mod log;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::INFO)?;
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("ZONED_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("zoned {VER}");
		return Ok(());
	}

	if let Some(Commands::Init { path }) = cli.command {
		PersistentConfig::generate().export_to_file(&path)?;
		info!(target: "[MAIN]", "wrote default configuration to {}", path.display());
		return Ok(());
	}

	info!(target: "[MAIN]", "zoned starting");
	let config = Config::from_persist(PersistentConfig::load(cli.config, cli.config_dir)?)?;

	let ctx = Arc::new(AppContext::new());

	// A missing geolocation database is fatal; everything downstream
	// depends on it.
	let geo = Geolocator::open(&config.geoip_path)?;
	let store = DataStore::open(&config.sqlite_path, config.mariadb.clone()).await?;
	let vault = KeyVault::open(&config.vault_path, config.vault_key).await?;
	let stats = StatsDb::open(config.stats_dir.clone()).await?;
	let events = EventSink::start(&ctx);

	let services = Services {
		ctx: ctx.clone(),
		store: store.clone(),
		vault,
		codes: LinkCodes::new(),
		geo,
		events,
		stats: stats.clone(),
		aead_key: config.aead_key,
	};

	let inbound = Inbound::new(
		ctx.clone(),
		InboundOpts {
			listen_addr:  config.listen_addr,
			read_timeout: config.read_timeout,
		},
		services,
	);

	let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();
	set.spawn(async move { inbound.listen().await });

	if let Some(reconciler) = store.reconciler(config.sync_interval) {
		let ctx = ctx.clone();
		set.spawn(async move {
			reconciler.run(ctx).await;
			Ok(())
		});
	} else {
		info!(target: "[MAIN]", "no secondary database, reconciler disabled");
	}

	{
		let ctx = ctx.clone();
		set.spawn(async move {
			stats.rotate(ctx).await;
			Ok(())
		});
	}

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!(target: "[MAIN]", "interrupt received, shutting down");
		}
		Some(finished) = set.join_next() => {
			if let Ok(Err(err)) = finished {
				ctx.shutdown(SHUTDOWN_GRACE).await;
				return Err(err);
			}
		}
	}

	if !ctx.shutdown(SHUTDOWN_GRACE).await {
		warn!(target: "[MAIN]", "tasks did not drain within the grace window, abandoning them");
	}
	Ok(())
}
