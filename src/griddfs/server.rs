use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;

use griddfs_db::sled_adapter::{sled, SledDb};

use griddfs_util::background::BackgroundRunner;
use griddfs_util::config::read_config;
use griddfs_util::error::{Error, OkOrMessage};

use griddfs_coordinator::Coordinator;
use griddfs_node::StorageNode;
use griddfs_transport::memory::MemoryBroker;

async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}

pub async fn run_server(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Opening metadata store...");
	std::fs::create_dir_all(&config.metadata_dir)?;
	let db = SledDb::init(
		sled::open(config.metadata_dir.join("db")).map_err(griddfs_db::Error::from)?,
	);

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Initializing in-process message broker...");
	let broker = MemoryBroker::new();

	info!("Initializing coordinator...");
	let coordinator = Coordinator::new(&config, &db, broker.clone())
		.ok_or_message("Could not initialize coordinator")?;
	coordinator
		.spawn_workers(&background)
		.await
		.ok_or_message("Could not spawn coordinator workers")?;

	if config.storage_nodes.is_empty() {
		warn!("No storage node configured on this process; uploads will find no capacity");
	}
	let heartbeat_interval = Duration::from_secs(config.heartbeat_interval);
	let mut nodes = vec![];
	for node_config in config.storage_nodes.iter() {
		info!("Launching storage node at {}...", node_config.data_dir.display());
		let node = StorageNode::new(node_config, heartbeat_interval, broker.clone()).await?;
		node.spawn_workers(&background).await?;
		nodes.push(node);
	}

	// Stuff runs. When a cancel signal is sent, stuff stops.
	wait_from(watch_cancel).await;

	info!("Shutting down...");

	// Drop all references so that background workers can terminate
	// properly
	drop(coordinator);
	drop(nodes);

	// Await for all background tasks to end
	await_background_done.await?;

	info!("Cleaning up...");

	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(windows)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::windows::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = ctrl_c().expect("Failed to install Ctrl-C handler");
		let mut sigclose = ctrl_close().expect("Failed to install Ctrl-Close handler");
		let mut siglogoff = ctrl_logoff().expect("Failed to install Ctrl-Logoff handler");
		let mut sigsdown = ctrl_shutdown().expect("Failed to install Ctrl-Shutdown handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received Ctrl-C, shutting down."),
			_ = sigclose.recv() => info!("Received Ctrl-Close, shutting down."),
			_ = siglogoff.recv() => info!("Received Ctrl-Logoff, shutting down."),
			_ = sigsdown.recv() => info!("Received Ctrl-Shutdown, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
