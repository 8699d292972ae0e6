//! Test harness: a whole GridDFS deployment (coordinator plus a pool
//! of storage nodes) in one process, over the in-memory broker

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use griddfs_db::sled_adapter::{sled, SledDb};

use griddfs_util::background::BackgroundRunner;
use griddfs_util::config::{Config, StorageNodeConfig};

use griddfs_client::Client;
use griddfs_coordinator::schema::SessionStatus;
use griddfs_coordinator::Coordinator;
use griddfs_node::StorageNode;
use griddfs_transport::memory::MemoryBroker;
use griddfs_transport::Transport;

pub const POLL_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity and acceptance probability of one test node
#[derive(Clone, Copy)]
pub struct NodeSpec {
	pub capacity: u64,
	pub accept_probability: f64,
}

impl NodeSpec {
	pub fn greedy() -> Self {
		Self {
			capacity: 1024 * 1024,
			accept_probability: 1.0,
		}
	}
}

struct Runner {
	stop: watch::Sender<bool>,
	done: JoinHandle<()>,
	_background: Arc<BackgroundRunner>,
}

pub struct TestCluster {
	pub tmp: mktemp::Temp,
	pub config: Config,
	pub broker: Arc<MemoryBroker>,
	pub coordinator: Arc<Coordinator>,
	pub nodes: Vec<Arc<StorageNode>>,
	node_runners: Vec<Runner>,
	_coordinator_runner: Runner,
}

impl TestCluster {
	pub async fn new(block_size: usize, specs: &[NodeSpec]) -> Self {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let config = Config {
			metadata_dir: tmp.to_path_buf().join("meta"),
			block_size,
			max_upload_size: 1024 * 1024,
			heartbeat_interval: 1,
			request_timeout: 2,
			upload_deadline: 300,
			storage_nodes: vec![],
		};
		std::fs::create_dir_all(&config.metadata_dir).unwrap();

		let broker = MemoryBroker::new();
		let db = SledDb::init(sled::open(config.metadata_dir.join("db")).unwrap());
		let coordinator =
			Coordinator::new(&config, &db, broker.clone() as Arc<dyn Transport>).unwrap();

		let (stop, stop_recv) = watch::channel(false);
		let (background, done) = BackgroundRunner::new(stop_recv);
		coordinator.spawn_workers(&background).await.unwrap();
		let coordinator_runner = Runner {
			stop,
			done,
			_background: background,
		};

		let mut cluster = Self {
			tmp,
			config,
			broker,
			coordinator,
			nodes: vec![],
			node_runners: vec![],
			_coordinator_runner: coordinator_runner,
		};
		for spec in specs {
			cluster.add_node(*spec).await;
		}
		cluster
	}

	pub async fn add_node(&mut self, spec: NodeSpec) {
		let index = self.nodes.len();
		let node_config = StorageNodeConfig {
			node_id: Some(format!("dn{}", index)),
			data_dir: self.node_data_dir(index),
			capacity: spec.capacity,
			min_free_ratio: 0.10,
			accept_probability: spec.accept_probability,
		};
		let node = StorageNode::new(
			&node_config,
			Duration::from_secs(self.config.heartbeat_interval),
			self.broker.clone() as Arc<dyn Transport>,
		)
		.await
		.unwrap();

		let (stop, stop_recv) = watch::channel(false);
		let (background, done) = BackgroundRunner::new(stop_recv);
		node.spawn_workers(&background).await.unwrap();

		self.nodes.push(node);
		self.node_runners.push(Runner {
			stop,
			done,
			_background: background,
		});
	}

	pub fn node_data_dir(&self, index: usize) -> PathBuf {
		self.tmp.to_path_buf().join(format!("dn{}", index))
	}

	/// Path of a block file on one node's disk
	pub fn block_path_on(&self, index: usize, block_id: &str) -> PathBuf {
		self.node_data_dir(index).join("blocks").join(block_id)
	}

	pub fn scratch_path(&self, name: &str) -> PathBuf {
		self.tmp.to_path_buf().join(name)
	}

	pub fn client(&self, principal: &str) -> Client {
		Client::new(
			&self.config,
			principal,
			self.coordinator.clone(),
			self.broker.clone() as Arc<dyn Transport>,
		)
	}

	/// Stop one node's workers; its heartbeats cease and its queues are
	/// no longer consumed
	pub async fn stop_node(&mut self, index: usize) {
		let runner = &mut self.node_runners[index];
		runner.stop.send(true).unwrap();
		(&mut runner.done).await.unwrap();
	}

	pub async fn wait_active_nodes(&self, expected: usize) {
		poll_until(POLL_TIMEOUT, || {
			self.coordinator.store.active_node_count().unwrap() == expected
		})
		.await
		.unwrap_or_else(|| {
			panic!(
				"Timed out waiting for {} active nodes (currently {})",
				expected,
				self.coordinator.store.active_node_count().unwrap()
			)
		});
	}

	pub async fn wait_upload_completed(&self, upload_id: &str) {
		poll_until(POLL_TIMEOUT, || {
			self.coordinator.upload_session(upload_id).unwrap().status
				== SessionStatus::Completed
		})
		.await
		.unwrap_or_else(|| {
			panic!(
				"Timed out waiting for upload {} to complete: {:?}",
				upload_id,
				self.coordinator.upload_session(upload_id).unwrap()
			)
		});
	}
}

pub async fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> Option<()> {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if cond() {
			return Some(());
		}
		if tokio::time::Instant::now() > deadline {
			return None;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
}
