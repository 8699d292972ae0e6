//! Contains type and functions related to GridDFS configuration file
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where the coordinator stores its metadata. Should be fast,
	/// but low volume
	pub metadata_dir: PathBuf,

	/// Size of data blocks files are split into
	#[serde(default = "default_block_size")]
	pub block_size: usize,

	/// Maximum size of a single uploaded file
	#[serde(default = "default_max_upload_size")]
	pub max_upload_size: u64,

	/// Interval, in seconds, between two heartbeats of a storage node.
	/// Node liveness windows are the 3x and 10x multiples of this.
	#[serde(default = "default_heartbeat_interval")]
	pub heartbeat_interval: u64,

	/// Timeout, in seconds, for a block request issued by a client
	#[serde(default = "default_request_timeout")]
	pub request_timeout: u64,

	/// Delay, in seconds, after which a pending upload session with
	/// unconfirmed blocks is marked failed
	#[serde(default = "default_upload_deadline")]
	pub upload_deadline: u64,

	/// Storage nodes hosted by this process
	#[serde(default, rename = "storage_node")]
	pub storage_nodes: Vec<StorageNodeConfig>,
}

/// Configuration for one hosted storage node
#[derive(Deserialize, Debug, Clone)]
pub struct StorageNodeConfig {
	/// Stable identifier of the node; generated and persisted in
	/// `data_dir` on first start if absent
	pub node_id: Option<String>,

	/// Directory in which the node keeps its block files
	pub data_dir: PathBuf,

	/// Advertised storage capacity of the node, in bytes
	#[serde(default = "default_storage_capacity")]
	pub capacity: u64,

	/// Fraction of the capacity the node refuses to fill
	#[serde(default = "default_min_free_ratio")]
	pub min_free_ratio: f64,

	/// Base probability of admitting a fanned-out block
	#[serde(default = "default_accept_probability")]
	pub accept_probability: f64,
}

fn default_block_size() -> usize {
	64 * 1024 * 1024
}
fn default_max_upload_size() -> u64 {
	10 * 1024 * 1024 * 1024
}
fn default_heartbeat_interval() -> u64 {
	30
}
fn default_request_timeout() -> u64 {
	30
}
fn default_upload_deadline() -> u64 {
	300
}
fn default_storage_capacity() -> u64 {
	10 * 1024 * 1024 * 1024
}
fn default_min_free_ratio() -> f64 {
	0.10
}
fn default_accept_probability() -> f64 {
	0.8
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}
