//! Metadata entries persisted by the coordinator, and the shapes of the
//! plans it hands out

use std::time::Duration;

use serde::{Deserialize, Serialize};

use griddfs_util::data::Hash;

/// A logical file in the namespace, immutable once its upload session
/// completed. Its key is `(principal, path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
	pub principal: String,
	pub path: String,
	pub size: u64,
	pub hash: Hash,
	pub created: u64,
	/// Upload session that inserted this entry
	pub upload_id: String,
	/// Block ids in dense index order; doubles as the cascade list
	pub blocks: Vec<String>,
}

/// One fixed-size slice of a file. The `nodes` vector lists every node
/// for which a location row exists (whatever its status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
	pub id: String,
	pub principal: String,
	pub path: String,
	pub upload_id: String,
	pub index: u32,
	pub size: u64,
	pub hash: Hash,
	pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationStatus {
	Active,
	Tombstoned,
}

/// A claim that one storage node holds one block on local disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
	pub block_id: String,
	pub node_id: String,
	pub status: LocationStatus,
	pub storage_path: String,
	pub confirmed: u64,
}

/// A known storage node, registered by its first heartbeat.
/// `last_heartbeat` is stamped with the coordinator's clock to keep
/// liveness immune to clock skew between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
	pub id: String,
	/// Queue on which the node answers direct block requests; derived
	/// from the node id, so registration needs no address exchange
	pub request_queue: String,
	pub last_heartbeat: u64,
	pub capacity: u64,
	pub used: u64,
	pub available: u64,
	pub first_seen: u64,
}

/// Liveness of a node, derived from the age of its last heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLiveness {
	Active,
	Stale,
	Dead,
}

impl NodeEntry {
	pub fn liveness(&self, now: u64, heartbeat_interval: Duration) -> NodeLiveness {
		let interval = heartbeat_interval.as_millis() as u64;
		let age = now.saturating_sub(self.last_heartbeat);
		if age < 3 * interval {
			NodeLiveness::Active
		} else if age < 10 * interval {
			NodeLiveness::Stale
		} else {
			NodeLiveness::Dead
		}
	}

	pub fn is_active(&self, now: u64, heartbeat_interval: Duration) -> bool {
		self.liveness(now, heartbeat_interval) == NodeLiveness::Active
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
	Pending,
	Completed,
	Failed,
}

impl SessionStatus {
	pub fn is_terminal(self) -> bool {
		self != SessionStatus::Pending
	}
}

/// Tracks storage confirmations for one client upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
	pub id: String,
	pub principal: String,
	pub path: String,
	pub total_blocks: u32,
	/// Number of distinct blocks with at least one active location;
	/// never decreases
	pub completed_blocks: u32,
	pub status: SessionStatus,
	pub created: u64,
}

// ---- Plans handed out by the coordinator ----

/// Descriptor of one block of an upload plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDescriptor {
	pub block_id: String,
	pub index: u32,
	pub size: u64,
	pub hash: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPlan {
	pub upload_id: String,
	pub total_blocks: u32,
	pub blocks: Vec<BlockDescriptor>,
}

/// Where one block of a download plan can currently be fetched from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocation {
	pub node_id: String,
	pub request_queue: String,
	pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDownload {
	pub block_id: String,
	pub index: u32,
	pub size: u64,
	pub hash: Hash,
	/// Live locations only: active location rows on nodes whose derived
	/// liveness is active. Empty when the block is currently not
	/// retrievable.
	pub locations: Vec<BlockLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPlan {
	pub path: String,
	pub size: u64,
	pub hash: Hash,
	pub blocks: Vec<BlockDownload>,
}

impl DownloadPlan {
	/// Id of the first block with no live location, if any
	pub fn first_unavailable(&self) -> Option<&BlockDownload> {
		self.blocks.iter().find(|b| b.locations.is_empty())
	}
}

// ---- System status report ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
	pub id: String,
	pub liveness: NodeLiveness,
	pub capacity: u64,
	pub used: u64,
	pub available: u64,
	pub last_heartbeat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
	pub nodes: Vec<NodeStatus>,
	pub total_capacity: u64,
	pub total_used: u64,
	pub total_available: u64,
	pub active_nodes: usize,
}
