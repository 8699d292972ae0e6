//! Wire schema of all transport payloads.
//!
//! Every payload is a self-describing JSON record tagged by
//! `message_type`, carrying a timestamp and the type-specific fields.
//! Unknown or malformed records must be logged and discarded by
//! consumers, never coerced.

use serde::{Deserialize, Serialize};

use griddfs_util::error::Error;
use griddfs_util::time::now_msec;

/// Outcome reported by a storage node for one fanned-out block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStatus {
	/// Block admitted and persisted
	Success,
	/// Admission refused: free-space floor would be crossed
	InsufficientSpace,
	/// Hash mismatch or local write failure
	Error,
	/// Admission policy drew against keeping the block
	Declined,
}

/// Outcome of a direct block request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
	Success,
	NotFound,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
	/// Fanned out by the coordinator to distribute a freshly planned
	/// block to all storage nodes
	StoreBlock {
		block_id: String,
		block_index: u32,
		block_size: u64,
		block_hash: String,
		upload_id: String,
		/// Raw block bytes, base64 encoded
		block_data: String,
	},
	/// Sent by a storage node to the coordinator after it has decided
	/// on a fanned-out block
	StorageConfirmed {
		block_id: String,
		node_id: String,
		storage_path: String,
		status: ConfirmStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error_message: Option<String>,
	},
	/// Sent by a client to one storage node holding the block
	RequestBlock {
		block_id: String,
		client_id: String,
		reply_address: String,
	},
	/// Sent by a storage node to the reply address of a block request
	BlockResponse {
		block_id: String,
		status: ResponseStatus,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		block_data: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error_message: Option<String>,
	},
	/// Periodic self-report of a storage node
	Heartbeat {
		node_id: String,
		status: String,
		storage_used: u64,
		storage_capacity: u64,
		storage_available: u64,
	},
}

impl Message {
	/// The `message_type` tag of this message, without its payload;
	/// suitable for logging
	pub fn kind(&self) -> &'static str {
		match self {
			Message::StoreBlock { .. } => "store_block",
			Message::StorageConfirmed { .. } => "storage_confirmed",
			Message::RequestBlock { .. } => "request_block",
			Message::BlockResponse { .. } => "block_response",
			Message::Heartbeat { .. } => "heartbeat",
		}
	}
}

/// A message together with its sender-side timestamp.
///
/// The timestamp is informational: the coordinator always stamps
/// heartbeats with its own clock to keep liveness immune to clock skew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub timestamp: u64,
	#[serde(flatten)]
	pub msg: Message,
}

impl Envelope {
	pub fn new(msg: Message) -> Self {
		Self {
			timestamp: now_msec(),
			msg,
		}
	}

	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		Ok(serde_json::to_vec(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

/// Encode a block payload for the wire
pub fn encode_block_data(data: &[u8]) -> String {
	base64::encode(data)
}

/// Decode a block payload from the wire
pub fn decode_block_data(data: &str) -> Result<Vec<u8>, Error> {
	base64::decode(data).map_err(|e| Error::Message(format!("Invalid base64 block data: {}", e)))
}
