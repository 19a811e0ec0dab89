// Copyright 2021 The Cirrus Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interfaces the sync task consumes from the rest of the node, and the
//! knobs controlling its behaviour. The task owns none of its
//! collaborators; the chain, the transport, the verifier and the chunk
//! processor are all injected at construction.

use std::net::SocketAddr;

use chrono::prelude::{DateTime, Utc};

use cirrus_core::hash::Hash;

use crate::error::{Error, ErrorKind};
use crate::msg::{ChunkData, ChunkHeader, ChunkHeaders, Type};

/// Number of blocks in a chunk, shared with the chain
pub const CHUNK_SIZE: u64 = 32;

/// How many chunk payloads to download in parallel when a fetch starts
pub const CONCURRENT_CHUNKS: usize = 10;

/// Seconds without data after which an in-flight chunk request is
/// re-issued to another random peer
pub const CHUNK_DATA_TIMEOUT: i64 = 10;

/// Seconds between checks that enough chunk header replies arrived
pub const HEADER_TICK_SECS: u64 = 30;

/// Seconds between sweeps for timed out chunk requests
pub const DATA_TICK_SECS: u64 = 10;

/// Sync task configuration, all fields tunable. Defaults mirror the
/// constants above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Number of blocks in a chunk
	pub chunk_size: u64,
	/// How many chunk payloads to download in parallel
	pub concurrent_chunks: usize,
	/// Seconds after which an in-flight chunk request is re-issued
	pub chunk_data_timeout_secs: i64,
	/// Seconds between header phase retries
	pub header_tick_secs: u64,
	/// Seconds between sweeps for timed out chunk requests
	pub data_tick_secs: u64,
}

impl Default for SyncConfig {
	fn default() -> SyncConfig {
		SyncConfig {
			chunk_size: CHUNK_SIZE,
			concurrent_chunks: CONCURRENT_CHUNKS,
			chunk_data_timeout_secs: CHUNK_DATA_TIMEOUT,
			header_tick_secs: HEADER_TICK_SECS,
			data_tick_secs: DATA_TICK_SECS,
		}
	}
}

/// Light handle on a canonical block, all the task needs to anchor
/// requests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tip {
	/// Height of the block, the genesis block is at height 1
	pub height: u64,
	/// Hash of the block
	pub hash: Hash,
}

impl Tip {
	/// Handle on the block with the given height and hash
	pub fn new(height: u64, hash: Hash) -> Tip {
		Tip { height, hash }
	}
}

/// Which peers an outbound message should go to. The transport owns the
/// actual peer book; the task only names a selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
	/// The curated subset of peers suitable for chain sync
	ChainSync,
	/// One randomly picked connected peer
	RandomPeer,
}

/// Delivery priority hint for the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
	/// Deliver ahead of normal traffic
	High,
	/// Deliver whenever convenient
	Low,
}

/// Download state of a single chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
	/// No request issued yet
	NotStarted,
	/// Requested at the given time, awaiting data
	InFlight(DateTime<Utc>),
	/// Payload applied to the chain
	Finished,
}

impl ChunkStatus {
	/// Whether a request is out for this chunk
	pub fn is_in_flight(&self) -> bool {
		match self {
			ChunkStatus::InFlight(_) => true,
			_ => false,
		}
	}

	/// Whether this chunk has been applied to the chain
	pub fn is_finished(&self) -> bool {
		*self == ChunkStatus::Finished
	}
}

/// Observable progress of the sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
	/// Not started yet
	Idle,
	/// Collecting chunk header votes from peers
	HeaderVoting {
		/// Header phase retries on the current sync point
		retries: u32,
	},
	/// Downloading and applying chunk payloads
	ChunkFetch {
		/// Chunks applied to the chain so far
		applied: usize,
		/// Chunks in the winning set
		total: usize,
	},
	/// Fully caught up with the peers' chain
	Done,
	/// Stopped before completion
	Stopped,
}

/// Facade of the canonical chain. Provides the blocks the task anchors
/// its requests on; appending downloaded blocks goes through the
/// [`ChunkProcessor`] instead.
pub trait ChainAdapter: Send + Sync {
	/// Tail block of the canonical chain
	fn tail(&self) -> Result<Tip, Error>;
	/// Block on the canonical chain at the given height
	fn block_by_height(&self, height: u64) -> Result<Tip, Error>;
}

/// Facade of the peer-to-peer transport.
pub trait NetAdapter: Send + Sync {
	/// Send a message to the peers selected by the filter. Returns the
	/// peers actually contacted.
	fn send_to_peers(
		&self,
		msg_type: Type,
		body: Vec<u8>,
		priority: MessagePriority,
		filter: PeerFilter,
	) -> Vec<SocketAddr>;

	/// Disconnect a misbehaving peer, stating why. Fire and forget.
	fn close_peer(&self, addr: SocketAddr, reason: &ErrorKind);
}

/// Cryptographic validation of chunk headers and chunk payloads. The task
/// treats both checks as opaque predicates.
pub trait ChunkVerifier: Send + Sync {
	/// Whether a set of chunk headers is internally consistent and its
	/// root commits to the sequence.
	fn verify_chunk_headers(&self, headers: &ChunkHeaders) -> Result<(), Error>;

	/// Whether a chunk payload reproduces the root its header committed
	/// to and its blocks pass the chain rules.
	fn verify_chunk_data(&self, header: &ChunkHeader, data: &ChunkData) -> Result<(), Error>;
}

/// Applies a validated chunk payload to the tip of the chain. On success
/// the chain tail has advanced by the chunk's block count.
pub trait ChunkProcessor: Send + Sync {
	/// Append the chunk's blocks to the chain
	fn process_chunk_data(&self, data: &ChunkData) -> Result<(), Error>;
}
