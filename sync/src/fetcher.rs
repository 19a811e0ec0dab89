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

//! Second phase of a sync round: download the payloads of the elected
//! chunk headers with a bounded number of requests in flight and apply
//! them to the chain in strict index order. Payloads may arrive in any
//! order; a buffer and a process cursor restore the chain order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::prelude::{DateTime, Utc};
use chrono::Duration;

use cirrus_core::ser;

use crate::error::ErrorKind;
use crate::msg::{ChunkData, ChunkHeaders, Type};
use crate::types::{
	ChunkProcessor, ChunkStatus, ChunkVerifier, MessagePriority, NetAdapter, PeerFilter,
	SyncConfig,
};

/// What a chunk data message did to the download pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProgress {
	/// Dropped, or recovered from without durable progress
	Ignored,
	/// Buffered or applied, more chunks outstanding
	Advanced,
	/// Every chunk of the winning set has been applied
	Done,
}

/// Downloads the payloads of an elected chunk header set.
pub struct ChunkFetcher {
	config: SyncConfig,
	net: Arc<dyn NetAdapter>,
	verifier: Arc<dyn ChunkVerifier>,
	processor: Arc<dyn ChunkProcessor>,

	/// The elected chunk headers this round fetches, if any
	winning: Option<ChunkHeaders>,
	/// Download state per chunk index
	status: Vec<ChunkStatus>,
	/// Validated payloads awaiting in-order application
	buffer: HashMap<usize, ChunkData>,
	/// Highest index a request has been issued for
	sync_pos: usize,
	/// Next index to apply
	process_pos: usize,
}

impl ChunkFetcher {
	/// Fetcher over the given collaborators, idle until `begin` installs a
	/// winning set.
	pub fn new(
		config: SyncConfig,
		net: Arc<dyn NetAdapter>,
		verifier: Arc<dyn ChunkVerifier>,
		processor: Arc<dyn ChunkProcessor>,
	) -> ChunkFetcher {
		ChunkFetcher {
			config,
			net,
			verifier,
			processor,
			winning: None,
			status: vec![],
			buffer: HashMap::new(),
			sync_pos: 0,
			process_pos: 0,
		}
	}

	/// Install the elected chunk headers and seed the initial request
	/// window. Returns true when the set is empty and there is nothing to
	/// fetch.
	pub fn begin(&mut self, winning: ChunkHeaders) -> bool {
		let total = winning.len();
		self.winning = Some(winning);
		self.status = vec![ChunkStatus::NotStarted; total];
		self.buffer.clear();
		self.sync_pos = 0;
		self.process_pos = 0;

		if total == 0 {
			return true;
		}

		let mut sent = 0;
		for i in 0..total {
			if sent >= self.config.concurrent_chunks {
				break;
			}
			if self.status[i] == ChunkStatus::NotStarted && self.send_chunk_get(i) {
				self.sync_pos = i;
				sent += 1;
			}
		}
		debug!(
			"sync: fetching {} chunks, {} requested up front",
			total, sent
		);
		false
	}

	/// Handle a chunk payload from a peer.
	pub fn on_chunk_data(&mut self, peer: SocketAddr, data: ChunkData) -> FetchProgress {
		let located = self.winning.as_ref().and_then(|w| {
			w.chunk_headers
				.iter()
				.position(|h| h.root == data.root)
				.map(|i| (i, w.chunk_headers[i].clone()))
		});
		let (index, header) = match located {
			Some(found) => found,
			None => {
				// data we never asked for
				warn!(
					"sync: chunk data for unknown root {} from {}",
					data.root, peer
				);
				self.net.close_peer(peer, &ErrorKind::WrongChunkDataMessage);
				return FetchProgress::Ignored;
			}
		};

		if self.status[index].is_finished() {
			debug!(
				"sync: duplicate data for finished chunk {} from {}",
				index, peer
			);
			return FetchProgress::Ignored;
		}

		if let Err(e) = self.verifier.verify_chunk_data(&header, &data) {
			warn!(
				"sync: chunk {} from {} failed verification: {}",
				index, peer, e
			);
			self.net.close_peer(peer, &ErrorKind::WrongChunkDataMessage);
			self.send_chunk_get(index);
			return FetchProgress::Ignored;
		}

		self.buffer.insert(index, data);

		// payloads arrive in any order but blocks form a chain, so apply
		// the longest contiguous run starting at the process cursor
		while let Some(chunk) = self.buffer.remove(&self.process_pos) {
			if let Err(e) = self.processor.process_chunk_data(&chunk) {
				let failed = self.process_pos;
				warn!("sync: chunk {} rejected by chain: {}", failed, e);
				self.net
					.close_peer(peer, &ErrorKind::ChunkProcess(format!("{}", e)));
				// the rejected payload is already evicted, ask another
				// random peer for a fresh copy of that chunk
				self.send_chunk_get(failed);
				return FetchProgress::Ignored;
			}
			self.status[self.process_pos] = ChunkStatus::Finished;
			self.process_pos += 1;
		}

		if self.request_next() {
			FetchProgress::Done
		} else {
			FetchProgress::Advanced
		}
	}

	/// Re-issue requests for in-flight chunks that produced no data within
	/// the configured timeout. Chunks already buffered are only waiting
	/// for in-order application and are left alone.
	pub fn resend_expired(&mut self, now: DateTime<Utc>) {
		let cutoff = now - Duration::seconds(self.config.chunk_data_timeout_secs);
		for i in 0..self.status.len().min(self.sync_pos + 1) {
			if self.buffer.contains_key(&i) {
				continue;
			}
			if let ChunkStatus::InFlight(sent) = self.status[i] {
				if sent <= cutoff {
					debug!("sync: chunk {} timed out, asking another peer", i);
					self.send_chunk_get(i);
				}
			}
		}
	}

	/// Whether every chunk of the winning set has been applied.
	pub fn all_finished(&self) -> bool {
		self.status.iter().all(|s| s.is_finished())
	}

	/// Whether the installed winning set has no chunks to fetch.
	pub fn is_empty(&self) -> bool {
		match &self.winning {
			Some(w) => w.is_empty(),
			None => true,
		}
	}

	/// Chunks applied to the chain so far.
	pub fn applied(&self) -> usize {
		self.process_pos
	}

	/// Chunks in the winning set.
	pub fn total(&self) -> usize {
		self.status.len()
	}

	/// Drop the winning set and all download state.
	pub fn reset(&mut self) {
		self.winning = None;
		self.status.clear();
		self.buffer.clear();
		self.sync_pos = 0;
		self.process_pos = 0;
	}

	/// Slide the request window one chunk past the highest index asked
	/// for. Past the end of the set, reports whether the whole set has
	/// been applied instead.
	fn request_next(&mut self) -> bool {
		let next = self.sync_pos + 1;
		if next >= self.status.len() {
			return self.all_finished();
		}
		if self.send_chunk_get(next) {
			self.sync_pos = next;
		}
		false
	}

	/// Ask one random peer for the payload of the chunk at `index` and
	/// stamp it in flight. A failed send leaves the status untouched so
	/// the timeout sweep retries it.
	fn send_chunk_get(&mut self, index: usize) -> bool {
		let header = match self
			.winning
			.as_ref()
			.and_then(|w| w.chunk_headers.get(index))
		{
			Some(header) => header.clone(),
			None => return false,
		};
		let body = match ser::ser_vec(&header) {
			Ok(body) => body,
			Err(e) => {
				error!("sync: could not serialize get for chunk {}: {}", index, e);
				return false;
			}
		};
		self.net.send_to_peers(
			Type::ChainGetChunk,
			body,
			MessagePriority::Low,
			PeerFilter::RandomPeer,
		);
		self.status[index] = ChunkStatus::InFlight(Utc::now());
		true
	}
}
