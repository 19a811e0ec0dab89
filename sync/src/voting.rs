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

//! First phase of a sync round: tally the chunk header replies of the
//! solicited peers and elect the set with the most votes. Replies are keyed
//! by the hex form of their root, so peers that agree on the chain past our
//! tail vote for the same key.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::msg::ChunkHeaders;

/// What a chunk headers reply did to the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
	/// Same peer already voted for this root
	Duplicate,
	/// Vote counted, no quorum yet
	Counted,
	/// Vote counted and the leading root now has enough agreement
	Quorum,
}

/// Running tally of chunk header replies.
pub struct HeaderVoting {
	/// Representative reply for each root seen
	all_chunk_headers: HashMap<String, ChunkHeaders>,
	/// Number of distinct peers that voted for each root
	root_counter: HashMap<String, usize>,
	/// (root, peer) pairs already credited
	voted: HashSet<(String, SocketAddr)>,
	/// Root with the most votes so far
	max_root: String,
	/// Vote count of max_root
	max_count: usize,
}

impl HeaderVoting {
	/// An empty tally.
	pub fn new() -> HeaderVoting {
		HeaderVoting {
			all_chunk_headers: HashMap::new(),
			root_counter: HashMap::new(),
			voted: HashSet::new(),
			max_root: String::new(),
			max_count: 0,
		}
	}

	/// Count a verified reply from a solicited peer. At most one vote per
	/// peer per root; the first reply for a root is kept as its
	/// representative.
	pub fn observe(
		&mut self,
		peer: SocketAddr,
		headers: ChunkHeaders,
		peer_count: usize,
	) -> VoteOutcome {
		let root_hex = headers.root.to_hex();
		if !self.voted.insert((root_hex.clone(), peer)) {
			return VoteOutcome::Duplicate;
		}

		let count = {
			let count = self.root_counter.entry(root_hex.clone()).or_insert(0);
			*count += 1;
			*count
		};
		self.all_chunk_headers
			.entry(root_hex.clone())
			.or_insert(headers);

		if count > self.max_count {
			self.max_count = count;
			self.max_root = root_hex;
		}

		if self.has_quorum(peer_count) {
			VoteOutcome::Quorum
		} else {
			VoteOutcome::Counted
		}
	}

	/// Whether the leading root has enough agreement: at least the
	/// truncated square root of the number of solicited peers, with at
	/// least one peer solicited. Sub-linear in the peer count, so a
	/// constant number of silent or lying peers cannot stall us.
	pub fn has_quorum(&self, peer_count: usize) -> bool {
		peer_count > 0 && self.max_count >= (peer_count as f64).sqrt() as usize
	}

	/// The elected reply, once any vote was counted.
	pub fn winning(&self) -> Option<&ChunkHeaders> {
		self.all_chunk_headers.get(&self.max_root)
	}

	/// Number of votes on the leading root.
	pub fn max_count(&self) -> usize {
		self.max_count
	}

	/// Drop every collected vote.
	pub fn reset(&mut self) {
		self.all_chunk_headers.clear();
		self.root_counter.clear();
		self.voted.clear();
		self.max_root.clear();
		self.max_count = 0;
	}
}
