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

//! Test collaborators for driving a sync task without a network: an
//! in-memory chain, a recording transport, scriptable verifiers and a
//! chunk processor that appends to the chain.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::thread_rng;

use cirrus_core::hash::{Hash, Hashed};
use cirrus_core::ser::{self, Writeable};

use cirrus_sync::error::{Error, ErrorKind};
use cirrus_sync::msg::{ChunkData, ChunkHeader, ChunkHeaders, Type};
use cirrus_sync::{
	ChainAdapter, ChunkProcessor, ChunkVerifier, MessagePriority, NetAdapter, PeerFilter, Tip,
};

pub fn init_test_logger() {
	let _ = env_logger::try_init();
}

/// Poll for a condition, panicking when it does not hold within 5s.
pub fn wait_until<F>(what: &str, mut cond: F)
where
	F: FnMut() -> bool,
{
	let deadline = Instant::now() + Duration::from_secs(5);
	while !cond() {
		if Instant::now() > deadline {
			panic!("timed out waiting for {}", what);
		}
		sleep(Duration::from_millis(10));
	}
}

pub fn encode<W: Writeable>(thing: &W) -> Vec<u8> {
	ser::ser_vec(thing).unwrap()
}

pub fn peer(n: u8) -> SocketAddr {
	format!("10.0.0.{}:13414", n).parse().unwrap()
}

/// In-memory canonical chain, a plain list of tips with the genesis block
/// at height 1.
pub struct TestChain {
	tips: Mutex<Vec<Tip>>,
}

impl TestChain {
	/// Chain of `height` deterministic blocks.
	pub fn with_height(height: u64) -> TestChain {
		let tips = (1..=height)
			.map(|h| Tip::new(h, vec![h as u8, 0x33].hash()))
			.collect();
		TestChain {
			tips: Mutex::new(tips),
		}
	}

	/// Append blocks by hash, advancing the tail.
	pub fn push_blocks(&self, hashes: &[Hash]) {
		let mut tips = self.tips.lock().unwrap();
		for h in hashes {
			let height = tips.len() as u64 + 1;
			tips.push(Tip::new(height, *h));
		}
	}

	pub fn height(&self) -> u64 {
		self.tips.lock().unwrap().len() as u64
	}
}

impl ChainAdapter for TestChain {
	fn tail(&self) -> Result<Tip, Error> {
		self.tips
			.lock()
			.unwrap()
			.last()
			.cloned()
			.ok_or_else(|| ErrorKind::Chain("empty chain".to_string()).into())
	}

	fn block_by_height(&self, height: u64) -> Result<Tip, Error> {
		self.tips
			.lock()
			.unwrap()
			.get(height.wrapping_sub(1) as usize)
			.cloned()
			.ok_or_else(|| ErrorKind::Chain(format!("no block at height {}", height)).into())
	}
}

/// A sent message as the recording transport saw it.
pub struct SentMessage {
	pub msg_type: Type,
	pub body: Vec<u8>,
	pub filter: PeerFilter,
}

/// Transport double: records everything, answers the chain sync filter
/// with a fixed peer set and the random filter with one of them.
pub struct TestNet {
	pub peers: Vec<SocketAddr>,
	pub sent: Mutex<Vec<SentMessage>>,
	pub closed: Mutex<Vec<(SocketAddr, ErrorKind)>>,
}

impl TestNet {
	pub fn with_peers(count: u8) -> TestNet {
		TestNet {
			peers: (1..=count).map(peer).collect(),
			sent: Mutex::new(vec![]),
			closed: Mutex::new(vec![]),
		}
	}

	pub fn sent_count(&self, msg_type: Type) -> usize {
		self.sent
			.lock()
			.unwrap()
			.iter()
			.filter(|m| m.msg_type == msg_type)
			.count()
	}

	pub fn bodies(&self, msg_type: Type) -> Vec<Vec<u8>> {
		self.sent
			.lock()
			.unwrap()
			.iter()
			.filter(|m| m.msg_type == msg_type)
			.map(|m| m.body.clone())
			.collect()
	}

	pub fn closed_peers(&self) -> Vec<(SocketAddr, ErrorKind)> {
		self.closed.lock().unwrap().clone()
	}
}

impl NetAdapter for TestNet {
	fn send_to_peers(
		&self,
		msg_type: Type,
		body: Vec<u8>,
		_priority: MessagePriority,
		filter: PeerFilter,
	) -> Vec<SocketAddr> {
		self.sent.lock().unwrap().push(SentMessage {
			msg_type,
			body,
			filter,
		});
		match filter {
			PeerFilter::ChainSync => self.peers.clone(),
			PeerFilter::RandomPeer => self
				.peers
				.choose(&mut thread_rng())
				.cloned()
				.into_iter()
				.collect(),
		}
	}

	fn close_peer(&self, addr: SocketAddr, reason: &ErrorKind) {
		self.closed.lock().unwrap().push((addr, reason.clone()));
	}
}

/// Verifier double accepting everything except the roots it was primed
/// with, each of which fails exactly once.
#[derive(Default)]
pub struct TestVerifier {
	pub bad_headers_roots: Mutex<HashSet<Hash>>,
	pub bad_data_roots: Mutex<HashSet<Hash>>,
}

impl ChunkVerifier for TestVerifier {
	fn verify_chunk_headers(&self, headers: &ChunkHeaders) -> Result<(), Error> {
		if self.bad_headers_roots.lock().unwrap().remove(&headers.root) {
			Err(ErrorKind::WrongChunkHeadersMessage.into())
		} else {
			Ok(())
		}
	}

	fn verify_chunk_data(&self, header: &ChunkHeader, _data: &ChunkData) -> Result<(), Error> {
		if self.bad_data_roots.lock().unwrap().remove(&header.root) {
			Err(ErrorKind::WrongChunkDataMessage.into())
		} else {
			Ok(())
		}
	}
}

/// Chunk processor double: appends the chunk's blocks to the test chain
/// and records the applied roots, rejecting primed roots once.
pub struct TestProcessor {
	chain: Arc<TestChain>,
	pub applied: Mutex<Vec<Hash>>,
	pub reject_roots: Mutex<HashSet<Hash>>,
}

impl TestProcessor {
	pub fn new(chain: Arc<TestChain>) -> TestProcessor {
		TestProcessor {
			chain,
			applied: Mutex::new(vec![]),
			reject_roots: Mutex::new(HashSet::new()),
		}
	}

	pub fn applied_roots(&self) -> Vec<Hash> {
		self.applied.lock().unwrap().clone()
	}
}

impl ChunkProcessor for TestProcessor {
	fn process_chunk_data(&self, data: &ChunkData) -> Result<(), Error> {
		if self.reject_roots.lock().unwrap().remove(&data.root) {
			return Err(ErrorKind::ChunkProcess("unfit blocks".to_string()).into());
		}
		let hashes = data.blocks.iter().map(|b| b.hash()).collect::<Vec<_>>();
		self.chain.push_blocks(&hashes);
		self.applied.lock().unwrap().push(data.root);
		Ok(())
	}
}

/// A consistent set of chunk headers plus the matching payloads, the way
/// an honest peer would answer a sync request.
pub struct ChunkPlan {
	pub headers: ChunkHeaders,
	pub data: Vec<ChunkData>,
}

/// Build `chunks` chunks of `blocks_per_chunk` deterministic blocks each,
/// varying with `seed`.
pub fn chunk_plan(chunks: usize, blocks_per_chunk: usize, seed: u8) -> ChunkPlan {
	let mut chunk_headers = vec![];
	let mut data = vec![];
	for c in 0..chunks {
		let blocks = (0..blocks_per_chunk)
			.map(|b| vec![seed, c as u8, b as u8, 0x7f])
			.collect::<Vec<_>>();
		let hashes = blocks.iter().map(|b| b.hash()).collect::<Vec<_>>();
		let root = hashes
			.iter()
			.flat_map(|h| h.to_vec())
			.collect::<Vec<u8>>()
			.hash();
		chunk_headers.push(ChunkHeader {
			root,
			headers: hashes,
		});
		data.push(ChunkData { root, blocks });
	}
	let root = chunk_headers
		.iter()
		.flat_map(|ch| ch.root.to_vec())
		.collect::<Vec<u8>>()
		.hash();
	ChunkPlan {
		headers: ChunkHeaders {
			root,
			chunk_headers,
		},
		data,
	}
}

/// The answer of a peer with nothing past our tail.
pub fn empty_chunk_headers() -> ChunkHeaders {
	ChunkHeaders {
		root: Hash::from_vec(&[]),
		chunk_headers: vec![],
	}
}
