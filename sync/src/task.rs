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

//! The chain synchronization task itself: a driver thread alternating the
//! header voting phase and the chunk fetching phase, with re-entrant
//! handlers for the peer replies feeding both. One mutex guards all task
//! state; handlers wake the driver through a small event channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use cirrus_core::ser;

use crate::error::ErrorKind;
use crate::fetcher::{ChunkFetcher, FetchProgress};
use crate::msg::{ChunkData, ChunkHeaders, SyncRequest, Type};
use crate::types::{
	ChainAdapter, ChunkProcessor, ChunkVerifier, MessagePriority, NetAdapter, PeerFilter,
	SyncConfig, SyncStatus, Tip,
};
use crate::voting::{HeaderVoting, VoteOutcome};

/// Wakeups for the driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
	/// Stop the task
	Quit,
	/// A header vote may have reached quorum
	VotingDone,
	/// The chunk pipeline may have drained
	FetchDone,
}

/// Where the driver currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Idle,
	Voting,
	Fetching,
	Done,
	Stopped,
}

/// Outcome of one phase of the driver loop.
enum PhaseOutcome {
	/// Move on to the next phase
	Continue,
	/// The task is over, exit the driver
	Exit,
}

/// Mutable task state, all of it behind the one task mutex.
struct TaskState {
	/// Block the next header request extends from
	sync_point: Tip,
	/// Peers solicited by the current sync request, in contact order
	chain_sync_peers: Vec<SocketAddr>,
	/// Header phase retries on the current sync point
	retry_count: u32,
	/// Phase 1, the header tally
	voting: HeaderVoting,
	/// Phase 2, the chunk download pipeline
	fetcher: ChunkFetcher,
	/// Driver position, for status reporting
	phase: Phase,
}

/// Synchronizes the local chain with the network in rounds: solicit and
/// elect the chunk headers past our tail, download their payloads, apply
/// them in order, repeat from the new tail. Finishes when peers answer
/// with an empty chunk set.
///
/// The task owns none of its collaborators and nothing references the
/// task; inbound messages reach it through the node's demux calling
/// `chunk_headers_received` and `chunk_data_received`.
pub struct SyncTask {
	inner: Arc<Inner>,
	events_rx: Mutex<Option<Receiver<Event>>>,
	done_rx: Mutex<Option<Receiver<()>>>,
}

struct Inner {
	config: SyncConfig,
	chain: Arc<dyn ChainAdapter>,
	net: Arc<dyn NetAdapter>,
	verifier: Arc<dyn ChunkVerifier>,
	state: Mutex<TaskState>,
	events: Mutex<Sender<Event>>,
	done: Mutex<SyncSender<()>>,
	started: AtomicBool,
}

impl SyncTask {
	/// Task over the injected collaborators, idle until started.
	pub fn new(
		config: SyncConfig,
		chain: Arc<dyn ChainAdapter>,
		net: Arc<dyn NetAdapter>,
		verifier: Arc<dyn ChunkVerifier>,
		processor: Arc<dyn ChunkProcessor>,
	) -> SyncTask {
		let (events_tx, events_rx) = mpsc::channel();
		let (done_tx, done_rx) = mpsc::sync_channel(1);

		let fetcher = ChunkFetcher::new(
			config.clone(),
			net.clone(),
			verifier.clone(),
			processor,
		);
		let state = TaskState {
			sync_point: Tip::new(0, cirrus_core::hash::ZERO_HASH),
			chain_sync_peers: vec![],
			retry_count: 0,
			voting: HeaderVoting::new(),
			fetcher,
			phase: Phase::Idle,
		};

		SyncTask {
			inner: Arc::new(Inner {
				config,
				chain,
				net,
				verifier,
				state: Mutex::new(state),
				events: Mutex::new(events_tx),
				done: Mutex::new(done_tx),
				started: AtomicBool::new(false),
			}),
			events_rx: Mutex::new(Some(events_rx)),
			done_rx: Mutex::new(Some(done_rx)),
		}
	}

	/// Spawn the driver thread. A task drives exactly one synchronization
	/// run; calling this twice is a no-op.
	pub fn start(&self) {
		if self.inner.started.swap(true, Ordering::SeqCst) {
			warn!("sync: task already started");
			return;
		}
		let events = match self.events_rx.lock().unwrap().take() {
			Some(events) => events,
			None => return,
		};
		let inner = self.inner.clone();
		let _ = thread::Builder::new()
			.name("chain_sync".to_string())
			.spawn(move || inner.sync_loop(events));
	}

	/// Ask the driver to exit at its next wakeup. Idempotent; no status is
	/// emitted for a stopped task.
	pub fn stop(&self) {
		let _ = self.inner.events.lock().unwrap().send(Event::Quit);
	}

	/// The completion channel. Yields `()` exactly once when the chain has
	/// fully caught up; can be taken only once.
	pub fn done_receiver(&self) -> Option<Receiver<()>> {
		self.done_rx.lock().unwrap().take()
	}

	/// Observable progress of the task.
	pub fn status(&self) -> SyncStatus {
		let state = self.inner.state.lock().unwrap();
		match state.phase {
			Phase::Idle => SyncStatus::Idle,
			Phase::Voting => SyncStatus::HeaderVoting {
				retries: state.retry_count,
			},
			Phase::Fetching => SyncStatus::ChunkFetch {
				applied: state.fetcher.applied(),
				total: state.fetcher.total(),
			},
			Phase::Done => SyncStatus::Done,
			Phase::Stopped => SyncStatus::Stopped,
		}
	}

	/// Handle a chunk headers reply from a peer. Demux entry point, safe
	/// to call from any thread.
	pub fn chunk_headers_received(&self, data: &[u8], addr: SocketAddr) {
		self.inner.chunk_headers_received(data, addr)
	}

	/// Handle a chunk data reply from a peer. Demux entry point, safe to
	/// call from any thread.
	pub fn chunk_data_received(&self, data: &[u8], addr: SocketAddr) {
		self.inner.chunk_data_received(data, addr)
	}
}

impl Inner {
	fn chunk_headers_received(&self, data: &[u8], addr: SocketAddr) {
		let mut state = self.state.lock().unwrap();

		// late replies once quorum is reached are not the peer's fault
		if state.voting.has_quorum(state.chain_sync_peers.len()) {
			debug!(
				"sync: chunk headers from {} dropped, already have quorum",
				addr
			);
			return;
		}

		// replies are only acceptable from the peers we solicited
		if state.chain_sync_peers.is_empty() || !state.chain_sync_peers.contains(&addr) {
			warn!("sync: chunk headers from unsolicited peer {}", addr);
			self.net
				.close_peer(addr, &ErrorKind::InvalidChunkHeadersSource);
			return;
		}

		let headers: ChunkHeaders = match ser::deserialize(&mut &data[..]) {
			Ok(headers) => headers,
			Err(e) => {
				warn!("sync: undecodable chunk headers from {}: {}", addr, e);
				self.net
					.close_peer(addr, &ErrorKind::InvalidChunkHeadersMessage);
				return;
			}
		};

		if let Err(e) = self.verifier.verify_chunk_headers(&headers) {
			warn!(
				"sync: chunk headers from {} failed verification: {}",
				addr, e
			);
			self.net
				.close_peer(addr, &ErrorKind::WrongChunkHeadersMessage);
			return;
		}

		let peer_count = state.chain_sync_peers.len();
		match state.voting.observe(addr, headers, peer_count) {
			VoteOutcome::Duplicate => {
				debug!("sync: duplicate chunk headers vote from {}", addr);
			}
			VoteOutcome::Counted => {}
			VoteOutcome::Quorum => {
				info!(
					"sync: chunk headers quorum, {} of {} peers agree",
					state.voting.max_count(),
					peer_count
				);
				self.notify(Event::VotingDone);
			}
		}
	}

	fn chunk_data_received(&self, data: &[u8], addr: SocketAddr) {
		let chunk: ChunkData = match ser::deserialize(&mut &data[..]) {
			Ok(chunk) => chunk,
			Err(e) => {
				warn!("sync: undecodable chunk data from {}: {}", addr, e);
				self.net
					.close_peer(addr, &ErrorKind::InvalidChunkDataMessage);
				return;
			}
		};

		let mut state = self.state.lock().unwrap();
		if let FetchProgress::Done = state.fetcher.on_chunk_data(addr, chunk) {
			info!("sync: all {} chunks applied", state.fetcher.total());
			self.notify(Event::FetchDone);
		}
	}

	/// Post a wakeup for the driver. Events are level triggers, the
	/// driver re-checks state on every wakeup.
	fn notify(&self, event: Event) {
		let _ = self.events.lock().unwrap().send(event);
	}

	fn sync_loop(&self, events: Receiver<Event>) {
		// anchor the first request at our current tail; a failing lookup
		// is retried, the store may still be coming up
		loop {
			match self.chain.tail() {
				Ok(tip) => {
					let mut state = self.state.lock().unwrap();
					state.sync_point = tip;
					break;
				}
				Err(e) => {
					error!("sync: cannot read the chain tail: {}", e);
					match events.recv_timeout(Duration::from_secs(1)) {
						Ok(Event::Quit) | Err(RecvTimeoutError::Disconnected) => {
							self.enter_terminal(Phase::Stopped);
							return;
						}
						_ => {}
					}
				}
			}
		}

		loop {
			match self.voting_phase(&events) {
				PhaseOutcome::Continue => {}
				PhaseOutcome::Exit => return,
			}
			match self.fetching_phase(&events) {
				PhaseOutcome::Continue => {}
				PhaseOutcome::Exit => return,
			}
		}
	}

	/// Solicit chunk headers and wait until the tally reaches quorum,
	/// retrying (and eventually rewinding) on a ticker.
	fn voting_phase(&self, events: &Receiver<Event>) -> PhaseOutcome {
		{
			let mut state = self.state.lock().unwrap();
			state.phase = Phase::Voting;
			self.send_sync_request(&mut state);
		}

		let tick = Duration::from_secs(self.config.header_tick_secs);
		let mut deadline = Instant::now() + tick;
		loop {
			let wait = deadline.saturating_duration_since(Instant::now());
			match events.recv_timeout(wait) {
				Ok(Event::Quit) | Err(RecvTimeoutError::Disconnected) => {
					self.enter_terminal(Phase::Stopped);
					return PhaseOutcome::Exit;
				}
				Ok(Event::VotingDone) => {
					let state = self.state.lock().unwrap();
					if state.voting.has_quorum(state.chain_sync_peers.len()) {
						return PhaseOutcome::Continue;
					}
					// stale wakeup, keep collecting
				}
				Ok(Event::FetchDone) => {}
				Err(RecvTimeoutError::Timeout) => {
					let mut state = self.state.lock().unwrap();
					if state.voting.has_quorum(state.chain_sync_peers.len()) {
						return PhaseOutcome::Continue;
					}
					self.retry_voting(&mut state);
					deadline = Instant::now() + tick;
				}
			}
		}
	}

	/// Fetch the winning chunk set and wait until every chunk is applied,
	/// sweeping for timed out requests on a ticker.
	fn fetching_phase(&self, events: &Receiver<Event>) -> PhaseOutcome {
		{
			let mut state = self.state.lock().unwrap();
			state.phase = Phase::Fetching;
			let winning = match state.voting.winning() {
				Some(winning) => winning.clone(),
				None => {
					// cannot happen with a quorum, start the round over
					error!("sync: quorum reached without a winning header set");
					self.reset_round(&mut state);
					return PhaseOutcome::Continue;
				}
			};
			if state.fetcher.begin(winning) {
				// peers have nothing past our tail, we are synchronized
				return self.finish(state);
			}
		}

		let tick = Duration::from_secs(self.config.data_tick_secs);
		let mut deadline = Instant::now() + tick;
		loop {
			let wait = deadline.saturating_duration_since(Instant::now());
			match events.recv_timeout(wait) {
				Ok(Event::Quit) | Err(RecvTimeoutError::Disconnected) => {
					self.enter_terminal(Phase::Stopped);
					return PhaseOutcome::Exit;
				}
				Ok(Event::FetchDone) => {
					let mut state = self.state.lock().unwrap();
					if state.fetcher.all_finished() {
						// round complete, vote again from the new tail
						self.reset_round(&mut state);
						match self.chain.tail() {
							Ok(tip) => {
								state.sync_point = tip;
								state.retry_count = 0;
							}
							Err(e) => {
								error!("sync: cannot read the chain tail: {}", e);
							}
						}
						return PhaseOutcome::Continue;
					}
					// stale wakeup, keep fetching
				}
				Ok(Event::VotingDone) => {}
				Err(RecvTimeoutError::Timeout) => {
					let mut state = self.state.lock().unwrap();
					state.fetcher.resend_expired(Utc::now());
					deadline = Instant::now() + tick;
				}
			}
		}
	}

	/// Solicit chunk headers from the chain sync peers, anchored at the
	/// current sync point.
	fn send_sync_request(&self, state: &mut TaskState) {
		let request = SyncRequest {
			tail_block_hash: state.sync_point.hash,
		};
		let body = match ser::ser_vec(&request) {
			Ok(body) => body,
			Err(e) => {
				// the header ticker retries the whole request
				error!("sync: could not serialize the sync request: {}", e);
				return;
			}
		};
		state.chain_sync_peers = self.net.send_to_peers(
			Type::ChainSync,
			body,
			MessagePriority::Low,
			PeerFilter::ChainSync,
		);
		debug!(
			"sync: asked {} peers for chunk headers past height {}",
			state.chain_sync_peers.len(),
			state.sync_point.height
		);
	}

	/// No quorum within a tick: restart the vote, backing the sync point
	/// up one chunk once retries on it keep failing.
	fn retry_voting(&self, state: &mut TaskState) {
		debug!(
			"sync: no chunk headers quorum ({} of {} peers), asking again",
			state.voting.max_count(),
			state.chain_sync_peers.len()
		);
		self.reset_round(state);
		if state.retry_count >= 2 {
			// retries restart at zero on the rewound sync point
			self.rewind_sync_point(state);
		} else {
			state.retry_count += 1;
		}
		self.send_sync_request(state);
	}

	/// Back the sync point up one chunk. Repeated failure to agree from
	/// the current tail is evidence it sits on a local fork, so anchor on
	/// a prefix both sides share.
	fn rewind_sync_point(&self, state: &mut TaskState) {
		let height = state.sync_point.height;
		let rewound = if height > self.config.chunk_size {
			height - self.config.chunk_size
		} else {
			1
		};
		match self.chain.block_by_height(rewound) {
			Ok(tip) => {
				info!(
					"sync: rewinding the sync point from height {} to {}",
					height, rewound
				);
				state.sync_point = tip;
				state.retry_count = 0;
			}
			Err(e) => {
				// keep the current anchor, the next tick tries again
				warn!("sync: cannot rewind to height {}: {}", rewound, e);
			}
		}
	}

	/// Clear all voting and fetching state. Retry bookkeeping and the
	/// sync point survive, they are the caller's business.
	fn reset_round(&self, state: &mut TaskState) {
		state.voting.reset();
		state.fetcher.reset();
		state.chain_sync_peers.clear();
	}

	/// Clean completion: report success exactly once and exit.
	fn finish(&self, mut state: MutexGuard<'_, TaskState>) -> PhaseOutcome {
		state.phase = Phase::Done;
		info!(
			"sync: chain is up to date at height {}",
			state.sync_point.height
		);
		drop(state);
		let _ = self.done.lock().unwrap().try_send(());
		PhaseOutcome::Exit
	}

	fn enter_terminal(&self, phase: Phase) {
		let mut state = self.state.lock().unwrap();
		state.phase = phase;
	}
}
