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

//! Synchronization of the local blockchain with the rest of the network,
//! used either on a brand new node or when a node is late based on others'
//! heads. Works in rounds of two phases: solicit the chunk headers covering
//! the chain past our tail and elect the set most peers agree on, then
//! download the chunk payloads in parallel and apply them in strict height
//! order. Rounds repeat from the new tail until peers answer with an empty
//! chunk set, meaning we caught up.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

extern crate chrono;
extern crate failure;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;

extern crate cirrus_core;

pub mod error;
pub mod msg;
pub mod types;

mod fetcher;
mod task;
mod voting;

pub use crate::error::{Error, ErrorKind};
pub use crate::task::SyncTask;
pub use crate::types::{
	ChainAdapter, ChunkProcessor, ChunkVerifier, MessagePriority, NetAdapter, PeerFilter,
	SyncConfig, SyncStatus, Tip,
};
