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

//! Message types that transit over the network during chunked chain
//! synchronization and related serialization code.

use cirrus_core::hash::Hash;
use cirrus_core::ser::{self, Readable, Reader, Writeable, Writer};

/// Maximum number of chunk headers a peer should ever send in one reply
pub const MAX_CHUNK_HEADERS: u64 = 512;

/// Maximum number of block hashes a single chunk header may commit to,
/// and of block payloads in a single chunk data message
pub const MAX_CHUNK_BLOCKS: u64 = 256;

/// Types of sync messages. The network layer maps them onto its topics;
/// inbound payloads arrive already demultiplexed by type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
	/// Ask peers for the chunk headers following a tail block
	ChainSync,
	/// Reply carrying the successive chunk headers a peer can serve
	ChainChunks,
	/// Ask a single peer for the payload of one chunk
	ChainGetChunk,
	/// Reply carrying one chunk payload
	ChainChunkData,
}

/// Opening message of a sync round. Names the block from which the
/// receiving peer should enumerate forward chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
	/// Tail of the requester's canonical chain
	pub tail_block_hash: Hash,
}

impl Writeable for SyncRequest {
	fn write(&self, writer: &mut dyn Writer) -> Result<(), ser::Error> {
		self.tail_block_hash.write(writer)
	}
}

impl Readable for SyncRequest {
	fn read(reader: &mut dyn Reader) -> Result<SyncRequest, ser::Error> {
		let tail_block_hash = Hash::read(reader)?;
		Ok(SyncRequest { tail_block_hash })
	}
}

/// Merkle commitment over one contiguous run of blocks, plus the committed
/// block hashes themselves, in chain order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
	/// Root over the block hashes below
	pub root: Hash,
	/// Hashes of the blocks forming the chunk
	pub headers: Vec<Hash>,
}

impl Writeable for ChunkHeader {
	fn write(&self, writer: &mut dyn Writer) -> Result<(), ser::Error> {
		self.root.write(writer)?;
		writer.write_u64(self.headers.len() as u64)?;
		for h in &self.headers {
			h.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for ChunkHeader {
	fn read(reader: &mut dyn Reader) -> Result<ChunkHeader, ser::Error> {
		let root = Hash::read(reader)?;
		let count = reader.read_u64()?;
		if count > MAX_CHUNK_BLOCKS {
			return Err(ser::Error::CorruptedData);
		}
		let mut headers = Vec::with_capacity(count as usize);
		for _ in 0..count {
			headers.push(Hash::read(reader)?);
		}
		Ok(ChunkHeader { root, headers })
	}
}

/// A peer's answer to a sync request: the ordered sequence of successive
/// chunks it can serve past the requested tail, plus a root committing to
/// the whole sequence. Peers that agree on the canonical chain produce an
/// identical root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeaders {
	/// Root over the chunk headers below
	pub root: Hash,
	/// Headers of the successive chunks, in chain order
	pub chunk_headers: Vec<ChunkHeader>,
}

impl ChunkHeaders {
	/// Number of chunks on offer
	pub fn len(&self) -> usize {
		self.chunk_headers.len()
	}

	/// An empty answer means the requester is already at the tip
	pub fn is_empty(&self) -> bool {
		self.chunk_headers.is_empty()
	}
}

impl Writeable for ChunkHeaders {
	fn write(&self, writer: &mut dyn Writer) -> Result<(), ser::Error> {
		self.root.write(writer)?;
		writer.write_u64(self.chunk_headers.len() as u64)?;
		for ch in &self.chunk_headers {
			ch.write(writer)?;
		}
		Ok(())
	}
}

impl Readable for ChunkHeaders {
	fn read(reader: &mut dyn Reader) -> Result<ChunkHeaders, ser::Error> {
		let root = Hash::read(reader)?;
		let count = reader.read_u64()?;
		if count > MAX_CHUNK_HEADERS {
			return Err(ser::Error::CorruptedData);
		}
		let mut chunk_headers = Vec::with_capacity(count as usize);
		for _ in 0..count {
			chunk_headers.push(ChunkHeader::read(reader)?);
		}
		Ok(ChunkHeaders {
			root,
			chunk_headers,
		})
	}
}

/// Payload for exactly one chunk header, matched by root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkData {
	/// Root of the chunk header this payload answers
	pub root: Hash,
	/// The serialized blocks forming the chunk, in chain order
	pub blocks: Vec<Vec<u8>>,
}

impl Writeable for ChunkData {
	fn write(&self, writer: &mut dyn Writer) -> Result<(), ser::Error> {
		self.root.write(writer)?;
		writer.write_u64(self.blocks.len() as u64)?;
		for b in &self.blocks {
			writer.write_bytes(b)?;
		}
		Ok(())
	}
}

impl Readable for ChunkData {
	fn read(reader: &mut dyn Reader) -> Result<ChunkData, ser::Error> {
		let root = Hash::read(reader)?;
		let count = reader.read_u64()?;
		if count > MAX_CHUNK_BLOCKS {
			return Err(ser::Error::CorruptedData);
		}
		let mut blocks = Vec::with_capacity(count as usize);
		for _ in 0..count {
			blocks.push(reader.read_bytes()?);
		}
		Ok(ChunkData { root, blocks })
	}
}
