//! Shard codec: serialize/deserialize shard JSON, build op lists, and
//! greedy bin-pack ops into size-capped shards.
//!
//! Accumulate serialized bytes and cut to a new shard as soon as the
//! next item would overflow the budget, rather than pre-computing an
//! even split.

use crate::id::ShardId;
use crate::store::Fact;
use serde::{Deserialize, Serialize};

/// Per-encrypted-payload size budget at shard creation time.
pub const SHARD_CREATE_BUDGET_BYTES: usize = 90 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardType {
    Delta,
    Snapshot,
    Identity,
}

/// A single mutation to replay against the local store.
///
/// Each variant carries its own `extra` catch-all so an unknown field
/// added to a future op shape survives a deserialize-then-reserialize
/// round trip instead of being dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Op {
    Upsert {
        fact: Fact,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
    Delete {
        key: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
}

/// A shard as it's serialized into the plaintext payload of the
/// encryption envelope.
///
/// `extra` catches any field a newer writer put in the shard that this
/// build doesn't know about. `#[serde(flatten)]` folds it back in on
/// serialize, so downloading a shard written by a newer version and
/// re-emitting it (e.g. during a rebase) doesn't silently drop data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Shard {
    pub shard_version: u32,
    pub shard_id: String,
    #[serde(rename = "type")]
    pub shard_type: ShardType,
    pub operations: Vec<Op>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Strips `dirty` (a local-only field that's never transmitted) and
/// wraps a fact as an upsert op.
pub fn fact_to_upsert_op(fact: &Fact) -> Op {
    let mut f = fact.clone();
    f.dirty = false;
    Op::Upsert {
        fact: f,
        extra: serde_json::Map::new(),
    }
}

/// Serializes a shard to canonical UTF-8 JSON. Field order within
/// `Op` variants is whatever `serde_json` emits for the struct
/// declaration order above, which is stable across calls.
pub fn serialize(shard: &Shard) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(shard)
}

pub fn deserialize(bytes: &[u8]) -> serde_json::Result<Shard> {
    serde_json::from_slice(bytes)
}

/// `create_chunked_shards(ops, start_version, shard_id_seed) ->
/// [Shard]`. Greedy bin-packs by serialized-byte count: a new shard
/// (and a fresh `ShardId`, and an incremented `shard_version`) starts
/// whenever the next op would push the accumulated JSON size over
/// [`SHARD_CREATE_BUDGET_BYTES`]. Every shard carries at least one op,
/// even if that op alone exceeds the budget (we never drop data to
/// stay under budget).
pub fn create_chunked_shards(ops: Vec<Op>, start_version: u32) -> Vec<Shard> {
    if ops.is_empty() {
        return Vec::new();
    }

    let mut shards = Vec::new();
    let mut current_ops: Vec<Op> = Vec::new();
    let mut current_size = shard_envelope_overhead();
    let mut version = start_version;

    for op in ops {
        let op_size = serde_json::to_vec(&op).map(|b| b.len()).unwrap_or(0);

        if !current_ops.is_empty() && current_size + op_size > SHARD_CREATE_BUDGET_BYTES {
            shards.push(finish_shard(version, std::mem::take(&mut current_ops)));
            version += 1;
            current_size = shard_envelope_overhead();
        }

        current_size += op_size;
        current_ops.push(op);
    }

    if !current_ops.is_empty() {
        shards.push(finish_shard(version, current_ops));
    }

    shards
}

fn finish_shard(version: u32, operations: Vec<Op>) -> Shard {
    Shard {
        shard_version: version,
        shard_id: ShardId::new().to_string(),
        shard_type: ShardType::Delta,
        operations,
        extra: serde_json::Map::new(),
    }
}

/// Rough constant overhead of the shard's non-operation JSON fields,
/// used so the bin-packer doesn't need to round-trip serialize the
/// whole accumulator just to check size.
fn shard_envelope_overhead() -> usize {
    64
}

/// Splits an already-encrypted byte string into `<= max_len`-byte
/// chunks in order. The last chunk may be shorter; an empty input
/// yields no chunks.
pub fn chunk_bytes(bytes: &[u8], max_len: usize) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes.chunks(max_len).collect()
}
