//! Immutable, content-addressed object shards.
//!
//! A shard is a single file holding a fixed set of `(key, object)` pairs,
//! indexed by a minimal perfect hash built once at creation time. Writers use
//! [`ShardCreator`] (prepare, write every object, finalize); readers map the
//! file with [`Shard`] and look keys up in constant time. The only mutation
//! after creation is [`Shard::delete`], which tombstones a slot in place.

mod byte_store;
pub mod config;
pub mod creator;
pub mod error;
mod format;
mod phf;
pub mod shard;

pub use config::BuildConfig;
pub use creator::{BuildPhase, ShardCreator};
pub use error::{ErrorKind, Result, ShardError, UsageError};
pub use shard::{Shard, ShardInfo, ShardIter, ShardPhase};

/// Key length of content-addressed shards: a SHA-256 or BLAKE3 digest.
pub const DEFAULT_KEY_LEN: usize = 32;

/// Shard keyed by 32-byte content digests.
pub type ContentShard = Shard<DEFAULT_KEY_LEN>;

pub type ContentShardCreator = ShardCreator<DEFAULT_KEY_LEN>;
