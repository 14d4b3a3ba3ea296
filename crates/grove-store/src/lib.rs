//! Reference-counted block store for content-addressed DAGs.
//!
//! Blocks are identified by CIDs and carry outbound links that form a
//! directed acyclic graph. The store persists blocks together with the
//! bookkeeping that keeps a block alive exactly as long as some holder
//! needs it: a block shared by several roots is stored once and reclaimed
//! only when its last referent is gone. The invariant maintained by every
//! committed operation is
//!
//! ```text
//! count(B) = #(external holders of B) + Σ links into B from complete parents
//! ```
//!
//! with repeated links counting once per occurrence.
//!
//! # Stores
//!
//! - [`Counted`] — recursive [`increment`](Counted::increment) /
//!   [`decrement`](Counted::decrement) over whole DAGs, each a single
//!   atomic transaction.
//! - [`TagCounted`] — adds named idempotent holders
//!   ([`put_tag`](TagCounted::put_tag) and friends), each worth exactly one
//!   counter unit.
//! - [`ProgressiveCounted`] / [`ProgressiveTagCounted`] — ingest large
//!   DAGs over many small transactions with crash-safe resumption and a
//!   live [`ProgressReport`].
//!
//! All four share one keyspace and one set of counters, so the
//! non-progressive and progressive paths interleave freely over the same
//! backend.
//!
//! # Collaborators
//!
//! The backend is any [`grove_kv::Kv`] implementation: an ordered keyspace
//! with optimistic transactions. Commit conflicts are retried transparently
//! inside each operation. Missing blocks are fetched through a
//! caller-supplied [`BlockSource`]; links are extracted by the
//! codec-dispatched [`Options::link_decoder`], which handles raw and
//! DAG-protobuf blocks out of the box.

pub mod counted;
pub mod counter;
pub mod error;
pub mod keys;
pub mod links;
pub mod progressive;
pub mod progressive_tags;
pub mod report;
pub mod tags;
pub mod traits;
mod txn;

#[cfg(test)]
mod testutil;

pub use counted::{CidKeys, Counted};
pub use counter::Meta;
pub use error::{StoreError, StoreResult};
pub use links::{decode_links, Decoded, LinkDecoder, Options, DAG_PB_CODEC, RAW_CODEC};
pub use progressive::{Progress, ProgressiveCounted};
pub use progressive_tags::ProgressiveTagCounted;
pub use report::ProgressReport;
pub use tags::TagCounted;
pub use traits::{BlockSource, CounterStore, ReadStore, TagStore};

// The backend seam, re-exported so store users need only one import.
pub use grove_kv::{Cancel, Key, Kv, KvError, MemoryKv, Query, Txn};
