use cid::Cid;
use thiserror::Error;

use grove_kv::KvError;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No block bytes are stored for this CID.
    #[error("block not found: {cid}")]
    NotFound { cid: Cid },

    /// The operation's cancellation token was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// The built-in link decoder cannot handle this CID's codec.
    #[error("codec {codec:#x} is not supported in CID {cid}")]
    CodecNotSupported { cid: Cid, codec: u64 },

    /// A counter record failed validation. Counters are never healed
    /// silently; the raw bytes are preserved in the message.
    #[error("corrupted counter record: {detail}")]
    CorruptCounter { detail: String },

    /// A decoded link list contains an entry with no target.
    #[error("block {cid} contains an empty link")]
    EmptyLink { cid: Cid },

    /// Block bytes do not decode under the CID's codec.
    #[error("block {cid} does not decode: {reason}")]
    InvalidBlock { cid: Cid, reason: String },

    /// A link cycle was found while walking what must be a DAG.
    #[error("link cycle detected at {cid}")]
    Cycle { cid: Cid },

    /// A backend key could not be mapped back to a CID.
    #[error("key does not encode a CID: {key}")]
    MalformedKey { key: String },

    /// The tag is not a usable holder name.
    #[error("invalid tag: {reason}")]
    InvalidTag { reason: String },

    /// The walked root's counter dropped to zero mid-walk: a concurrent
    /// decrement eliminated it.
    #[error("progress was reverted by another action")]
    ProgressReverted,

    /// `run` was called a second time on the same progress handle.
    #[error("progress can only run once")]
    RunOnce,

    /// The CID's codec exposes no total size, so no byte-based progress
    /// report can be computed for it.
    #[error("codec of {cid} does not expose a total size")]
    SizeNotSupported { cid: Cid },

    /// A transaction closure failed after at least one commit attempt had
    /// already failed; both errors are preserved.
    #[error("{op} (after commit failure: {commit})")]
    RetryAborted { op: Box<StoreError>, commit: KvError },

    /// A block source failed to produce the requested block.
    #[error("block source failed for {cid}: {reason}")]
    Source { cid: Cid, reason: String },

    /// Backend failure, passed through.
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Convenience type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
