#![forbid(unsafe_code)]
//! Error types for nftl.
//!
//! # Error taxonomy
//!
//! One user-facing enum covers the four failure families of the engine:
//!
//! | Family | Variants | Recovery |
//! |--------|----------|----------|
//! | Allocation exhaustion | `NoFreeBlocks`, `PoolExhausted`, `QueueFull` | caller backs off or fails the host request |
//! | Caller contract | `InvalidGeometry`, `InvalidQueue`, `UnknownQueueItem`, `Misaligned` | programming error surfaced as a value, never a process abort |
//! | Device-reported | `Device` | propagated to the host request's result; erase failures additionally mark the block bad |
//! | Lifecycle | `ShutDown`, `Spawn`, `BlockState`, `Codec` | startup/teardown failures and metadata invariant breaches |
//!
//! The engine never retries internally: the read-modify-write transition is
//! a designed state change, not a retry, and everything else (timeouts,
//! resubmission) belongs to a wrapping layer.
//!
//! A read of a never-written LPA is deliberately **not** an error; the
//! mapping layer reports it as a miss with a zeroed physical address.
//!
//! This crate must not depend on `nftl-types` (no cyclic deps); variants
//! carry primitives, and `nftl-types` validation errors are converted into
//! `InvalidGeometry`/`Codec` at the consuming crate's boundary.

use thiserror::Error;

/// Unified error type for all nftl operations.
#[derive(Debug, Error)]
pub enum FtlError {
    /// Geometry or configuration rejected at construction time.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The block manager has no free block left on this parallel unit.
    ///
    /// Fatal to the allocation; the caller must never see an address of
    /// zero standing in for a failed allocation.
    #[error("no free blocks on parallel unit {punit}")]
    NoFreeBlocks { punit: u32 },

    /// The request pool is exhausted and cannot grow past its capacity.
    #[error("request pool exhausted at capacity {capacity}")]
    PoolExhausted { capacity: usize },

    /// The bounded priority queue is at its configured maximum size.
    #[error("priority queue full")]
    QueueFull,

    /// A queue id outside `0..nr_queues` was used.
    #[error("queue id {0} out of range")]
    InvalidQueue(usize),

    /// A queue item id that is not (or no longer) present.
    #[error("unknown queue item {0}")]
    UnknownQueueItem(u64),

    /// The device reported a failed physical operation.
    ///
    /// `ret` is the device's raw status; zero never appears here.
    #[error("device error {ret}: {detail}")]
    Device { ret: i32, detail: String },

    /// A host request that does not line up with the mapping granularity.
    #[error("misaligned host request: {0}")]
    Misaligned(String),

    /// The scheduler has been shut down; no further requests are admitted.
    #[error("scheduler is shut down")]
    ShutDown,

    /// The scheduler worker thread could not be started.
    #[error("failed to spawn scheduler worker: {0}")]
    Spawn(String),

    /// Block/subpage bookkeeping invariant breach (e.g. marking an already
    /// valid subpage valid again). Reported as a value instead of aborting.
    #[error("block state violation: {0}")]
    BlockState(String),

    /// Metadata codec failure (OOB area decode).
    #[error("metadata codec error: {0}")]
    Codec(String),
}

/// Result alias using `FtlError`.
pub type Result<T> = std::result::Result<T, FtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = FtlError::NoFreeBlocks { punit: 3 };
        assert_eq!(err.to_string(), "no free blocks on parallel unit 3");

        let err = FtlError::Device {
            ret: -5,
            detail: "erase failed".into(),
        };
        assert_eq!(err.to_string(), "device error -5: erase failed");

        let err = FtlError::PoolExhausted { capacity: 64 };
        assert_eq!(err.to_string(), "request pool exhausted at capacity 64");
    }
}
