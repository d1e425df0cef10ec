//! Error surface for link-level helpers.
//!
//! Pool, notify and loader failures all land here. Callers on the session
//! path treat every variant as fatal to the session.

use thiserror::Error;

use crate::ids::{EventKey, PoolId, ProcessorId};
use crate::pool::Side;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Errors surfaced by the pool, notify and loader primitives.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to allocate shared region of {size} bytes aligned to {alignment}")]
    AllocationFailed { size: usize, alignment: usize },

    #[error("invalid pool attributes: {0}")]
    InvalidAttrs(&'static str),

    #[error("pool {0} is already open")]
    PoolAlreadyOpen(PoolId),

    #[error("pool {0} is not open")]
    PoolNotOpen(PoolId),

    #[error("pool {0} has been closed")]
    PoolClosed(PoolId),

    #[error("pool {pool} still has {outstanding} live buffer(s)")]
    PoolBusy { pool: PoolId, outstanding: usize },

    #[error("no size class matches a request of {requested} bytes")]
    NoMatchingSizeClass { requested: usize },

    #[error("size class of {size} bytes has no free buffer")]
    OutOfMemory { size: usize },

    #[error("address {addr:#x} ({len} bytes) is not inside pool {pool}")]
    NotInPool { pool: PoolId, addr: u64, len: usize },

    #[error("buffer at offset {offset} of pool {pool} is not a live allocation")]
    NotAllocated { pool: PoolId, offset: usize },

    #[error("buffer is owned by the {owner} side, not the {requester} side")]
    NotOwner { owner: Side, requester: Side },

    #[error("callback already registered for {0}")]
    AlreadyRegistered(EventKey),

    #[error("no callback registered for {0}")]
    NotRegistered(EventKey),

    #[error("processor {0} has no endpoint on the notify bus")]
    UnknownProcessor(ProcessorId),

    #[error("processor {0} already has an endpoint on the notify bus")]
    EndpointExists(ProcessorId),

    #[error("notify endpoint of processor {0} is shut down")]
    EndpointClosed(ProcessorId),

    #[error("processor {id}: {op} failed: {reason}")]
    Processor {
        id: ProcessorId,
        op: &'static str,
        reason: String,
    },
}
