//! Link-level primitives shared by the host (GPP) and co-processor (DSP) domains.
//!
//! This crate models the pieces both sides of an offload link consume:
//! * [`SharedRegion`] – contiguous, aligned memory backing a buffer pool.
//! * [`SharedBufferPool`] – size-classed allocator with per-domain cache views,
//!   address translation and explicit writeback/invalidate.
//! * [`NotifyEndpoint`] – 32-bit doorbell events delivered to registered callbacks.
//! * [`Rendezvous`] – binary/counting semaphore turning callbacks into blocking waits.
//! * [`ProcessorLoader`] – lifecycle of the co-processor executable.

mod error;
mod ids;
mod notify;
mod pool;
mod proc;
mod region;
mod rendezvous;
pub mod wait;

pub use error::{TransportError, TransportResult};
pub use ids::{EventKey, PoolId, ProcessorId};
pub use notify::{NotifyBus, NotifyEndpoint, NotifyStats, RegistrationHandle};
pub use pool::{
    align_up, Buffer, BufferGuard, PoolAddr, PoolAttrs, PoolRegistry, SharedBufferPool, Side,
    SizeClass, BUF_ALIGN, CACHE_LINE, DEFAULT_REMOTE_BASE,
};
pub use proc::{DspEnv, HostLink, ImageEntry, ProcessorLoader};
pub use region::SharedRegion;
pub use rendezvous::{PostOutcome, Rendezvous, RendezvousMode};
