//! Host/co-processor offload handshake built on the `transport` primitives.
//!
//! [`TransferSession`] drives the host side: it boots the co-processor,
//! shares one buffer and runs arm/wait/consume cycles over it.
//! [`ComputeTask`] is the matching co-processor side, serving each cycle
//! with a [`Kernel`]. Control messages travel as framed doorbell words
//! (see `transport_codecs::control`).

mod config;
mod context;
mod error;
pub mod protocol;
mod session;
mod task;
mod teardown;
mod workload;

pub use config::{parse_buffer_size, SessionConfig, TaskConfig};
pub use context::{Doorbell, Inbound, LinkContext};
pub use error::{OffloadError, OffloadResult, SetupStage};
pub use session::TransferSession;
pub use task::{
    run_image, ComputeTask, Kernel, EXIT_OK, EXIT_RUN_FAILED, EXIT_SETUP_FAILED,
    EXIT_TEARDOWN_FAILED,
};
pub use teardown::{StepOutcome, TeardownReport, TeardownStep};
pub use workload::{MatMulJob, TrackabilityJob, TrackabilityMap, Workload};
