//! Co-processor lifecycle seam.
//!
//! The host drives a co-processor through [`ProcessorLoader`]; what actually
//! runs there is an image whose entry point receives a [`DspEnv`]. Native
//! loaders run images on a thread, but the host code only sees the trait.

use std::path::Path;
use std::sync::Arc;

use crate::ids::ProcessorId;
use crate::notify::NotifyEndpoint;
use crate::pool::PoolRegistry;
use crate::TransportResult;

/// Entry point of a co-processor image. The return value is its exit code.
pub type ImageEntry = fn(DspEnv) -> i32;

/// Everything an image can reach from the co-processor side.
pub struct DspEnv {
    pub processor: ProcessorId,
    /// Arguments given to [`ProcessorLoader::load`].
    pub args: Vec<String>,
    pub pools: Arc<PoolRegistry>,
    pub notify: NotifyEndpoint,
}

/// Boot sequence of one co-processor, in call order.
///
/// Implementations report failures as [`crate::TransportError::Processor`].
pub trait ProcessorLoader: Send {
    fn setup(&mut self) -> TransportResult<()>;

    fn attach(&mut self, id: ProcessorId) -> TransportResult<()>;

    fn load(&mut self, id: ProcessorId, image: &Path, args: &[String]) -> TransportResult<()>;

    fn start(&mut self, id: ProcessorId) -> TransportResult<()>;

    /// Stops the processor and returns the image's exit code, again on
    /// repeated calls.
    fn stop(&mut self, id: ProcessorId) -> TransportResult<i32>;

    fn detach(&mut self, id: ProcessorId) -> TransportResult<()>;

    fn destroy(&mut self) -> TransportResult<()>;
}

/// Host half of a link: the shared pools, the host doorbell and a loader.
pub struct HostLink {
    pub pools: Arc<PoolRegistry>,
    pub notify: NotifyEndpoint,
    pub loader: Box<dyn ProcessorLoader>,
}
