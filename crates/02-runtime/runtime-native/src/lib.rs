#![deny(missing_docs)]
//! Native co-processor harness: images run on host threads and share pools
//! and doorbells with the host through in-process registries.

mod loader;
mod platform;

pub use loader::NativeLoader;
pub use platform::{ImageTable, NativePlatform};
