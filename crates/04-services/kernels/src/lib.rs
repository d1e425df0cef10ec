#![allow(missing_docs)]

//! Compute kernels served by co-processor images.
//!
//! Each kernel works in place on the shared buffer layouts defined in
//! `transport_codecs` and reports a completion status to the host.

pub mod images;
pub mod matmul;
pub mod trackability;

pub use images::{builtin_images, MATMUL_IMAGE, TRACKABILITY_IMAGE};
pub use matmul::MatMulKernel;
pub use trackability::TrackabilityKernel;
