//! Co-processor images the native loader can run, keyed by name.

use offload::run_image;
use transport::{DspEnv, ImageEntry};

use crate::matmul::MatMulKernel;
use crate::trackability::TrackabilityKernel;

pub const TRACKABILITY_IMAGE: &str = "trackability";
pub const MATMUL_IMAGE: &str = "matmul";

pub fn trackability_image(env: DspEnv) -> i32 {
    log::debug!("{} starting {TRACKABILITY_IMAGE}", env.processor);
    run_image(env, TrackabilityKernel::default())
}

pub fn matmul_image(env: DspEnv) -> i32 {
    log::debug!("{} starting {MATMUL_IMAGE}", env.processor);
    run_image(env, MatMulKernel::default())
}

/// Every built-in image with the name it is loaded by.
pub fn builtin_images() -> [(&'static str, ImageEntry); 2] {
    [
        (TRACKABILITY_IMAGE, trackability_image as ImageEntry),
        (MATMUL_IMAGE, matmul_image as ImageEntry),
    ]
}
