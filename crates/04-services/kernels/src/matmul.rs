use log::{debug, warn};
use offload::protocol::{MATMUL_SETUP_TAGS, STATUS_KERNEL_FAILED, STATUS_OK};
use offload::{Kernel, OffloadError, OffloadResult};
use transport_codecs::control::{ControlMessage, ControlTag};
use transport_codecs::matmul::MatrixLayout;
use transport_codecs::words::{Words, WordsMut};
use transport_codecs::CodecResult;

/// Row-major `n x n` product with wrapping `i32` arithmetic.
pub fn multiply(n: usize, a: &[i32], b: &[i32]) -> Vec<i32> {
    let mut product = vec![0i32; n * n];
    for i in 0..n {
        for j in 0..n {
            product[i * n + j] = (0..n).fold(0i32, |acc, k| {
                acc.wrapping_add(a[i * n + k].wrapping_mul(b[k * n + j]))
            });
        }
    }
    product
}

/// Multiplies the operands in `buf` and overwrites the product region.
pub fn compute(layout: &MatrixLayout, buf: &mut [u8]) -> CodecResult<()> {
    let words = Words::new(buf);
    let a = words.range(layout.a(), layout.elements())?;
    let b = words.range(layout.b(), layout.elements())?;
    let product = multiply(layout.n(), &a, &b);
    WordsMut::new(buf).put(layout.product(), &product)
}

/// Matrix multiply; the size arrives as a `MatrixSize` setup message.
#[derive(Debug, Default)]
pub struct MatMulKernel {
    layout: Option<MatrixLayout>,
}

impl MatMulKernel {
    pub fn n(&self) -> Option<usize> {
        self.layout.map(|layout| layout.n())
    }
}

impl Kernel for MatMulKernel {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn setup_tags(&self) -> &'static [ControlTag] {
        MATMUL_SETUP_TAGS
    }

    fn configure(&mut self, extra: &[ControlMessage]) -> OffloadResult<()> {
        let size = extra
            .iter()
            .find(|message| message.tag == ControlTag::MatrixSize)
            .ok_or(OffloadError::InvalidState("matrix size was not sent"))?;
        let layout = MatrixLayout::new(size.value as usize)?;
        debug!("matmul configured for n = {}", layout.n());
        self.layout = Some(layout);
        Ok(())
    }

    fn run(&mut self, buf: &mut [u8]) -> u32 {
        let Some(layout) = self.layout else {
            warn!("matmul ran before it was configured");
            return STATUS_KERNEL_FAILED;
        };
        match compute(&layout, buf) {
            Ok(()) => STATUS_OK,
            Err(err) => {
                warn!("matmul of n = {} failed: {err}", layout.n());
                STATUS_KERNEL_FAILED
            }
        }
    }
}
