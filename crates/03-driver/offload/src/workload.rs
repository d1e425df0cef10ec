//! Payloads a host session can run through the shared buffer.

use transport_codecs::control::ControlTag;
use transport_codecs::fixed;
use transport_codecs::matmul::{self, MatrixLayout};
use transport_codecs::trackability::{self, Geometry, Layout, Partition};

use crate::OffloadResult;

/// One offloaded computation: how to fill the buffer and read it back.
pub trait Workload {
    type Output;

    /// Bytes the packed payload occupies.
    fn required_bytes(&self) -> usize;

    /// Fills `buf`. Must not write anything if the payload does not fit.
    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()>;

    fn unpack(&self, buf: &[u8]) -> OffloadResult<Self::Output>;

    /// Setup values the co-processor must have been given for this job.
    fn setup_fields(&self) -> Vec<(ControlTag, u32)> {
        Vec::new()
    }
}

/// Minimum-eigenvalue map of a gradient image, computed over one row band.
#[derive(Clone, Debug)]
pub struct TrackabilityJob {
    layout: Layout,
    grad_x: Vec<i32>,
    grad_y: Vec<i32>,
}

impl TrackabilityJob {
    /// Encodes the full-image gradient planes to fixed point.
    pub fn new(
        geometry: Geometry,
        partition: Partition,
        grad_x: &[f32],
        grad_y: &[f32],
    ) -> OffloadResult<Self> {
        let layout = Layout::new(geometry, partition)?;
        let max_abs = grad_x
            .iter()
            .chain(grad_y)
            .fold(0.0f64, |max, &g| max.max(f64::from(g).abs()));
        if fixed::accumulation_overflows(max_abs, geometry.window_hh, geometry.window_hw) {
            tracing::warn!(
                max_abs,
                window_hh = geometry.window_hh,
                window_hw = geometry.window_hw,
                "gradients may overflow the 32-bit window accumulators"
            );
        }
        Ok(Self {
            layout,
            grad_x: fixed::encode_plane(grad_x)?,
            grad_y: fixed::encode_plane(grad_y)?,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

/// Result band of a trackability run, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackabilityMap {
    pub partition: Partition,
    /// First image column with a result.
    pub first_col: usize,
    pub cols: usize,
    pub values: Vec<i32>,
}

impl TrackabilityMap {
    /// Minimum eigenvalue at image coordinates, if the pixel was processed.
    pub fn at(&self, row: usize, col: usize) -> Option<i32> {
        let row = row.checked_sub(self.partition.first_row)?;
        let col = col.checked_sub(self.first_col)?;
        if row >= self.partition.rows || col >= self.cols {
            return None;
        }
        self.values.get(row * self.cols + col).copied()
    }
}

impl Workload for TrackabilityJob {
    type Output = TrackabilityMap;

    fn required_bytes(&self) -> usize {
        self.layout.bytes()
    }

    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()> {
        trackability::pack(&self.layout, &self.grad_x, &self.grad_y, buf)?;
        Ok(())
    }

    fn unpack(&self, buf: &[u8]) -> OffloadResult<TrackabilityMap> {
        let geometry = self.layout.geometry();
        Ok(TrackabilityMap {
            partition: *self.layout.partition(),
            first_col: geometry.border_x,
            cols: geometry.cols - 2 * geometry.border_x,
            values: trackability::unpack_results(&self.layout, buf)?,
        })
    }
}

/// Square integer matrix product.
#[derive(Clone, Debug)]
pub struct MatMulJob {
    layout: MatrixLayout,
    a: Vec<i32>,
    b: Vec<i32>,
}

impl MatMulJob {
    pub fn new(n: usize, a: Vec<i32>, b: Vec<i32>) -> OffloadResult<Self> {
        let layout = MatrixLayout::new(n)?;
        Ok(Self { layout, a, b })
    }

    pub fn n(&self) -> usize {
        self.layout.n()
    }

    /// The setup field the co-processor needs before the first cycle.
    pub fn setup_field(&self) -> (ControlTag, u32) {
        (ControlTag::MatrixSize, self.layout.n() as u32)
    }
}

impl Workload for MatMulJob {
    type Output = Vec<i32>;

    fn required_bytes(&self) -> usize {
        self.layout.bytes()
    }

    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()> {
        matmul::pack(&self.layout, &self.a, &self.b, buf)?;
        Ok(())
    }

    fn unpack(&self, buf: &[u8]) -> OffloadResult<Vec<i32>> {
        Ok(matmul::unpack_product(&self.layout, buf)?)
    }

    fn setup_fields(&self) -> Vec<(ControlTag, u32)> {
        vec![self.setup_field()]
    }
}
