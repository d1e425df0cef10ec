//! Windowed structure-tensor kernel over a trackability payload.
//!
//! Integer arithmetic throughout, matching the co-processor's 32-bit
//! registers: products and sums wrap instead of trapping.

use log::{debug, warn};
use offload::protocol::{STATUS_KERNEL_FAILED, STATUS_OK};
use offload::Kernel;
use transport_codecs::fixed::{ONE, SHIFT};
use transport_codecs::trackability::{field, read_header, Extents, Geometry, Partition, PLANE_A};
use transport_codecs::words::{word_count, Words, WordsMut};
use transport_codecs::CodecResult;

/// Bitwise integer square root, rounding down.
pub fn isqrt(x: u32) -> u32 {
    let mut op = x;
    let mut res = 0u32;
    let mut one = 1u32 << 30;
    while one > op {
        one >>= 2;
    }
    while one != 0 {
        if op >= res + one {
            op -= res + one;
            res += one << 1;
        }
        res >>= 1;
        one >>= 2;
    }
    res
}

/// Smaller eigenvalue of `[[gxx, gxy], [gxy, gyy]]`.
///
/// The discriminant is formed in wrapping `i32` and rooted as unsigned; the
/// final subtraction and halving are unsigned as well.
pub fn min_eigenvalue(gxx: i32, gxy: i32, gyy: i32) -> i32 {
    let diff = gxx.wrapping_sub(gyy);
    let disc = diff
        .wrapping_mul(diff)
        .wrapping_add(4i32.wrapping_mul(gxy).wrapping_mul(gxy));
    let root = isqrt(disc as u32);
    ((gxx.wrapping_add(gyy) as u32).wrapping_sub(root) / 2) as i32
}

/// Window sums of `(g * g) >> SHIFT` for one output pixel, each divided by
/// `2^SHIFT`.
fn window_tensor(ext: &Extents, gx: &[i32], gy: &[i32], y: usize, x: usize) -> (i32, i32, i32) {
    let (mut gxx, mut gxy, mut gyy) = (0i32, 0i32, 0i32);
    for yy in y - ext.window_hh..=y + ext.window_hh {
        let row = yy * ext.cols;
        for xx in x - ext.window_hw..=x + ext.window_hw {
            let (a, b) = (gx[row + xx], gy[row + xx]);
            gxx = gxx.wrapping_add(a.wrapping_mul(a) >> SHIFT);
            gxy = gxy.wrapping_add(a.wrapping_mul(b) >> SHIFT);
            gyy = gyy.wrapping_add(b.wrapping_mul(b) >> SHIFT);
        }
    }
    (gxx / ONE, gxy / ONE, gyy / ONE)
}

/// Runs the kernel over a packed buffer in place. Appends one result per
/// owned pixel and leaves field 8 one past the last. Returns the number of
/// results written.
pub fn compute(buf: &mut [u8]) -> CodecResult<usize> {
    let ext = read_header(buf)?.extents(word_count(buf))?;
    let plane_len = (ext.rows_dsp + 2 * ext.window_hh) * ext.cols;
    let words = Words::new(buf);
    let gx = words.range(PLANE_A, plane_len)?;
    let gy = words.range(ext.plane_b, plane_len)?;

    let mut results = Vec::with_capacity(ext.rows_dsp * (ext.cols - 2 * ext.border_x));
    for y in ext.window_hh..ext.window_hh + ext.rows_dsp {
        for x in ext.border_x..ext.cols - ext.border_x {
            let (gxx, gxy, gyy) = window_tensor(&ext, &gx, &gy, y, x);
            results.push(min_eigenvalue(gxx, gxy, gyy));
        }
    }

    let mut words = WordsMut::new(buf);
    words.put(ext.results, &results)?;
    words.set(field::RESULTS, (ext.results + results.len()) as i32)?;
    Ok(results.len())
}

/// Floating-point minimum eigenvalue of the window tensor over full-image
/// gradients, one value per pixel of `partition`, row-major.
pub fn reference(geometry: &Geometry, partition: &Partition, gx: &[f32], gy: &[f32]) -> Vec<f64> {
    let Geometry {
        cols,
        window_hh,
        window_hw,
        border_x,
        ..
    } = *geometry;
    let mut out = Vec::with_capacity(partition.rows * (cols - 2 * border_x));
    for y in partition.first_row..partition.first_row + partition.rows {
        for x in border_x..cols - border_x {
            let (mut gxx, mut gxy, mut gyy) = (0f64, 0f64, 0f64);
            for yy in y - window_hh..=y + window_hh {
                for xx in x - window_hw..=x + window_hw {
                    let a = f64::from(gx[yy * cols + xx]);
                    let b = f64::from(gy[yy * cols + xx]);
                    gxx += a * a;
                    gxy += a * b;
                    gyy += b * b;
                }
            }
            let root = ((gxx - gyy) * (gxx - gyy) + 4.0 * gxy * gxy).sqrt();
            out.push((gxx + gyy - root) / 2.0);
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct TrackabilityKernel {
    runs: u64,
}

impl TrackabilityKernel {
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl Kernel for TrackabilityKernel {
    fn name(&self) -> &'static str {
        "trackability"
    }

    fn run(&mut self, buf: &mut [u8]) -> u32 {
        self.runs += 1;
        match compute(buf) {
            Ok(count) => {
                debug!("trackability run {}: {count} results", self.runs);
                STATUS_OK
            }
            Err(err) => {
                warn!("trackability run {} rejected its payload: {err}", self.runs);
                STATUS_KERNEL_FAILED
            }
        }
    }
}
