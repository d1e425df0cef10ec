//! Fixed-point samples: `round(value * 2^SHIFT)` in an `i32`.

use crate::{CodecError, CodecResult};

pub const SHIFT: u32 = 10;

/// `1.0` in fixed point.
pub const ONE: i32 = 1 << SHIFT;

/// Largest error of a decode/encode round trip.
pub const RESOLUTION: f64 = 1.0 / ONE as f64;

/// Encodes `value`, saturating at the `i32` range.
pub fn encode(value: f64) -> i32 {
    (value * f64::from(ONE)).round() as i32
}

/// Encodes `value`, rejecting anything outside the `i32` range.
pub fn checked_encode(value: f64) -> CodecResult<i32> {
    let scaled = (value * f64::from(ONE)).round();
    if !scaled.is_finite() || scaled < f64::from(i32::MIN) || scaled > f64::from(i32::MAX) {
        return Err(CodecError::FixedOverflow { value });
    }
    Ok(scaled as i32)
}

pub fn decode(sample: i32) -> f64 {
    f64::from(sample) / f64::from(ONE)
}

pub fn encode_plane(values: &[f32]) -> CodecResult<Vec<i32>> {
    values
        .iter()
        .map(|&value| checked_encode(f64::from(value)))
        .collect()
}

/// Whether gradients up to `max_abs` can overflow the 32-bit accumulators of
/// the windowed sum-of-squares kernel for a `(2hh+1) x (2hw+1)` window.
///
/// Mirrors the kernel's arithmetic: per-sample `(g * g) >> SHIFT`, a window
/// sum, a division by `2^SHIFT`, then `(gxx - gyy)^2 + 4 * gxy^2`.
pub fn accumulation_overflows(max_abs: f64, window_hh: usize, window_hw: usize) -> bool {
    let Ok(sample) = checked_encode(max_abs.abs()) else {
        return true;
    };
    let limit = i64::from(i32::MAX);
    let sample = i64::from(sample);
    let square = sample * sample;
    if square > limit {
        return true;
    }

    let taps = ((2 * window_hh + 1) * (2 * window_hw + 1)) as i64;
    let Some(sum) = (square >> SHIFT).checked_mul(taps) else {
        return true;
    };
    if sum > limit {
        return true;
    }

    // Worst case for the discriminant: gxx = gxy = s, gyy = 0.
    let s = sum / i64::from(ONE);
    s.checked_mul(s)
        .and_then(|s2| s2.checked_mul(5))
        .map_or(true, |disc| disc > limit)
}
