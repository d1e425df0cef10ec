//! Square integer matrix multiply payload.
//!
//! The buffer carries A at word 0, B at word `n*n` and the product at word
//! `2*n*n`, all row-major. The product region is pre-filled with
//! [`PRODUCT_SENTINEL`] so an untouched result is recognisable. A product
//! made only of sentinel values is therefore read back as an error.

use crate::words::{Words, WordsMut, WORD_BYTES};
use crate::{CodecError, CodecResult};

pub const PRODUCT_SENTINEL: i32 = 888;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixLayout {
    n: usize,
}

impl MatrixLayout {
    pub fn new(n: usize) -> CodecResult<Self> {
        if n == 0 {
            return Err(CodecError::InvalidGeometry("matrix size must be non-zero"));
        }
        if n.checked_mul(n).and_then(|e| e.checked_mul(3 * WORD_BYTES)).is_none() {
            return Err(CodecError::InvalidGeometry("matrix size overflows"));
        }
        Ok(Self { n })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn elements(&self) -> usize {
        self.n * self.n
    }

    pub fn a(&self) -> usize {
        0
    }

    pub fn b(&self) -> usize {
        self.elements()
    }

    pub fn product(&self) -> usize {
        2 * self.elements()
    }

    pub fn words(&self) -> usize {
        3 * self.elements()
    }

    pub fn bytes(&self) -> usize {
        self.words() * WORD_BYTES
    }
}

/// Writes both operands and seeds the product. Nothing is written unless
/// the payload fits.
pub fn pack(layout: &MatrixLayout, a: &[i32], b: &[i32], buf: &mut [u8]) -> CodecResult<()> {
    for operand in [a, b] {
        if operand.len() != layout.elements() {
            return Err(CodecError::PlaneSize {
                expected: layout.elements(),
                actual: operand.len(),
            });
        }
    }
    if layout.bytes() > buf.len() {
        return Err(CodecError::CapacityExceeded {
            required: layout.bytes(),
            available: buf.len(),
        });
    }

    let mut words = WordsMut::new(buf);
    words.put(layout.a(), a)?;
    words.put(layout.b(), b)?;
    words.put(
        layout.product(),
        &vec![PRODUCT_SENTINEL; layout.elements()],
    )?;
    Ok(())
}

/// Reads the product region. Fails if the kernel never wrote it.
pub fn unpack_product(layout: &MatrixLayout, buf: &[u8]) -> CodecResult<Vec<i32>> {
    let product = Words::new(buf).range(layout.product(), layout.elements())?;
    if product.iter().all(|&word| word == PRODUCT_SENTINEL) {
        return Err(CodecError::ResultNotWritten {
            offset: layout.product(),
        });
    }
    Ok(product)
}
