//! Layouts that travel over the offload link.
//!
//! The shared buffer is an undifferentiated array of little-endian 32-bit
//! words; the modules here agree on where each field lives:
//! * [`trackability`] – header plus two fixed-point gradient planes and a result stream.
//! * [`matmul`] – two square operand matrices followed by the product.
//! * [`control`] – tagged two-word messages multiplexed over one doorbell event.
//! * [`fixed`] – the `2^SHIFT` fixed-point convention shared by both sides.

pub mod control;
mod error;
pub mod fixed;
pub mod matmul;
pub mod trackability;
pub mod words;

pub use error::{CodecError, CodecResult};
