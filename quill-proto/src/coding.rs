//! Coding related traits.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of fixed-width big-endian primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

/// Extension trait for reading from buffers
pub trait BufExt {
    /// Read and decode a value from the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Read a big-endian integer occupying `width` bytes (1 to 8)
    fn get_uint_be(&mut self, width: usize) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_uint_be(&mut self, width: usize) -> Result<u64> {
        debug_assert!((1..=8).contains(&width));
        if self.remaining() < width {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_uint(width))
    }
}

/// Extension trait for writing to buffers
pub trait BufMutExt {
    /// Encode and write a value to the buffer
    fn write<T: Codec>(&mut self, x: T);
    /// Write the low `width` bytes of `x` in big-endian order
    fn write_uint_be(&mut self, x: u64, width: usize);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_uint_be(&mut self, x: u64, width: usize) {
        debug_assert!((1..=8).contains(&width));
        self.put_uint(x, width);
    }
}

/// Smallest of 1, 2, 4 or 8 bytes that can hold `x`
pub(crate) fn pow2_width(x: u64) -> usize {
    if x < 1 << 8 {
        1
    } else if x < 1 << 16 {
        2
    } else if x < 1 << 32 {
        4
    } else {
        8
    }
}

/// Two-bit selector for a width produced by [`pow2_width`]
pub(crate) fn pow2_width_bits(width: usize) -> u8 {
    match width {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        _ => 0b11,
    }
}

/// Inverse of [`pow2_width_bits`]
pub(crate) fn pow2_width_from_bits(bits: u8) -> usize {
    1 << (bits & 0b11)
}
