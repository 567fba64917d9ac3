// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level reading and writing of H.264 RBSPs.

use std::io::Write;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("exp-golomb code does not fit in 32 bits")]
    GolombOverflow,
    #[error("value out of bounds: expected {min} - {max}, got {value}")]
    OutOfBounds { value: i64, min: i64, max: i64 },
}

pub type ReadBitsResult<T> = std::result::Result<T, ReadBitsError>;

/// Reads bits, most significant first, from an RBSP. When `strip_epb` is set, the `0x03` of
/// every `0x000003` sequence is skipped.
#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Next byte of `data` to load.
    offset: usize,
    /// Loaded bits not read yet, right-aligned.
    cache: u64,
    cached_bits: usize,
    /// Number of zero bytes loaded in a row.
    zeros: u8,
    strip_epb: bool,
    epb_count: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], strip_epb: bool) -> Self {
        Self {
            data,
            offset: 0,
            cache: 0,
            cached_bits: 0,
            zeros: 0,
            strip_epb,
            epb_count: 0,
        }
    }

    fn next_byte(&mut self) -> ReadBitsResult<u8> {
        let byte = *self.data.get(self.offset).ok_or(ReadBitsError::OutOfBits)?;
        self.offset += 1;
        Ok(byte)
    }

    fn load_byte(&mut self) -> ReadBitsResult<()> {
        let mut byte = self.next_byte()?;

        if self.strip_epb && self.zeros >= 2 && byte == 0x03 {
            self.epb_count += 1;
            byte = self.next_byte()?;
            self.zeros = 0;
        }

        self.zeros = if byte == 0x00 {
            self.zeros.saturating_add(1)
        } else {
            0
        };
        self.cache = (self.cache << 8) | u64::from(byte);
        self.cached_bits += 8;

        Ok(())
    }

    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Reads `num_bits` bits, at most 31.
    pub fn read_bits(&mut self, num_bits: usize) -> ReadBitsResult<u32> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        while self.cached_bits < num_bits {
            self.load_byte()?;
        }

        self.cached_bits -= num_bits;
        let value = (self.cache >> self.cached_bits) & ((1u64 << num_bits) - 1);
        self.cache &= (1u64 << self.cached_bits) - 1;

        Ok(value as u32)
    }

    pub fn skip_bits(&mut self, num_bits: usize) -> ReadBitsResult<()> {
        let mut left = num_bits;
        while left > 0 {
            let chunk = left.min(31);
            self.read_bits(chunk)?;
            left -= chunk;
        }

        Ok(())
    }

    /// Reads an unsigned Exp-Golomb code (9.1).
    pub fn read_ue(&mut self) -> ReadBitsResult<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ReadBitsError::GolombOverflow);
            }
        }

        let suffix = u64::from(self.read_bits(leading_zeros)?);
        u32::try_from((1u64 << leading_zeros) - 1 + suffix)
            .map_err(|_| ReadBitsError::GolombOverflow)
    }

    /// Reads an unsigned Exp-Golomb code and checks it is not above `max`.
    pub fn read_ue_max(&mut self, max: u32) -> ReadBitsResult<u32> {
        match self.read_ue()? {
            value if value <= max => Ok(value),
            value => Err(ReadBitsError::OutOfBounds {
                value: value.into(),
                min: 0,
                max: max.into(),
            }),
        }
    }

    /// Reads a signed Exp-Golomb code (9.1.1). Even codes are non-positive.
    pub fn read_se(&mut self) -> ReadBitsResult<i32> {
        let code = i64::from(self.read_ue()?);
        let value = match code % 2 {
            0 => -(code / 2),
            _ => (code + 1) / 2,
        };

        i32::try_from(value).map_err(|_| ReadBitsError::GolombOverflow)
    }

    /// Number of emulation prevention bytes skipped so far.
    pub fn num_epb(&self) -> usize {
        self.epb_count
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Writes bits, most significant first. Whatever is left of an incomplete byte is padded with
/// zeros on [`BitWriter::flush`] or drop.
pub struct BitWriter<W: Write> {
    out: W,
    /// Bits of the incomplete byte, right-aligned.
    partial: u8,
    partial_bits: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            partial: 0,
            partial_bits: 0,
        }
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.partial = (self.partial << 1) | u8::from(bit);
        self.partial_bits += 1;

        if self.partial_bits == 8 {
            self.out.write_all(&[self.partial])?;
            self.partial = 0;
            self.partial_bits = 0;
        }

        Ok(())
    }

    /// Writes the `bits` low bits of `value`. Returns the number of bits written.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let value = u64::from(value.into());
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 != 0)?;
        }

        Ok(bits)
    }

    /// Writes an unsigned Exp-Golomb code. Returns the number of bits written.
    pub fn write_ue(&mut self, value: u32) -> BitWriterResult<usize> {
        let code = u64::from(value) + 1;
        let significant = 64 - code.leading_zeros() as usize;

        for _ in 1..significant {
            self.write_bit(false)?;
        }
        for shift in (0..significant).rev() {
            self.write_bit((code >> shift) & 1 != 0)?;
        }

        Ok(2 * significant - 1)
    }

    /// Writes a signed Exp-Golomb code. Returns the number of bits written.
    pub fn write_se(&mut self, value: i32) -> BitWriterResult<usize> {
        let code = match value {
            v if v > 0 => v.unsigned_abs() * 2 - 1,
            v => v.unsigned_abs() * 2,
        };

        self.write_ue(code)
    }

    /// Writes `rbsp_trailing_bits()`.
    pub fn write_trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while self.partial_bits != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Pads the incomplete byte, if any, and flushes the underlying writer.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.partial_bits != 0 {
            let byte = self.partial << (8 - self.partial_bits);
            self.out.write_all(&[byte])?;
            self.partial = 0;
            self.partial_bits = 0;
        }

        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("cannot flush bit writer: {}", e);
        }
    }
}
