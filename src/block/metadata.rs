//! Metadata Block Bodies
//!
//! Mutable blocks that are persisted and tiered as whole images:
//! - [`Bitmap`]: fixed-size allocation bitmap
//! - [`MetadataImage`]: variable-size image for directory and index blocks
//!
//! Unlike segments these never become immutable, so every tiering uploads
//! the full current image.

use std::fs::File;
use std::io;

use bytes::Bytes;
use parking_lot::RwLock;

use super::write_at;
use crate::error::{Error, Result};

fn write_image(file: &File, image: &[u8]) -> io::Result<usize> {
    write_at(file, 0, image)?;
    file.set_len(image.len() as u64)?;
    Ok(image.len())
}

// =============================================================================
// Bitmap
// =============================================================================

/// Fixed-size allocation bitmap
pub struct Bitmap {
    bits: RwLock<Vec<u8>>,
}

impl Bitmap {
    /// Create an all-clear bitmap of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            bits: RwLock::new(vec![0u8; size]),
        }
    }

    /// Number of addressable bits
    pub fn bit_len(&self) -> u64 {
        self.bits.read().len() as u64 * 8
    }

    /// Set the lowest clear bit and return its index
    pub fn allocate(&self) -> Option<u64> {
        let mut bits = self.bits.write();
        let (byte_idx, byte) = bits.iter_mut().enumerate().find(|(_, b)| **b != 0xff)?;
        let bit = byte.trailing_ones();
        *byte |= 1 << bit;
        Some(byte_idx as u64 * 8 + bit as u64)
    }

    /// Clear `bit`, returning whether it was set
    pub fn clear(&self, bit: u64) -> Result<bool> {
        let mut bits = self.bits.write();
        let (byte, mask) = Self::locate(&bits, bit)?;
        let was_set = bits[byte] & mask != 0;
        bits[byte] &= !mask;
        Ok(was_set)
    }

    /// Test `bit`
    pub fn is_set(&self, bit: u64) -> Result<bool> {
        let bits = self.bits.read();
        let (byte, mask) = Self::locate(&bits, bit)?;
        Ok(bits[byte] & mask != 0)
    }

    /// Number of set bits
    pub fn count_set(&self) -> u64 {
        self.bits.read().iter().map(|b| b.count_ones() as u64).sum()
    }

    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits.read())
    }

    pub(crate) fn fill(&self, bytes: &[u8]) -> usize {
        let mut bits = self.bits.write();
        let n = bytes.len().min(bits.len());
        bits[..n].copy_from_slice(&bytes[..n]);
        bits[n..].fill(0);
        bits.len()
    }

    pub(crate) fn write_to(&self, file: &File) -> io::Result<usize> {
        write_image(file, &self.bits.read())
    }

    fn locate(bits: &[u8], bit: u64) -> Result<(usize, u8)> {
        let byte = (bit / 8) as usize;
        if byte >= bits.len() {
            return Err(Error::InvalidOffset {
                offset: byte,
                expected: bits.len(),
            });
        }
        Ok((byte, 1 << (bit % 8)))
    }
}

// =============================================================================
// Metadata Image
// =============================================================================

/// Variable-size metadata image
pub struct MetadataImage {
    image: RwLock<Vec<u8>>,
}

impl Default for MetadataImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataImage {
    pub fn new() -> Self {
        Self {
            image: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.image.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite or extend the image at `offset`
    ///
    /// `offset` may be at most the current length; the image has no holes.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut image = self.image.write();
        if offset > image.len() {
            return Err(Error::InvalidOffset {
                offset,
                expected: image.len(),
            });
        }
        let end = offset + data.len();
        if end > image.len() {
            image.resize(end, 0);
        }
        image[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Shrink the image to `len` bytes
    pub fn truncate(&self, len: usize) {
        self.image.write().truncate(len);
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let image = self.image.read();
        if offset >= image.len() {
            return 0;
        }
        let n = dst.len().min(image.len() - offset);
        dst[..n].copy_from_slice(&image[offset..offset + n]);
        n
    }

    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.image.read())
    }

    pub(crate) fn fill(&self, bytes: &[u8]) -> usize {
        let mut image = self.image.write();
        image.clear();
        image.extend_from_slice(bytes);
        image.len()
    }

    pub(crate) fn write_to(&self, file: &File) -> io::Result<usize> {
        write_image(file, &self.image.read())
    }
}
